// =============================================================================
// Operator API — status and control surface for the running engine
// =============================================================================

pub mod auth;
pub mod rest;
