// =============================================================================
// REST Endpoints — Axum 0.8
// =============================================================================
//
// Everything lives under `/api/v1/`. Health is public; status and the control
// endpoints require a valid Bearer token. The control endpoints never mutate
// engine state directly: pause/resume flip the shared flag the order-refresh
// path consults, and the emergency reset enqueues an `OperatorReset` event so
// the decision core processes it in total order with market events.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::engine::{EngineEvent, EngineStatus};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub status: Arc<RwLock<EngineStatus>>,
    pub events: UnboundedSender<EngineEvent>,
}

/// Build the operator router with CORS and shared state.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/reset-emergency", post(control_reset_emergency))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.read();
    Json(serde_json::json!({
        "status": "ok",
        "session_id": status.session_id,
        "events_processed": status.events_processed,
    }))
}

async fn status(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.read().clone();
    Json(status)
}

async fn control_pause(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    state.status.write().paused = true;
    info!("engine paused via operator API");
    Json(serde_json::json!({ "paused": true }))
}

async fn control_resume(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    state.status.write().paused = false;
    info!("engine resumed via operator API");
    Json(serde_json::json!({ "paused": false }))
}

async fn control_reset_emergency(
    _auth: AuthBearer,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if state.events.send(EngineEvent::OperatorReset).is_err() {
        warn!("operator reset dropped: engine queue closed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "engine not running" })),
        )
            .into_response();
    }
    info!("operator emergency reset requested");
    Json(serde_json::json!({ "requested": true })).into_response()
}
