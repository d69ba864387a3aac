// =============================================================================
// Audit Events — closed taxonomy of everything the engine must explain
// =============================================================================
//
// Every event carries the session id, a timestamp, and a free-form reason.
// Kind-specific fields are optional at the type level but mandatory per kind:
// `required_fields_ok` encodes the per-kind schema and the journal refuses to
// write an event that fails it. Events that assert a fact about the market or
// the account (risk triggers, stops, state changes) must carry a snapshot.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Closed set of audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    StateChange,
    RiskTrigger,
    InventoryStop,
    RiskBudgetStop,
    StructuralStop,
    EmergencyStop,
    OrderBlocked,
    OrderDuplicateBlocked,
    OrderStuck,
    CancelRateExceeded,
    ParamUpdate,
    ReanchorRequest,
    ReanchorApproved,
    ReanchorRejected,
    ConfigInvalid,
    DataUnavailable,
    DuplicateEvent,
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde snake_case rendering doubles as the display name.
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// One audit record. Serialised as a single JSON object per journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "session")]
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    pub reason: String,

    // State-change fields.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_state: Option<String>,

    // Risk-trigger fields.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trigger_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trigger_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub threshold: Option<f64>,

    // Order fields.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub order_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub order_id: Option<String>,

    // Param-update fields.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub param_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config_hash: Option<String>,

    // Re-anchor fields.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_range: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_range: Option<(f64, f64)>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub new_session_id: Option<String>,

    // Emergency-exit fields.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exit_result: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub snapshot: Option<Snapshot>,

    #[serde(skip_serializing_if = "serde_json::Map::is_empty", default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    fn base(session_id: &str, timestamp: DateTime<Utc>, kind: AuditKind, reason: &str) -> Self {
        Self {
            timestamp,
            session_id: session_id.to_string(),
            kind,
            reason: reason.to_string(),
            from_state: None,
            to_state: None,
            trigger_type: None,
            trigger_value: None,
            threshold: None,
            order_type: None,
            order_id: None,
            param_name: None,
            old_value: None,
            new_value: None,
            config_hash: None,
            old_range: None,
            new_range: None,
            new_session_id: None,
            exit_method: None,
            exit_result: None,
            snapshot: None,
            details: serde_json::Map::new(),
        }
    }

    pub fn state_change(
        session_id: &str,
        timestamp: DateTime<Utc>,
        from_state: &str,
        to_state: &str,
        reason: &str,
        snapshot: Snapshot,
    ) -> Self {
        let mut ev = Self::base(session_id, timestamp, AuditKind::StateChange, reason);
        ev.from_state = Some(from_state.to_string());
        ev.to_state = Some(to_state.to_string());
        ev.snapshot = Some(snapshot);
        ev
    }

    pub fn risk_trigger(
        session_id: &str,
        timestamp: DateTime<Utc>,
        trigger_type: &str,
        value: f64,
        threshold: f64,
        reason: &str,
        snapshot: Snapshot,
    ) -> Self {
        let mut ev = Self::base(session_id, timestamp, AuditKind::RiskTrigger, reason);
        ev.trigger_type = Some(trigger_type.to_string());
        ev.trigger_value = Some(value);
        ev.threshold = Some(threshold);
        ev.snapshot = Some(snapshot);
        ev
    }

    /// A named stop event (inventory / risk-budget / structural / emergency).
    pub fn stop(
        kind: AuditKind,
        session_id: &str,
        timestamp: DateTime<Utc>,
        trigger_type: &str,
        value: f64,
        threshold: f64,
        reason: &str,
        snapshot: Snapshot,
    ) -> Self {
        let mut ev = Self::base(session_id, timestamp, kind, reason);
        ev.trigger_type = Some(trigger_type.to_string());
        ev.trigger_value = Some(value);
        ev.threshold = Some(threshold);
        ev.snapshot = Some(snapshot);
        ev
    }

    pub fn order_blocked(
        session_id: &str,
        timestamp: DateTime<Utc>,
        order_type: &str,
        state: &str,
        reason: &str,
    ) -> Self {
        let mut ev = Self::base(session_id, timestamp, AuditKind::OrderBlocked, reason);
        ev.order_type = Some(order_type.to_string());
        ev.to_state = Some(state.to_string());
        ev
    }

    pub fn duplicate_blocked(
        session_id: &str,
        timestamp: DateTime<Utc>,
        client_order_id: &str,
    ) -> Self {
        let mut ev = Self::base(
            session_id,
            timestamp,
            AuditKind::OrderDuplicateBlocked,
            "duplicate_order",
        );
        ev.order_id = Some(client_order_id.to_string());
        ev
    }

    pub fn order_stuck(
        session_id: &str,
        timestamp: DateTime<Utc>,
        client_order_id: &str,
        reason: &str,
    ) -> Self {
        let mut ev = Self::base(session_id, timestamp, AuditKind::OrderStuck, reason);
        ev.order_id = Some(client_order_id.to_string());
        ev
    }

    pub fn cancel_rate_exceeded(
        session_id: &str,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> Self {
        Self::base(session_id, timestamp, AuditKind::CancelRateExceeded, reason)
    }

    pub fn param_update(
        session_id: &str,
        timestamp: DateTime<Utc>,
        param_name: &str,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
        config_hash: &str,
        reason: &str,
    ) -> Self {
        let mut ev = Self::base(session_id, timestamp, AuditKind::ParamUpdate, reason);
        ev.param_name = Some(param_name.to_string());
        ev.old_value = Some(old_value);
        ev.new_value = Some(new_value);
        ev.config_hash = Some(config_hash.to_string());
        ev
    }

    pub fn config_invalid(
        session_id: &str,
        timestamp: DateTime<Utc>,
        config_hash: &str,
        violations: &[String],
    ) -> Self {
        let mut ev = Self::base(
            session_id,
            timestamp,
            AuditKind::ConfigInvalid,
            "config validation failed",
        );
        ev.config_hash = Some(config_hash.to_string());
        ev.details.insert(
            "violations".to_string(),
            serde_json::json!(violations.to_vec()),
        );
        ev
    }

    pub fn data_unavailable(
        session_id: &str,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> Self {
        Self::base(session_id, timestamp, AuditKind::DataUnavailable, reason)
    }

    /// Per-kind required-field schema. The journal refuses events for which
    /// this returns false.
    pub fn required_fields_ok(&self) -> bool {
        match self.kind {
            AuditKind::StateChange => {
                self.from_state.is_some() && self.to_state.is_some() && self.snapshot.is_some()
            }
            AuditKind::RiskTrigger
            | AuditKind::InventoryStop
            | AuditKind::RiskBudgetStop
            | AuditKind::StructuralStop => {
                self.trigger_type.is_some()
                    && self.trigger_value.is_some()
                    && self.threshold.is_some()
                    && self.snapshot.is_some()
            }
            AuditKind::EmergencyStop => {
                self.trigger_type.is_some()
                    && self.exit_method.is_some()
                    && self.exit_result.is_some()
                    && self.snapshot.is_some()
            }
            AuditKind::OrderBlocked => self.order_type.is_some(),
            AuditKind::OrderDuplicateBlocked | AuditKind::OrderStuck => self.order_id.is_some(),
            AuditKind::ParamUpdate => self.param_name.is_some() && self.config_hash.is_some(),
            AuditKind::ReanchorRequest | AuditKind::ReanchorApproved => {
                self.old_range.is_some() && self.new_range.is_some()
            }
            AuditKind::ReanchorRejected => self.old_range.is_some(),
            AuditKind::ConfigInvalid => self.config_hash.is_some(),
            AuditKind::CancelRateExceeded
            | AuditKind::DataUnavailable
            | AuditKind::DuplicateEvent => true,
        }
    }
}
