// =============================================================================
// Snapshot — full state capture at decision time
// =============================================================================
//
// Attached to every audit event that asserts a fact (all risk triggers and
// state changes), so that any decision can be replayed from the journal
// alone.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Regime;

/// Summary of the live order set at decision time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrdersSummary {
    pub total_count: usize,
    pub buy_count: usize,
    pub sell_count: usize,
    pub reduce_only_count: usize,
    /// Distance from the mark price to the farthest order on each side.
    pub max_buy_distance: f64,
    pub max_sell_distance: f64,
    pub total_buy_notional: f64,
    pub total_sell_notional: f64,
}

/// Complete state snapshot for audit records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,

    pub mark_price: f64,
    pub last_price: f64,

    pub state: Regime,

    pub inventory_ratio: f64,
    pub position_qty: f64,
    pub breakeven_price: f64,

    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,

    pub margin_usage: f64,
    /// Absent when the venue has not reported a liquidation price.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub liq_distance: Option<f64>,

    pub outer_range_low: f64,
    pub outer_range_high: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub core_zone: Option<(f64, f64)>,

    pub active_orders: OrdersSummary,

    pub atr: f64,
    pub rv: f64,
    pub vol_spike: bool,

    pub structural_break_confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outside_since: Option<DateTime<Utc>>,

    pub config_hash: String,
    pub session_id: String,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            mark_price: 0.0,
            last_price: 0.0,
            state: Regime::Normal,
            inventory_ratio: 0.0,
            position_qty: 0.0,
            breakeven_price: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            equity: 0.0,
            margin_usage: 0.0,
            liq_distance: None,
            outer_range_low: 0.0,
            outer_range_high: 0.0,
            core_zone: None,
            active_orders: OrdersSummary::default(),
            atr: 0.0,
            rv: 0.0,
            vol_spike: false,
            structural_break_confirmed: false,
            outside_since: None,
            config_hash: String::new(),
            session_id: String::new(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_omitted_when_absent() {
        let snap = Snapshot::default();
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("liq_distance").is_none());
        assert!(json.get("core_zone").is_none());
        assert!(json.get("outside_since").is_none());
        assert_eq!(json["state"], "Normal");
    }

    #[test]
    fn roundtrip_with_optionals_present() {
        let mut snap = Snapshot::default();
        snap.liq_distance = Some(0.12);
        snap.core_zone = Some((83_000.0, 87_000.0));

        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.liq_distance, Some(0.12));
        assert_eq!(back.core_zone, Some((83_000.0, 87_000.0)));
    }
}
