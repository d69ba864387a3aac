// =============================================================================
// Shared types used across the Lattice grid engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Instrument class the engine trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Swap,
}

impl Default for MarketType {
    fn default() -> Self {
        Self::Swap
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Swap => write!(f, "swap"),
        }
    }
}

/// Whether the engine routes orders to the venue or to the local sim broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    DryRun,
    Live,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "dry-run"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Lifecycle status of a grid order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    /// Cancellation was issued but never acknowledged by the venue.
    Stuck,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Stuck => "stuck",
        };
        write!(f, "{s}")
    }
}

/// A single rung of the grid, as the engine intends it to exist on the venue.
///
/// Identity is the client order ID, which is deterministic per rung and serves
/// as both the idempotency key for placement and the correlation key for
/// fills. The exchange-side ID is only learned after placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridOrder {
    pub client_order_id: String,
    #[serde(default)]
    pub exchange_order_id: Option<String>,

    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub qty: f64,
    #[serde(default)]
    pub reduce_only: bool,

    /// Grid level index: negative below center (buys), positive above (sells).
    pub grid_level: i32,
    pub session_id: String,

    pub status: OrderStatus,
    #[serde(default)]
    pub filled_qty: f64,
    #[serde(default)]
    pub remaining_qty: f64,
    #[serde(default)]
    pub avg_fill_price: f64,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// Whether the rung price falls inside the current core zone.
    #[serde(default)]
    pub in_core: bool,
}

impl GridOrder {
    /// True while the order can still fill on the venue.
    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    /// Notional value in quote currency.
    pub fn notional(&self) -> f64 {
        self.price * self.qty
    }

    /// Build the deterministic client order ID for a rung.
    ///
    /// Format: `{session_id}_L{level:02}_{side}_{seq:03}`,
    /// e.g. `s20250629_143000_L05_buy_001`.
    pub fn make_client_order_id(session_id: &str, level: i32, side: Side, seq: u32) -> String {
        format!("{}_L{:02}_{}_{:03}", session_id, level.abs(), side, seq)
    }
}

/// Mint a session identifier from a timestamp: `s{YYYYMMDD_HHMMSS}`.
///
/// Minted once at engine start; a re-anchor rotates to a fresh one. The id is
/// embedded in every audit record and client order ID.
pub fn session_id_at(ts: DateTime<Utc>) -> String {
    format!("s{}", ts.format("%Y%m%d_%H%M%S"))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn client_order_id_format() {
        let id = GridOrder::make_client_order_id("s20250629_143000", -5, Side::Buy, 1);
        assert_eq!(id, "s20250629_143000_L05_buy_001");

        let id = GridOrder::make_client_order_id("s20250629_143000", 12, Side::Sell, 42);
        assert_eq!(id, "s20250629_143000_L12_sell_042");
    }

    #[test]
    fn session_id_format() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 29, 14, 30, 0).unwrap();
        assert_eq!(session_id_at(ts), "s20250629_143000");
    }

    #[test]
    fn side_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"buy\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"sell\"");
    }

    #[test]
    fn order_status_open_states() {
        let mut order = GridOrder {
            client_order_id: "x".into(),
            exchange_order_id: None,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            price: 85_000.0,
            qty: 0.001,
            reduce_only: false,
            grid_level: -1,
            session_id: "s".into(),
            status: OrderStatus::Open,
            filled_qty: 0.0,
            remaining_qty: 0.001,
            avg_fill_price: 0.0,
            created_at: Utc::now(),
            updated_at: None,
            in_core: true,
        };
        assert!(order.is_open());
        order.status = OrderStatus::PartiallyFilled;
        assert!(order.is_open());
        order.status = OrderStatus::Cancelled;
        assert!(!order.is_open());
    }
}
