// =============================================================================
// Execution — broker surface shared by the sim matcher and the live venue
// =============================================================================
//
// The decision core talks to one `Broker` enum; dry-run wires the sim
// matcher, live wires the Bitget client. Errors are classified so the caller
// can distinguish retry-worthy transport failures from structured business
// refusals: transients are retried inside the live client and only surface
// after exhaustion, at which point the risk engine's api-fault counter
// advances.
// =============================================================================

pub mod bitget;
pub mod sim;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ExitConfig;
use crate::market_data::Candle;
use crate::types::{GridOrder, Side};

pub use bitget::LiveBroker;
pub use sim::SimBroker;

/// A fill reported by the venue (or the sim matcher).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub symbol: String,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub side: Side,
    pub fill_price: f64,
    pub fill_qty: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub is_partial: bool,
    pub remaining_qty: f64,
    pub timestamp: DateTime<Utc>,
}

/// Classified execution failure.
#[derive(Debug, Clone)]
pub enum ExecError {
    /// Rate limit / transient network; retried before surfacing.
    Transient(String),
    /// Venue refused the order; no retry.
    Rejected(String),
    /// Client order ID already known to the venue.
    Duplicate(String),
    InsufficientMargin(String),
    Fatal(String),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient: {msg}"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Duplicate(msg) => write!(f, "duplicate: {msg}"),
            Self::InsufficientMargin(msg) => write!(f, "insufficient_margin: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for ExecError {}

impl ExecError {
    /// Whether the failure consumed the retry budget (and should advance the
    /// api-fault counter).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The execution adapter behind the decision core.
pub enum Broker {
    Sim(SimBroker),
    Live(LiveBroker),
}

impl Broker {
    pub fn is_sim(&self) -> bool {
        matches!(self, Self::Sim(_))
    }

    pub fn supports_reduce_only(&self) -> bool {
        match self {
            Self::Sim(_) => true,
            Self::Live(live) => live.supports_reduce_only(),
        }
    }

    pub async fn place_order(&mut self, order: &GridOrder) -> Result<String, ExecError> {
        match self {
            Self::Sim(sim) => sim.place_order(order),
            Self::Live(live) => live.place_order(order).await,
        }
    }

    pub async fn cancel_order(&mut self, client_order_id: &str) -> Result<bool, ExecError> {
        match self {
            Self::Sim(sim) => Ok(sim.cancel_order(client_order_id)),
            Self::Live(live) => live.cancel_order(client_order_id).await,
        }
    }

    pub async fn cancel_all(&mut self, symbol: &str) -> Result<usize, ExecError> {
        match self {
            Self::Sim(sim) => Ok(sim.cancel_all(symbol)),
            Self::Live(live) => live.cancel_all(symbol).await,
        }
    }

    /// Immediate-or-cancel reduce-only order, used by the reduction routines.
    pub async fn place_ioc_reduce(
        &mut self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<String, ExecError> {
        match self {
            Self::Sim(sim) => sim.place_ioc_reduce(symbol, side, qty, price, now),
            Self::Live(live) => live.place_ioc_reduce(symbol, side, qty, price).await,
        }
    }

    /// Sim-only bar matching; the live variant reports nothing here.
    pub fn on_bar_close(&mut self, candle: &Candle, now: DateTime<Utc>) -> Vec<FillEvent> {
        match self {
            Self::Sim(sim) => sim.on_bar_close(candle, now),
            Self::Live(_) => Vec::new(),
        }
    }

    /// Drain fills: sim IOC fills, or live fills polled from the venue.
    pub async fn poll_fills(&mut self) -> Result<Vec<FillEvent>, ExecError> {
        match self {
            Self::Sim(sim) => Ok(sim.drain_pending_fills()),
            Self::Live(live) => live.poll_fills().await,
        }
    }
}

/// Layered-IOC emergency exit with market fallback.
///
/// Slices the position across `ioc_layers` reduce-only IOC orders stepping
/// `layer_step_pct` through the book, then sweeps any remainder with a
/// deep-priced IOC when `market_fallback` is on. Returns a result label for
/// the `emergency_stop` audit.
pub async fn emergency_exit(
    broker: &mut Broker,
    symbol: &str,
    position_qty: f64,
    mark_price: f64,
    config: &ExitConfig,
    now: DateTime<Utc>,
) -> String {
    if position_qty.abs() < 1e-12 {
        return "no_position".to_string();
    }
    if mark_price <= 0.0 {
        return "no_mark_price".to_string();
    }

    // Long positions exit with sells stepped below the mark, shorts mirror.
    let (side, direction) = if position_qty > 0.0 {
        (Side::Sell, -1.0)
    } else {
        (Side::Buy, 1.0)
    };
    let total = position_qty.abs();
    let layers = config.ioc_layers.max(1);
    let slice = total / layers as f64;

    let mut placed = 0u32;
    for layer in 0..layers {
        let price = mark_price * (1.0 + direction * config.layer_step_pct * (layer + 1) as f64);
        match broker.place_ioc_reduce(symbol, side, slice, price, now).await {
            Ok(_) => placed += 1,
            Err(e) => {
                tracing::warn!(layer, error = %e, "emergency exit slice failed");
            }
        }
    }

    if placed == layers {
        format!("ioc_layered:{placed}/{layers}")
    } else if config.market_fallback {
        // Sweep whatever is left with a deep crossing price.
        let sweep_price =
            mark_price * (1.0 + direction * config.layer_step_pct * (layers + 5) as f64);
        let remainder = slice * (layers - placed) as f64;
        match broker
            .place_ioc_reduce(symbol, side, remainder, sweep_price, now)
            .await
        {
            Ok(_) => format!("ioc_layered:{placed}/{layers}+market_fallback"),
            Err(e) => format!("ioc_layered:{placed}/{layers}+fallback_failed:{e}"),
        }
    } else {
        format!("ioc_layered:{placed}/{layers}:incomplete")
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeesConfig, SimConfig};

    #[tokio::test]
    async fn emergency_exit_flattens_long_in_sim() {
        let mut broker = Broker::Sim(SimBroker::new(&SimConfig::default(), &FeesConfig::default()));
        let now = Utc::now();

        let result =
            emergency_exit(&mut broker, "BTCUSDT", 0.003, 85_000.0, &ExitConfig::default(), now)
                .await;
        assert_eq!(result, "ioc_layered:3/3");

        let fills = broker.poll_fills().await.unwrap();
        assert_eq!(fills.len(), 3);
        let total: f64 = fills.iter().map(|f| f.fill_qty).sum();
        assert!((total - 0.003).abs() < 1e-12);
        assert!(fills.iter().all(|f| f.side == Side::Sell));
        // Slices step down through the book.
        assert!(fills[0].fill_price > fills[2].fill_price);
    }

    #[tokio::test]
    async fn emergency_exit_noop_when_flat() {
        let mut broker = Broker::Sim(SimBroker::new(&SimConfig::default(), &FeesConfig::default()));
        let result =
            emergency_exit(&mut broker, "BTCUSDT", 0.0, 85_000.0, &ExitConfig::default(), Utc::now())
                .await;
        assert_eq!(result, "no_position");
    }
}
