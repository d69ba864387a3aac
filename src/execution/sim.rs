// =============================================================================
// Sim Broker — deterministic bar-driven matching for dry-run and tests
// =============================================================================
//
// Matching rules per closed bar:
//   - a resting buy fills when bar.low <= its price
//   - a resting sell fills when bar.high >= its price
//   - inner-first: candidates sort by distance from the bar close
//   - at most max_fills_per_bar orders fill per bar
//   - with partial fills enabled the first touch fills partial_fill_ratio of
//     the remaining quantity
//
// Resting limit fills pay the maker fee at the limit price. IOC orders fill
// immediately at their price plus slippage and pay the taker fee. Everything
// is deterministic so the end-to-end scenarios can assert exact numbers.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::{FeesConfig, SimConfig};
use crate::execution::{ExecError, FillEvent};
use crate::market_data::Candle;
use crate::types::{GridOrder, OrderStatus, Side};

pub struct SimBroker {
    config: SimConfig,
    fees: FeesConfig,
    open: HashMap<String, GridOrder>,
    pending_fills: Vec<FillEvent>,
}

impl SimBroker {
    pub fn new(config: &SimConfig, fees: &FeesConfig) -> Self {
        Self {
            config: config.clone(),
            fees: fees.clone(),
            open: HashMap::new(),
            pending_fills: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Adapter surface
    // -------------------------------------------------------------------------

    pub fn place_order(&mut self, order: &GridOrder) -> Result<String, ExecError> {
        if self.open.contains_key(&order.client_order_id) {
            return Err(ExecError::Duplicate(order.client_order_id.clone()));
        }
        let exchange_id = Uuid::new_v4().to_string();
        let mut resting = order.clone();
        resting.exchange_order_id = Some(exchange_id.clone());
        resting.status = OrderStatus::Open;
        resting.remaining_qty = resting.qty;
        self.open.insert(order.client_order_id.clone(), resting);
        Ok(exchange_id)
    }

    pub fn cancel_order(&mut self, client_order_id: &str) -> bool {
        self.open.remove(client_order_id).is_some()
    }

    pub fn cancel_all(&mut self, symbol: &str) -> usize {
        let before = self.open.len();
        self.open.retain(|_, order| order.symbol != symbol);
        before - self.open.len()
    }

    pub fn open_order_count(&self) -> usize {
        self.open.len()
    }

    /// IOC reduce-only: fills immediately at price + slippage, taker fee.
    pub fn place_ioc_reduce(
        &mut self,
        symbol: &str,
        side: Side,
        qty: f64,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<String, ExecError> {
        if qty <= 0.0 {
            return Err(ExecError::Rejected("zero_qty".to_string()));
        }
        let exchange_id = Uuid::new_v4().to_string();
        let slip = price * self.config.slippage_bps / 10_000.0;
        let fill_price = match side {
            Side::Buy => price + slip,
            Side::Sell => price - slip,
        };
        let fee = fill_price * qty * self.fees.taker_fee_bps / 10_000.0;

        self.pending_fills.push(FillEvent {
            symbol: symbol.to_string(),
            client_order_id: format!("ioc_{exchange_id}"),
            exchange_order_id: exchange_id.clone(),
            side,
            fill_price,
            fill_qty: qty,
            fee,
            fee_currency: "USDT".to_string(),
            is_partial: false,
            remaining_qty: 0.0,
            timestamp: now,
        });
        Ok(exchange_id)
    }

    pub fn drain_pending_fills(&mut self) -> Vec<FillEvent> {
        std::mem::take(&mut self.pending_fills)
    }

    // -------------------------------------------------------------------------
    // Bar matching
    // -------------------------------------------------------------------------

    /// Match resting orders against one closed bar.
    pub fn on_bar_close(&mut self, candle: &Candle, now: DateTime<Utc>) -> Vec<FillEvent> {
        // Candidates that the bar range touched, inner-first.
        let mut touched: Vec<GridOrder> = self
            .open
            .values()
            .filter(|order| match order.side {
                Side::Buy => candle.low <= order.price,
                Side::Sell => candle.high >= order.price,
            })
            .cloned()
            .collect();
        touched.sort_by(|a, b| {
            let da = (a.price - candle.close).abs();
            let db = (b.price - candle.close).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut fills = Vec::new();
        for order in touched.into_iter().take(self.config.max_fills_per_bar) {
            let entry = self
                .open
                .get_mut(&order.client_order_id)
                .expect("touched order is open");

            let (fill_qty, is_partial) = if self.config.partial_fill_enabled
                && entry.filled_qty == 0.0
                && self.config.partial_fill_ratio < 1.0
            {
                (entry.remaining_qty * self.config.partial_fill_ratio, true)
            } else {
                (entry.remaining_qty, false)
            };

            entry.filled_qty += fill_qty;
            entry.remaining_qty -= fill_qty;
            let remaining = entry.remaining_qty;
            entry.status = if is_partial {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            };

            let fee = entry.price * fill_qty * self.fees.maker_fee_bps / 10_000.0;
            debug!(
                client_order_id = %entry.client_order_id,
                side = %entry.side,
                price = entry.price,
                fill_qty,
                is_partial,
                "sim fill"
            );

            fills.push(FillEvent {
                symbol: entry.symbol.clone(),
                client_order_id: entry.client_order_id.clone(),
                exchange_order_id: entry.exchange_order_id.clone().unwrap_or_default(),
                side: entry.side,
                fill_price: entry.price,
                fill_qty,
                fee,
                fee_currency: "USDT".to_string(),
                is_partial,
                remaining_qty: remaining,
                timestamp: now,
            });

            if !is_partial {
                self.open.remove(&order.client_order_id);
            }
        }

        fills
    }
}
