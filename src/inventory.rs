// =============================================================================
// Inventory & Breakeven — the first-class risk variable and its cost basis
// =============================================================================
//
// Units:
//   position_qty            base currency (e.g. BTC), signed
//   max_inventory_notional  quote currency (e.g. USDT)
//   inventory_ratio         clamped [0, 1] = |qty * mark| / max_notional
//
// Breakeven is the fee-and-slippage-inclusive average cost of the held
// position. Funding is excluded here and accounted separately in the account
// view. Only the fill path and the price-tick path mutate these structs; all
// other components receive read-only references.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::types::Side;

// ---------------------------------------------------------------------------
// Breakeven
// ---------------------------------------------------------------------------

/// Cost-basis tracker: `price = (cost + fees + slippage) / qty` when holding.
#[derive(Debug, Clone, Default)]
pub struct Breakeven {
    total_cost: f64,
    total_qty: f64,
    total_fees: f64,
    total_slippage: f64,
}

impl Breakeven {
    /// Fee-inclusive breakeven price, or `None` when flat.
    pub fn price(&self) -> Option<f64> {
        if self.total_qty <= 0.0 {
            return None;
        }
        Some((self.total_cost + self.total_fees + self.total_slippage) / self.total_qty)
    }

    /// Average cost price excluding fees and slippage.
    pub fn avg_cost_price(&self) -> Option<f64> {
        if self.total_qty <= 0.0 {
            return None;
        }
        Some(self.total_cost / self.total_qty)
    }

    pub fn qty(&self) -> f64 {
        self.total_qty
    }

    /// Apply a fill.
    ///
    /// Buys add cost/qty/fees. Sells against an existing long scale all four
    /// accumulators by `(1 - sell_qty / qty)` and then add the new fees and
    /// slippage from the sell itself.
    pub fn update_on_fill(&mut self, side: Side, fill_price: f64, fill_qty: f64, fee: f64, slippage: f64) {
        match side {
            Side::Buy => {
                self.total_cost += fill_price * fill_qty;
                self.total_qty += fill_qty;
                self.total_fees += fee;
                self.total_slippage += slippage;
            }
            Side::Sell => {
                if self.total_qty > 0.0 {
                    let keep = 1.0 - (fill_qty / self.total_qty).min(1.0);
                    self.total_cost *= keep;
                    self.total_qty = (self.total_qty - fill_qty).max(0.0);
                    self.total_fees *= keep;
                    self.total_slippage *= keep;
                    self.total_fees += fee;
                    self.total_slippage += slippage;

                    if self.total_qty <= 0.0 {
                        self.reset();
                    }
                }
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Signed position with the clamped notional ratio and its recent history.
#[derive(Debug)]
pub struct Inventory {
    position_qty: f64,
    max_inventory_notional: f64,
    last_mark_price: f64,
    /// Recent (timestamp, ratio) samples for the slope calculation. Bounded.
    ratio_history: VecDeque<(DateTime<Utc>, f64)>,
}

const RATIO_HISTORY_CAP: usize = 512;

impl Inventory {
    pub fn new(max_inventory_notional: f64) -> Self {
        Self {
            position_qty: 0.0,
            max_inventory_notional,
            last_mark_price: 0.0,
            ratio_history: VecDeque::with_capacity(RATIO_HISTORY_CAP),
        }
    }

    pub fn position_qty(&self) -> f64 {
        self.position_qty
    }

    pub fn is_long(&self) -> bool {
        self.position_qty > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.position_qty < 0.0
    }

    /// Position notional in quote currency at the last mark price.
    pub fn notional_value(&self) -> f64 {
        self.position_qty.abs() * self.last_mark_price
    }

    /// Clamped [0, 1] ratio of notional to the configured cap.
    pub fn ratio(&self) -> f64 {
        if self.max_inventory_notional <= 0.0 {
            return 1.0;
        }
        (self.notional_value() / self.max_inventory_notional).min(1.0)
    }

    /// Ratio carrying the position sign, for skew direction decisions.
    pub fn signed_ratio(&self) -> f64 {
        if self.position_qty < 0.0 {
            -self.ratio()
        } else {
            self.ratio()
        }
    }

    /// Price-tick update: refresh the mark price and sample the ratio.
    pub fn update_price(&mut self, mark_price: f64, now: DateTime<Utc>) {
        self.last_mark_price = mark_price;
        self.push_sample(now);
    }

    /// Fill update: `position_qty_new - position_qty_old = ±fill_qty` exactly.
    pub fn update_on_fill(&mut self, side: Side, fill_qty: f64, mark_price: f64, now: DateTime<Utc>) {
        match side {
            Side::Buy => self.position_qty += fill_qty,
            Side::Sell => self.position_qty -= fill_qty,
        }
        self.last_mark_price = mark_price;
        self.push_sample(now);

        debug!(
            side = %side,
            fill_qty,
            position_qty = self.position_qty,
            ratio = self.ratio(),
            "inventory updated on fill"
        );
    }

    fn push_sample(&mut self, now: DateTime<Utc>) {
        self.ratio_history.push_back((now, self.ratio()));
        while self.ratio_history.len() > RATIO_HISTORY_CAP {
            self.ratio_history.pop_front();
        }
    }

    /// Change in ratio per minute over the lookback window. Zero when there
    /// are fewer than two samples inside the window.
    pub fn slope(&self, lookback_minutes: i64) -> f64 {
        let Some(&(end_ts, end_ratio)) = self.ratio_history.back() else {
            return 0.0;
        };
        let cutoff = end_ts - Duration::minutes(lookback_minutes);

        let Some(&(start_ts, start_ratio)) =
            self.ratio_history.iter().find(|(ts, _)| *ts >= cutoff)
        else {
            return 0.0;
        };

        let minutes = (end_ts - start_ts).num_seconds() as f64 / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        (end_ratio - start_ratio) / minutes
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_is_clamped_to_unit_interval() {
        let mut inv = Inventory::new(300.0);
        let now = Utc::now();
        // 0.01 BTC at 85k = 850 USDT notional, far above the 300 cap.
        inv.update_on_fill(Side::Buy, 0.01, 85_000.0, now);
        assert!((inv.ratio() - 1.0).abs() < f64::EPSILON);
        assert!(inv.ratio() >= 0.0 && inv.ratio() <= 1.0);
    }

    #[test]
    fn fill_changes_position_exactly() {
        let mut inv = Inventory::new(10_000.0);
        let now = Utc::now();

        inv.update_on_fill(Side::Buy, 0.0006, 84_000.0, now);
        assert!((inv.position_qty() - 0.0006).abs() < 1e-12);

        inv.update_on_fill(Side::Sell, 0.0002, 84_500.0, now);
        assert!((inv.position_qty() - 0.0004).abs() < 1e-12);
    }

    #[test]
    fn ratio_rises_by_fill_notional_fraction() {
        let mut inv = Inventory::new(300.0);
        let now = Utc::now();
        inv.update_on_fill(Side::Buy, 0.0006, 84_000.0, now);
        // 84000 * 0.0006 / 300 = 0.168
        assert!((inv.ratio() - 0.168).abs() < 1e-9);
    }

    #[test]
    fn signed_ratio_tracks_direction() {
        let mut inv = Inventory::new(1_000.0);
        let now = Utc::now();
        inv.update_on_fill(Side::Sell, 0.005, 85_000.0, now);
        assert!(inv.is_short());
        assert!(inv.signed_ratio() < 0.0);
    }

    #[test]
    fn slope_reflects_ratio_drift() {
        let mut inv = Inventory::new(1_000.0);
        let t0 = Utc::now();
        inv.update_on_fill(Side::Buy, 0.002, 85_000.0, t0);
        // Ten minutes later the position doubled.
        inv.update_on_fill(Side::Buy, 0.002, 85_000.0, t0 + Duration::minutes(10));
        let slope = inv.slope(60);
        assert!(slope > 0.0, "ratio is rising, slope should be positive: {slope}");
    }

    #[test]
    fn breakeven_single_buy_includes_fee() {
        let mut be = Breakeven::default();
        be.update_on_fill(Side::Buy, 84_000.0, 0.0006, 0.00012, 0.0);
        // (84000 * 0.0006 + 0.00012) / 0.0006 = 84000.2
        let price = be.price().unwrap();
        assert!((price - 84_000.2).abs() < 1e-6, "got {price}");
    }

    #[test]
    fn breakeven_round_trip_realized_pnl() {
        // Buy q at p1 with fee f1, sell q at p2 with fee f2: flat position and
        // realized PnL = q * (p2 - p1) - (f1 + f2).
        let (q, p1, p2, f1, f2) = (0.001, 84_000.0, 85_000.0, 0.05, 0.05);

        let mut be = Breakeven::default();
        be.update_on_fill(Side::Buy, p1, q, f1, 0.0);

        let breakeven = be.price().unwrap();
        let realized = q * (p2 - breakeven) - f2;
        let expected = q * (p2 - p1) - (f1 + f2);
        assert!(
            (realized - expected).abs() < 1e-9,
            "realized {realized} vs expected {expected}"
        );

        be.update_on_fill(Side::Sell, p2, q, f2, 0.0);
        assert!(be.price().is_none(), "position should be flat");
        assert!(be.qty().abs() < 1e-12);
    }

    #[test]
    fn breakeven_partial_sell_scales_proportionally() {
        let mut be = Breakeven::default();
        be.update_on_fill(Side::Buy, 100.0, 1.0, 1.0, 0.0);
        be.update_on_fill(Side::Buy, 110.0, 1.0, 1.0, 0.0);
        // cost=210, qty=2, fees=2 -> breakeven 106.
        assert!((be.price().unwrap() - 106.0).abs() < 1e-9);

        // Sell half with a 0.5 fee: accumulators halve, then the fee adds.
        be.update_on_fill(Side::Sell, 120.0, 1.0, 0.5, 0.0);
        assert!((be.qty() - 1.0).abs() < 1e-12);
        // cost=105, fees=1.5 -> breakeven 106.5
        assert!((be.price().unwrap() - 106.5).abs() < 1e-9);
    }

    #[test]
    fn breakeven_undefined_when_flat() {
        let be = Breakeven::default();
        assert!(be.price().is_none());
        assert!(be.avg_cost_price().is_none());
    }
}
