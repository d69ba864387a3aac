// =============================================================================
// Account View — equity, margin usage, liquidation distance, drawdown
// =============================================================================
//
// Single writer: the engine's event handlers. Triggers and the API read a
// shared snapshot. A missing liquidation price means the emergency check on
// that axis is skipped, not that the distance is zero.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Mutable account state owned by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    pub equity: f64,
    pub initial_equity: f64,
    pub available: f64,

    pub margin_used: f64,
    /// Venue-reported maintenance-margin ratio. Defaults high (safe) until
    /// the venue reports one.
    pub margin_ratio: f64,

    pub mark_price: f64,
    pub liq_price: Option<f64>,

    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    /// Funding accrual, recognized per funding event. Kept out of breakeven.
    pub funding_pnl: f64,

    pub peak_equity: f64,
    pub last_update: Option<DateTime<Utc>>,
}

impl AccountView {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            equity: initial_equity,
            initial_equity,
            available: initial_equity,
            margin_used: 0.0,
            margin_ratio: 10.0,
            mark_price: 0.0,
            liq_price: None,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            funding_pnl: 0.0,
            peak_equity: initial_equity,
            last_update: None,
        }
    }

    /// Margin usage in [0, 1]: used margin over equity, pessimistic when
    /// equity is gone.
    pub fn margin_usage(&self) -> f64 {
        if self.equity <= 0.0 {
            return 1.0;
        }
        (self.margin_used / self.equity).min(1.0)
    }

    /// Relative distance to the liquidation price, when the venue reports
    /// one: `|mark - liq| / mark`.
    pub fn liq_distance(&self) -> Option<f64> {
        let liq = self.liq_price?;
        if self.mark_price <= 0.0 {
            return None;
        }
        Some((self.mark_price - liq).abs() / self.mark_price)
    }

    /// Drawdown from the session's peak equity, in [0, 1].
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity) / self.peak_equity).max(0.0)
    }

    /// Session return relative to the initial equity.
    pub fn profit_pct(&self) -> f64 {
        if self.initial_equity <= 0.0 {
            return 0.0;
        }
        (self.equity - self.initial_equity) / self.initial_equity
    }

    /// Record realized PnL from a closed round trip (fees already netted).
    pub fn apply_realized(&mut self, pnl: f64, now: DateTime<Utc>) {
        self.realized_pnl += pnl;
        self.recompute_equity(now);
    }

    /// Recognize one funding payment (positive = received).
    pub fn apply_funding(&mut self, amount: f64, now: DateTime<Utc>) {
        self.funding_pnl += amount;
        self.recompute_equity(now);
    }

    /// Refresh mark-dependent fields on a price tick.
    pub fn update_mark(
        &mut self,
        mark_price: f64,
        unrealized_pnl: f64,
        margin_used: f64,
        now: DateTime<Utc>,
    ) {
        self.mark_price = mark_price;
        self.unrealized_pnl = unrealized_pnl;
        self.margin_used = margin_used;
        self.recompute_equity(now);
    }

    /// Overwrite venue-reported fields (live reconciliation path).
    pub fn update_from_venue(
        &mut self,
        equity: f64,
        available: f64,
        margin_used: f64,
        margin_ratio: f64,
        liq_price: Option<f64>,
        now: DateTime<Utc>,
    ) {
        self.equity = equity;
        self.available = available;
        self.margin_used = margin_used;
        self.margin_ratio = margin_ratio;
        // None means the venue reports no liquidation price (e.g. flat);
        // the emergency check on that axis is skipped, so clear it.
        self.liq_price = liq_price;
        self.peak_equity = self.peak_equity.max(self.equity);
        self.last_update = Some(now);
    }

    fn recompute_equity(&mut self, now: DateTime<Utc>) {
        self.equity =
            self.initial_equity + self.realized_pnl + self.funding_pnl + self.unrealized_pnl;
        self.available = (self.equity - self.margin_used).max(0.0);
        self.peak_equity = self.peak_equity.max(self.equity);
        self.last_update = Some(now);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_usage_pessimistic_when_broke() {
        let mut view = AccountView::new(100.0);
        view.equity = 0.0;
        assert!((view.margin_usage() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn liq_distance_absent_without_liq_price() {
        let mut view = AccountView::new(100.0);
        view.mark_price = 85_000.0;
        assert!(view.liq_distance().is_none());

        view.liq_price = Some(82_875.0);
        // |85000 - 82875| / 85000 = 0.025
        let dist = view.liq_distance().unwrap();
        assert!((dist - 0.025).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_peak() {
        let now = Utc::now();
        let mut view = AccountView::new(100.0);
        view.apply_realized(20.0, now); // equity 120, peak 120
        view.apply_realized(-30.0, now); // equity 90
        assert!((view.drawdown() - 0.25).abs() < 1e-9);
        assert!((view.profit_pct() - (-0.10)).abs() < 1e-9);
    }

    #[test]
    fn funding_kept_in_its_own_bucket() {
        let now = Utc::now();
        let mut view = AccountView::new(100.0);
        view.apply_funding(-0.5, now);
        assert!((view.funding_pnl + 0.5).abs() < 1e-12);
        assert!((view.equity - 99.5).abs() < 1e-9);
        assert!((view.realized_pnl).abs() < f64::EPSILON);
    }

    #[test]
    fn unrealized_flows_into_equity() {
        let now = Utc::now();
        let mut view = AccountView::new(100.0);
        view.update_mark(85_000.0, 2.5, 10.0, now);
        assert!((view.equity - 102.5).abs() < 1e-9);
        assert!((view.available - 92.5).abs() < 1e-9);
    }
}
