// =============================================================================
// Advantage Gate — opportunity scoring + core-zone extraction, one interface
// =============================================================================
//
// The grid generator and skew engine consume three things from here:
// `opportunity_valid`, `core_zone`, and the per-price advantage score
// `w1*density + w2*inv_revert + w3*breakeven_gain`.
//
// The control tick is the only caller allowed to move core-zone boundaries;
// fills and bar closes merely feed observations.
// =============================================================================

pub mod core_zone;
pub mod opportunity;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::audit::{AuditEvent, AuditJournal};
use crate::config::ZoneConfig;
use crate::types::Side;

pub use core_zone::CoreZoneCalculator;
pub use opportunity::{ComponentScores, OpportunityWindow};

pub struct AdvantageGate {
    session_id: String,
    config_hash: String,
    weights: (f64, f64, f64),

    window: OpportunityWindow,
    zone: CoreZoneCalculator,

    outer_low: f64,
    outer_high: f64,

    // Latest price observation, refreshed by the engine.
    current_price: f64,

    control_tick_count: u64,
}

impl AdvantageGate {
    pub fn new(
        config: &ZoneConfig,
        session_id: &str,
        config_hash: &str,
        outer_low: f64,
        outer_high: f64,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            config_hash: config_hash.to_string(),
            weights: (config.w1, config.w2, config.w3),
            window: OpportunityWindow::new(config),
            zone: CoreZoneCalculator::new(config),
            outer_low,
            outer_high,
            current_price: 0.0,
            control_tick_count: 0,
        }
    }

    /// Whether the opportunity window currently validates grid activity.
    pub fn opportunity_valid(&self) -> bool {
        self.window.is_valid()
    }

    pub fn opportunity_score(&self) -> f64 {
        self.window.score()
    }

    /// Minutes the window has been continuously valid.
    pub fn opportunity_valid_minutes(&self, now: DateTime<Utc>) -> i64 {
        self.window.valid_minutes(now)
    }

    /// Current core zone; equals the outer range until fills accumulate.
    pub fn core_zone(&self) -> (f64, f64) {
        self.zone.zone().unwrap_or((self.outer_low, self.outer_high))
    }

    pub fn in_core_zone(&self, price: f64) -> bool {
        let (low, high) = self.core_zone();
        price >= low && price <= high
    }

    /// Record a fill for both the density histogram and the activity factor.
    pub fn record_fill(
        &mut self,
        ts: DateTime<Utc>,
        price: f64,
        qty: f64,
        _side: Side,
        position_flat_after: bool,
    ) {
        self.window.record_fill(ts);
        self.zone.record_fill(ts, price, qty);
        if position_flat_after {
            self.window.record_round_trip(ts);
        }
    }

    /// Bar-close observation of the slow-moving inputs.
    pub fn observe(
        &mut self,
        ts: DateTime<Utc>,
        current_price: f64,
        inventory_ratio: f64,
        breakeven: Option<f64>,
    ) {
        self.current_price = current_price;
        self.window.observe(ts, inventory_ratio, breakeven);
    }

    pub fn update_outer_range(&mut self, low: f64, high: f64) {
        self.outer_low = low;
        self.outer_high = high;
    }

    /// Control tick: advance the opportunity window, recompute the core zone,
    /// and emit the `param_update` audit with the config hash.
    pub fn on_control_tick(&mut self, now: DateTime<Utc>, journal: &mut AuditJournal) {
        self.control_tick_count += 1;

        let scores = self.window.update(now, self.current_price);
        let (low, high) = self.zone.recompute(now, self.outer_low, self.outer_high);

        info!(
            tick = self.control_tick_count,
            score = format!("{:.3}", scores.total),
            adv_at_price = format!("{:.3}", self.adv_score(self.current_price, now)),
            opportunity_valid = self.window.is_valid(),
            core_low = low,
            core_high = high,
            "control tick processed"
        );

        let event = AuditEvent::param_update(
            &self.session_id,
            now,
            "control_tick",
            serde_json::json!(self.control_tick_count - 1),
            serde_json::json!(self.control_tick_count),
            &self.config_hash,
            &format!(
                "control tick #{}: score={:.3} zone=[{:.0}, {:.0}]",
                self.control_tick_count, scores.total, low, high
            ),
        );
        if let Err(e) = journal.write(&event) {
            tracing::error!(error = %e, "failed to write param_update audit");
        }
    }

    /// Per-price advantage score in [0, 1].
    pub fn adv_score(&self, price: f64, now: DateTime<Utc>) -> f64 {
        let (w1, w2, w3) = self.weights;
        let components = self.window.component_scores(now, self.current_price);
        w1 * self.zone.density_score(price, now)
            + w2 * components.inv_reversion
            + w3 * components.breakeven_slope
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn gate() -> AdvantageGate {
        AdvantageGate::new(
            &ZoneConfig::default(),
            "s_test",
            "deadbeef",
            76_000.0,
            97_000.0,
        )
    }

    #[test]
    fn zone_defaults_to_outer_range() {
        let g = gate();
        assert_eq!(g.core_zone(), (76_000.0, 97_000.0));
        assert!(g.in_core_zone(85_000.0));
    }

    #[test]
    fn control_tick_writes_param_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = AuditJournal::open(dir.path()).unwrap();
        let mut g = gate();
        let now = Utc::now();

        g.observe(now, 85_000.0, 0.1, None);
        g.on_control_tick(now, &mut journal);

        let events = journal
            .query(Some(&[crate::audit::AuditKind::ParamUpdate]), None, None, None)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].config_hash.as_deref(), Some("deadbeef"));
    }

    #[test]
    fn control_tick_moves_zone_with_fills() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = AuditJournal::open(dir.path()).unwrap();
        let mut g = gate();
        let now = Utc::now();

        for i in 0..30 {
            g.record_fill(
                now - Duration::minutes(i),
                84_000.0 + (i % 6) as f64 * 100.0,
                0.01,
                Side::Buy,
                false,
            );
        }
        g.observe(now, 84_200.0, 0.2, Some(84_100.0));
        g.on_control_tick(now, &mut journal);

        let (low, high) = g.core_zone();
        assert!(low >= 83_000.0 && high <= 86_000.0, "zone ({low}, {high})");
    }

    #[test]
    fn adv_score_bounded() {
        let mut g = gate();
        let now = Utc::now();
        for i in 0..10 {
            g.record_fill(now - Duration::minutes(i), 84_000.0, 0.01, Side::Buy, false);
        }
        let score = g.adv_score(84_000.0, now);
        assert!((0.0..=1.0).contains(&score), "score {score}");
    }
}
