// =============================================================================
// Opportunity Window — is this market currently paying the grid?
// =============================================================================
//
// Composite of three weighted factors, each mapped into [0, 1]:
//
//   cycle activity    fills in the trailing window, 10 fills/hour = 1.0,
//                     plus a small bonus per completed round trip
//   inv reversion     how much the inventory ratio moved toward target
//                     over the reversion lookback
//   breakeven slope   whether breakeven is migrating toward the price
//
// The composite drives a sticky valid/invalid state: >= valid_threshold sets
// valid, < invalid_threshold clears it, and a no-improvement timer forces
// invalid after `timeout_hours` without a valid reading.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::config::ZoneConfig;

const FILLS_CAP: usize = 1024;
const TRIPS_CAP: usize = 512;
const SAMPLES_CAP: usize = 512;

/// Fill-frequency factor.
#[derive(Debug, Default)]
struct CycleActivity {
    fills: VecDeque<DateTime<Utc>>,
    round_trips: VecDeque<DateTime<Utc>>,
}

impl CycleActivity {
    fn record_fill(&mut self, ts: DateTime<Utc>) {
        self.fills.push_back(ts);
        while self.fills.len() > FILLS_CAP {
            self.fills.pop_front();
        }
    }

    fn record_round_trip(&mut self, ts: DateTime<Utc>) {
        self.round_trips.push_back(ts);
        while self.round_trips.len() > TRIPS_CAP {
            self.round_trips.pop_front();
        }
    }

    fn score(&self, now: DateTime<Utc>, lookback_minutes: i64) -> f64 {
        let cutoff = now - Duration::minutes(lookback_minutes);
        let fills = self.fills.iter().filter(|ts| **ts > cutoff).count() as f64;
        let trips = self.round_trips.iter().filter(|ts| **ts > cutoff).count() as f64;

        // 10 fills/hour saturates the fill component.
        let expected = lookback_minutes as f64 / 60.0 * 10.0;
        let fill_score = if expected > 0.0 {
            (fills / expected).min(1.0)
        } else {
            0.0
        };
        let trip_bonus = (trips * 0.05).min(0.3);

        (fill_score + trip_bonus).min(1.0)
    }
}

/// Inventory mean-reversion factor over a short lookback.
#[derive(Debug, Default)]
struct InventoryReversion {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl InventoryReversion {
    fn record(&mut self, ts: DateTime<Utc>, ratio: f64) {
        self.samples.push_back((ts, ratio));
        while self.samples.len() > SAMPLES_CAP {
            self.samples.pop_front();
        }
    }

    fn score(&self, now: DateTime<Utc>, lookback_minutes: i64) -> f64 {
        let cutoff = now - Duration::minutes(lookback_minutes);
        let window: Vec<f64> = self
            .samples
            .iter()
            .filter(|(ts, _)| *ts > cutoff)
            .map(|(_, r)| *r)
            .collect();

        if window.len() < 2 {
            return 0.5;
        }

        // Target ratio is neutral (zero inventory).
        let start_dist = window[0].abs();
        let end_dist = window[window.len() - 1].abs();
        if start_dist < 0.01 {
            return 1.0;
        }

        let improvement = (start_dist - end_dist) / start_dist;
        (0.5 + 0.5 * improvement).clamp(0.0, 1.0)
    }
}

/// Breakeven migration factor: is the cost basis drifting toward price?
#[derive(Debug, Default)]
struct BreakevenSlope {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl BreakevenSlope {
    fn record(&mut self, ts: DateTime<Utc>, breakeven: f64) {
        if breakeven > 0.0 {
            self.samples.push_back((ts, breakeven));
            while self.samples.len() > SAMPLES_CAP {
                self.samples.pop_front();
            }
        }
    }

    fn score(&self, now: DateTime<Utc>, current_price: f64, lookback_minutes: i64) -> f64 {
        if current_price <= 0.0 {
            return 0.5;
        }
        let cutoff = now - Duration::minutes(lookback_minutes);
        let window: Vec<f64> = self
            .samples
            .iter()
            .filter(|(ts, _)| *ts > cutoff)
            .map(|(_, be)| *be)
            .collect();

        if window.len() < 2 {
            return 0.5;
        }

        let start_dist = (window[0] - current_price).abs() / current_price;
        let end_dist = (window[window.len() - 1] - current_price).abs() / current_price;

        if start_dist <= 0.0 {
            return 1.0;
        }
        if end_dist < start_dist {
            let improvement = (start_dist - end_dist) / start_dist;
            (0.5 + 0.5 * improvement).min(1.0)
        } else {
            let deterioration = (end_dist - start_dist) / start_dist;
            (0.5 - 0.5 * deterioration).max(0.0)
        }
    }
}

/// Per-factor breakdown of the last composite evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentScores {
    pub cycle_activity: f64,
    pub inv_reversion: f64,
    pub breakeven_slope: f64,
    pub total: f64,
}

/// The sticky opportunity evaluator.
#[derive(Debug)]
pub struct OpportunityWindow {
    w1: f64,
    w2: f64,
    w3: f64,
    valid_threshold: f64,
    invalid_threshold: f64,
    timeout: Duration,
    activity_lookback_minutes: i64,
    reversion_lookback_minutes: i64,
    breakeven_lookback_minutes: i64,

    cycle: CycleActivity,
    reversion: InventoryReversion,
    breakeven: BreakevenSlope,

    is_valid: bool,
    valid_since: Option<DateTime<Utc>>,
    last_valid_at: Option<DateTime<Utc>>,
    score: f64,
}

impl OpportunityWindow {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            w1: config.w1,
            w2: config.w2,
            w3: config.w3,
            valid_threshold: config.opportunity_valid_threshold,
            invalid_threshold: config.opportunity_invalid_threshold,
            timeout: Duration::hours(config.opportunity_timeout_hours),
            activity_lookback_minutes: config.activity_lookback_minutes,
            reversion_lookback_minutes: config.reversion_lookback_minutes,
            breakeven_lookback_minutes: config.breakeven_lookback_minutes,
            cycle: CycleActivity::default(),
            reversion: InventoryReversion::default(),
            breakeven: BreakevenSlope::default(),
            // A fresh session starts permissive until evidence accumulates.
            is_valid: true,
            valid_since: None,
            last_valid_at: None,
            score: 0.5,
        }
    }

    pub fn record_fill(&mut self, ts: DateTime<Utc>) {
        self.cycle.record_fill(ts);
    }

    pub fn record_round_trip(&mut self, ts: DateTime<Utc>) {
        self.cycle.record_round_trip(ts);
    }

    /// Bar-close observation feed; scoring happens on the control tick.
    pub fn observe(&mut self, ts: DateTime<Utc>, inventory_ratio: f64, breakeven: Option<f64>) {
        self.reversion.record(ts, inventory_ratio);
        if let Some(be) = breakeven {
            self.breakeven.record(ts, be);
        }
    }

    /// Recompute the composite and advance the sticky state.
    pub fn update(&mut self, now: DateTime<Utc>, current_price: f64) -> ComponentScores {
        let scores = self.component_scores(now, current_price);
        self.score = scores.total;

        if self.score >= self.valid_threshold {
            if !self.is_valid || self.valid_since.is_none() {
                self.valid_since = Some(now);
            }
            self.is_valid = true;
            self.last_valid_at = Some(now);
        } else if self.score < self.invalid_threshold {
            self.is_valid = false;
            self.valid_since = None;
        }

        // No-improvement timer: stale validity decays to invalid.
        if let Some(last_valid) = self.last_valid_at {
            if now - last_valid >= self.timeout {
                self.is_valid = false;
                self.valid_since = None;
            }
        }

        scores
    }

    pub fn component_scores(&self, now: DateTime<Utc>, current_price: f64) -> ComponentScores {
        let cycle_activity = self.cycle.score(now, self.activity_lookback_minutes);
        let inv_reversion = self.reversion.score(now, self.reversion_lookback_minutes);
        let breakeven_slope =
            self.breakeven
                .score(now, current_price, self.breakeven_lookback_minutes);

        ComponentScores {
            cycle_activity,
            inv_reversion,
            breakeven_slope,
            total: self.w1 * cycle_activity + self.w2 * inv_reversion + self.w3 * breakeven_slope,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    /// Minutes the window has been continuously valid, for harvest gating.
    pub fn valid_minutes(&self, now: DateTime<Utc>) -> i64 {
        match (self.is_valid, self.valid_since) {
            (true, Some(since)) => (now - since).num_minutes().max(0),
            _ => 0,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> OpportunityWindow {
        OpportunityWindow::new(&ZoneConfig::default())
    }

    #[test]
    fn busy_market_scores_high_activity() {
        let mut w = window();
        let now = Utc::now();
        // 80 fills in the trailing 8h window = 10/hour = saturation.
        for i in 0..80 {
            w.record_fill(now - Duration::minutes(i * 5));
        }
        let scores = w.component_scores(now, 85_000.0);
        assert!(scores.cycle_activity > 0.9, "got {}", scores.cycle_activity);
    }

    #[test]
    fn reversion_rewards_moving_toward_neutral() {
        let mut w = window();
        let now = Utc::now();
        w.observe(now - Duration::minutes(50), 0.6, None);
        w.observe(now - Duration::minutes(5), 0.3, None);
        let scores = w.component_scores(now, 85_000.0);
        assert!(scores.inv_reversion > 0.5, "got {}", scores.inv_reversion);
    }

    #[test]
    fn reversion_penalises_building_inventory() {
        let mut w = window();
        let now = Utc::now();
        w.observe(now - Duration::minutes(50), 0.2, None);
        w.observe(now - Duration::minutes(5), 0.6, None);
        let scores = w.component_scores(now, 85_000.0);
        assert!(scores.inv_reversion < 0.5, "got {}", scores.inv_reversion);
    }

    #[test]
    fn sticky_state_hysteresis() {
        let mut w = window();
        let now = Utc::now();

        // Dead market with stuck inventory: score collapses below the
        // invalid threshold (activity 0, reversion < 0.5 via worsening).
        w.observe(now - Duration::minutes(50), 0.1, None);
        w.observe(now - Duration::minutes(5), 0.5, None);
        w.update(now, 85_000.0);
        assert!(!w.is_valid(), "score {} should invalidate", w.score());

        // A busy market flips it back above the valid threshold.
        for i in 0..80 {
            w.record_fill(now + Duration::minutes(i));
        }
        w.update(now + Duration::minutes(80), 85_000.0);
        assert!(w.is_valid());
        assert!(w.valid_minutes(now + Duration::minutes(140)) >= 60);
    }

    #[test]
    fn timeout_forces_invalid() {
        let mut w = window();
        let t0 = Utc::now();
        for i in 0..80 {
            w.record_fill(t0 + Duration::minutes(i));
        }
        w.update(t0 + Duration::minutes(80), 85_000.0);
        assert!(w.is_valid());

        // 73 hours later with no fresh valid reading in between.
        w.update(t0 + Duration::hours(80), 85_000.0);
        assert!(!w.is_valid());
    }
}
