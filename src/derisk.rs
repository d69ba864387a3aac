// =============================================================================
// DeRisk Engine — house-money / harvest / de-risk arbitration
// =============================================================================
//
// Three independent reduction proposals sharing one cooldown, evaluated in
// precedence order:
//
//   house-money   session profit >= house_money_profit_pct. First trigger
//                 latches permanent conservative mode and proposes the
//                 house-money reduce target.
//   harvest       regime in {Normal, Defensive}, inventory >= harvest ratio,
//                 the opportunity window valid for >= harvest_require_minutes,
//                 and price sufficiently above breakeven. Proposes
//                 ratio - reduce_batch_size.
//   de-risk       regime != EmergencyStop, inventory >= derisk minimum, and
//                 realized efficiency down >= derisk_efficiency_drop from its
//                 running peak. Same batch size.
//
// The efficiency peak resets when a new cycle starts (after a reduction).
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::config::DeRiskConfig;
use crate::state::Regime;

/// A reduction proposal: `(should_reduce, reason, target_ratio)` flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceProposal {
    pub reason: String,
    pub target_ratio: f64,
}

/// Inputs for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct DeRiskInputs {
    pub regime: Regime,
    pub inventory_ratio: f64,
    pub breakeven_price: Option<f64>,
    pub current_price: f64,
    pub opportunity_valid: bool,
    pub opportunity_valid_minutes: i64,
    pub initial_equity: f64,
    pub current_equity: f64,
}

pub struct DeRiskEngine {
    config: DeRiskConfig,

    house_money_latched: bool,
    conservative_mode: bool,
    last_reduce_at: Option<DateTime<Utc>>,
    peak_efficiency: f64,
}

impl DeRiskEngine {
    pub fn new(config: &DeRiskConfig) -> Self {
        Self {
            config: config.clone(),
            house_money_latched: false,
            conservative_mode: false,
            last_reduce_at: None,
            peak_efficiency: 0.0,
        }
    }

    /// Permanent once house-money has latched.
    pub fn is_conservative(&self) -> bool {
        self.conservative_mode
    }

    /// Evaluate in precedence order. Returns at most one proposal; the shared
    /// cooldown suppresses everything for reduce_cooldown_minutes after a
    /// reduction executes.
    pub fn evaluate(&mut self, now: DateTime<Utc>, inputs: &DeRiskInputs) -> Option<ReduceProposal> {
        if let Some(last) = self.last_reduce_at {
            if now - last < Duration::minutes(self.config.reduce_cooldown_minutes) {
                return None;
            }
        }

        self.check_house_money(now, inputs)
            .or_else(|| self.check_harvest(inputs))
            .or_else(|| self.check_derisk(inputs))
    }

    /// Callback once a reduction batch has been executed.
    pub fn on_reduce_executed(&mut self, now: DateTime<Utc>) {
        self.last_reduce_at = Some(now);
        // New cycle: the efficiency baseline starts over.
        self.peak_efficiency = 0.0;
    }

    // -------------------------------------------------------------------------
    // Conditions
    // -------------------------------------------------------------------------

    fn check_house_money(
        &mut self,
        now: DateTime<Utc>,
        inputs: &DeRiskInputs,
    ) -> Option<ReduceProposal> {
        if self.house_money_latched || inputs.initial_equity <= 0.0 {
            return None;
        }

        let profit_pct = (inputs.current_equity - inputs.initial_equity) / inputs.initial_equity;
        if profit_pct < self.config.house_money_profit_pct {
            return None;
        }

        self.house_money_latched = true;
        self.conservative_mode = true;
        info!(
            profit_pct = format!("{:.2}%", profit_pct * 100.0),
            at = %now,
            "house money reached; conservative mode latched"
        );

        Some(ReduceProposal {
            reason: format!(
                "house_money: profit={:.2}% >= {:.2}%",
                profit_pct * 100.0,
                self.config.house_money_profit_pct * 100.0
            ),
            target_ratio: self.config.house_money_reduce_target,
        })
    }

    fn check_harvest(&self, inputs: &DeRiskInputs) -> Option<ReduceProposal> {
        if !matches!(inputs.regime, Regime::Normal | Regime::Defensive) {
            return None;
        }
        if inputs.inventory_ratio < self.config.harvest_inventory_ratio {
            return None;
        }
        if !inputs.opportunity_valid
            || inputs.opportunity_valid_minutes < self.config.harvest_require_minutes
        {
            return None;
        }

        let breakeven = inputs.breakeven_price?;
        if breakeven <= 0.0 {
            return None;
        }
        let profit_pct = (inputs.current_price - breakeven) / breakeven;
        if profit_pct < self.config.harvest_profit_threshold {
            return None;
        }

        let target = (inputs.inventory_ratio - self.config.reduce_batch_size).max(0.0);
        Some(ReduceProposal {
            reason: format!(
                "harvest: profit={:.2}% >= {:.2}%",
                profit_pct * 100.0,
                self.config.harvest_profit_threshold * 100.0
            ),
            target_ratio: target,
        })
    }

    fn check_derisk(&mut self, inputs: &DeRiskInputs) -> Option<ReduceProposal> {
        if inputs.regime == Regime::EmergencyStop {
            return None;
        }
        if inputs.inventory_ratio < self.config.derisk_min_inventory {
            return None;
        }

        // Efficiency proxy: headroom left before the notional cap. A grid
        // that keeps accumulating without unwinding watches this collapse
        // from its peak.
        let efficiency = 1.0 - inputs.inventory_ratio;
        self.peak_efficiency = self.peak_efficiency.max(efficiency);
        if self.peak_efficiency <= 0.0 {
            return None;
        }

        let drop = (self.peak_efficiency - efficiency) / self.peak_efficiency;
        if drop < self.config.derisk_efficiency_drop {
            return None;
        }

        let target = (inputs.inventory_ratio - self.config.reduce_batch_size).max(0.0);
        Some(ReduceProposal {
            reason: format!(
                "derisk: efficiency_drop={:.2}% >= {:.2}%",
                drop * 100.0,
                self.config.derisk_efficiency_drop * 100.0
            ),
            target_ratio: target,
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DeRiskEngine {
        DeRiskEngine::new(&DeRiskConfig::default())
    }

    fn inputs() -> DeRiskInputs {
        DeRiskInputs {
            regime: Regime::Normal,
            inventory_ratio: 0.40,
            breakeven_price: Some(84_000.0),
            current_price: 86_000.0,
            opportunity_valid: true,
            opportunity_valid_minutes: 120,
            initial_equity: 100.0,
            current_equity: 100.0,
        }
    }

    #[test]
    fn harvest_proposes_batch_reduction() {
        let mut engine = engine();
        // (86000 - 84000) / 84000 = 2.38% >= 2%
        let proposal = engine.evaluate(Utc::now(), &inputs()).unwrap();
        assert!(proposal.reason.contains("harvest"));
        assert!((proposal.target_ratio - 0.30).abs() < 1e-12);
    }

    #[test]
    fn harvest_needs_sustained_opportunity() {
        let mut engine = engine();
        let mut i = inputs();
        i.opportunity_valid_minutes = 30; // < 60 required
        assert!(engine.evaluate(Utc::now(), &i).is_none());

        i.opportunity_valid_minutes = 120;
        i.opportunity_valid = false;
        assert!(engine.evaluate(Utc::now(), &i).is_none());
    }

    #[test]
    fn harvest_needs_profit_over_breakeven() {
        let mut engine = engine();
        let mut i = inputs();
        i.current_price = 84_500.0; // only 0.6% above breakeven
        assert!(engine.evaluate(Utc::now(), &i).is_none());

        i.breakeven_price = None; // flat book: nothing to harvest
        assert!(engine.evaluate(Utc::now(), &i).is_none());
    }

    #[test]
    fn house_money_outranks_harvest_and_latches() {
        let mut engine = engine();
        let mut i = inputs();
        i.current_equity = 106.0; // +6% >= 5%

        let proposal = engine.evaluate(Utc::now(), &i).unwrap();
        assert!(proposal.reason.contains("house_money"));
        assert!((proposal.target_ratio - 0.50).abs() < 1e-12);
        assert!(engine.is_conservative());

        // Latched: the next evaluation falls through to harvest instead.
        engine.on_reduce_executed(Utc::now() - Duration::minutes(30));
        let next = engine.evaluate(Utc::now(), &i).unwrap();
        assert!(next.reason.contains("harvest"));
        assert!(engine.is_conservative());
    }

    #[test]
    fn derisk_fires_on_efficiency_collapse() {
        let mut engine = engine();
        let mut i = inputs();
        // Disqualify harvest so de-risk is reachable.
        i.opportunity_valid = false;
        i.regime = Regime::DamageControl;

        // Establish a healthy peak at low inventory.
        i.inventory_ratio = 0.20;
        assert!(engine.evaluate(Utc::now(), &i).is_none());

        // Inventory balloons: efficiency 0.35 vs peak 0.80 is a 56% drop.
        i.inventory_ratio = 0.65;
        let proposal = engine.evaluate(Utc::now(), &i).unwrap();
        assert!(proposal.reason.contains("derisk"));
        assert!((proposal.target_ratio - 0.55).abs() < 1e-12);
    }

    #[test]
    fn cooldown_suppresses_all_conditions() {
        let mut engine = engine();
        let now = Utc::now();

        assert!(engine.evaluate(now, &inputs()).is_some());
        engine.on_reduce_executed(now);

        // 10 minutes later: still inside the 15-minute cooldown.
        assert!(engine
            .evaluate(now + Duration::minutes(10), &inputs())
            .is_none());
        // After the cooldown the condition can fire again.
        assert!(engine
            .evaluate(now + Duration::minutes(16), &inputs())
            .is_some());
    }

    #[test]
    fn reduction_resets_efficiency_peak() {
        let mut engine = engine();
        let mut i = inputs();
        i.opportunity_valid = false;
        i.regime = Regime::DamageControl;

        i.inventory_ratio = 0.20;
        engine.evaluate(Utc::now(), &i);
        engine.on_reduce_executed(Utc::now() - Duration::minutes(20));

        // Post-reduction, a fresh peak is established from current state; the
        // same inventory level no longer reads as a collapse.
        i.inventory_ratio = 0.65;
        assert!(engine.evaluate(Utc::now(), &i).is_none());
    }
}
