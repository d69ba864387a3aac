// =============================================================================
// Risk Engine — trigger arbitration feeding the state machine
// =============================================================================
//
// Priority when several triggers fire at once:
//   Emergency > Structural > Inventory > Risk-budget > Vol-spike >
//   Price-boundary > recovery
//
// Enforce points:
//   on_fill       inventory, risk-budget, emergency
//   on_bar_close  all of the above plus structural, vol-spike, and recovery
//   immediate     emergency, price-boundary
//
// Recovery to Normal is guarded: inventory back below its threshold, no
// active vol spike, price inside the outer range and its safe band, and no
// structural-break state. It is evaluated only at bar close.
//
// Every successful trigger writes a `risk_trigger` audit (with snapshot)
// before the engine runs the transition.
// =============================================================================

pub mod triggers;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::audit::{AuditEvent, AuditJournal};
use crate::config::EngineConfig;
use crate::snapshot::Snapshot;
use crate::state::Regime;
use crate::volatility::VolSnapshot;

pub use triggers::{TriggerDecision, TriggerKind};
use triggers::{
    EmergencyTrigger, InventoryTrigger, PriceBoundaryTrigger, RiskBudgetTrigger, StructuralTrigger,
};

/// Inputs the engine assembles from the latest snapshot for each evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs {
    pub state: Regime,
    pub state_since: Option<DateTime<Utc>>,
    pub inventory_ratio: f64,
    pub margin_usage: f64,
    pub drawdown: f64,
    pub mark_price: f64,
    pub outer_low: f64,
    pub outer_high: f64,
    pub vol: VolSnapshot,
    pub liq_distance: Option<f64>,
    pub margin_ratio: f64,
    pub data_age_seconds: f64,
    /// Absolute price change between adjacent ticks, for the gap check.
    pub price_delta_abs: f64,
}

pub struct RiskEngine {
    session_id: String,

    inventory: InventoryTrigger,
    risk_budget: RiskBudgetTrigger,
    structural: StructuralTrigger,
    boundary: PriceBoundaryTrigger,
    emergency: EmergencyTrigger,

    api_fault_count: u32,
}

impl RiskEngine {
    pub fn new(config: &EngineConfig, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            inventory: InventoryTrigger::new(&config.risk),
            risk_budget: RiskBudgetTrigger::new(&config.risk),
            structural: StructuralTrigger::new(&config.structural, config.bar_tf_minutes()),
            boundary: PriceBoundaryTrigger::new(&config.price_boundary),
            emergency: EmergencyTrigger::new(&config.risk),
            api_fault_count: 0,
        }
    }

    // -------------------------------------------------------------------------
    // API-fault accounting (fed by the execution layer)
    // -------------------------------------------------------------------------

    pub fn record_api_fault(&mut self) {
        self.api_fault_count += 1;
        debug!(count = self.api_fault_count, "api fault recorded");
    }

    pub fn reset_api_faults(&mut self) {
        self.api_fault_count = 0;
    }

    pub fn api_fault_count(&self) -> u32 {
        self.api_fault_count
    }

    // -------------------------------------------------------------------------
    // Structural state exposure (for snapshots and recovery)
    // -------------------------------------------------------------------------

    pub fn structural_confirmed(&self) -> bool {
        self.structural.confirmed()
    }

    pub fn outside_since(&self) -> Option<DateTime<Utc>> {
        self.structural.outside_since()
    }

    // -------------------------------------------------------------------------
    // Enforce points
    // -------------------------------------------------------------------------

    /// Post-fill evaluation: emergency, inventory, risk-budget.
    pub fn evaluate_on_fill(
        &mut self,
        now: DateTime<Utc>,
        inputs: &RiskInputs,
        snapshot: &Snapshot,
        journal: &mut AuditJournal,
    ) -> Option<TriggerDecision> {
        let decision = self
            .check_emergency(inputs)
            .or_else(|| self.inventory.check(inputs.inventory_ratio, inputs.state))
            .or_else(|| {
                self.risk_budget
                    .check(inputs.margin_usage, inputs.drawdown, inputs.state)
            })?;

        self.write_trigger(now, &decision, snapshot, journal);
        Some(decision)
    }

    /// Bar-close evaluation: the full stack plus recovery.
    pub fn evaluate_on_bar_close(
        &mut self,
        now: DateTime<Utc>,
        close: f64,
        inputs: &RiskInputs,
        snapshot: &Snapshot,
        journal: &mut AuditJournal,
    ) -> Option<TriggerDecision> {
        // The structural accumulator must advance every bar regardless of
        // which trigger ends up winning.
        let structural = self.structural.on_bar_close(
            close,
            inputs.outer_low,
            inputs.outer_high,
            inputs.vol.atr,
            inputs.state,
            now,
        );

        if let Some(decision) = self
            .check_emergency(inputs)
            .or(structural)
            .or_else(|| self.inventory.check(inputs.inventory_ratio, inputs.state))
            .or_else(|| {
                self.risk_budget
                    .check(inputs.margin_usage, inputs.drawdown, inputs.state)
            })
            .or_else(|| self.check_vol_spike(inputs))
        {
            self.write_trigger(now, &decision, snapshot, journal);
            return Some(decision);
        }

        self.check_recovery(now, inputs)
    }

    /// Immediate (tick-level) evaluation: emergency, then price boundary.
    pub fn evaluate_immediate(
        &mut self,
        now: DateTime<Utc>,
        inputs: &RiskInputs,
        snapshot: &Snapshot,
        journal: &mut AuditJournal,
    ) -> Option<TriggerDecision> {
        let decision = self.check_emergency(inputs).or_else(|| {
            self.boundary.check(
                inputs.mark_price,
                inputs.vol.atr,
                inputs.outer_low,
                inputs.outer_high,
                inputs.state,
                inputs.state_since,
                now,
            )
        })?;

        self.write_trigger(now, &decision, snapshot, journal);
        Some(decision)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn check_emergency(&self, inputs: &RiskInputs) -> Option<TriggerDecision> {
        if inputs.state == Regime::EmergencyStop {
            return None;
        }
        self.emergency.check(
            inputs.liq_distance,
            inputs.margin_ratio,
            self.api_fault_count,
            inputs.data_age_seconds,
            inputs.price_delta_abs,
            inputs.vol.atr,
        )
    }

    fn check_vol_spike(&self, inputs: &RiskInputs) -> Option<TriggerDecision> {
        if inputs.vol.is_spike && inputs.state == Regime::Normal {
            return Some(TriggerDecision {
                target: Regime::Defensive,
                kind: TriggerKind::VolSpike,
                reason: format!(
                    "vol_spike: atr={:.2} atr_ma={:.2}",
                    inputs.vol.atr, inputs.vol.atr_ma
                ),
                value: if inputs.vol.atr_ma > 0.0 {
                    inputs.vol.atr / inputs.vol.atr_ma
                } else {
                    0.0
                },
                threshold: 0.0,
                forced_reduce_target: None,
            });
        }
        None
    }

    /// All-conditions-clear recovery to Normal from Defensive/DamageControl.
    fn check_recovery(&self, now: DateTime<Utc>, inputs: &RiskInputs) -> Option<TriggerDecision> {
        if !matches!(inputs.state, Regime::Defensive | Regime::DamageControl) {
            return None;
        }
        if inputs.inventory_ratio > self.inventory.back_to_normal() {
            return None;
        }
        if inputs.vol.is_spike {
            return None;
        }
        if self.structural.is_outside() || self.structural.confirmed() {
            return None;
        }
        if !self.boundary.in_safe_zone(
            inputs.mark_price,
            inputs.vol.atr,
            inputs.outer_low,
            inputs.outer_high,
        ) {
            return None;
        }
        if !self.boundary.recovery_hold_passed(inputs.state_since, now) {
            return None;
        }

        Some(TriggerDecision {
            target: Regime::Normal,
            kind: TriggerKind::Recovery,
            reason: format!(
                "all_conditions_recovered: ratio={:.2}% inside range",
                inputs.inventory_ratio * 100.0
            ),
            value: inputs.inventory_ratio,
            threshold: self.inventory.back_to_normal(),
            forced_reduce_target: None,
        })
    }

    fn write_trigger(
        &self,
        now: DateTime<Utc>,
        decision: &TriggerDecision,
        snapshot: &Snapshot,
        journal: &mut AuditJournal,
    ) {
        let event = AuditEvent::risk_trigger(
            &self.session_id,
            now,
            &decision.kind.to_string(),
            decision.value,
            decision.threshold,
            &decision.reason,
            snapshot.clone(),
        );
        if let Err(e) = journal.write(&event) {
            tracing::error!(error = %e, "failed to write risk_trigger audit");
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> (tempfile::TempDir, AuditJournal, RiskEngine) {
        let dir = tempfile::tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        let engine = RiskEngine::new(&EngineConfig::default(), "s_test");
        (dir, journal, engine)
    }

    fn inputs(state: Regime) -> RiskInputs {
        RiskInputs {
            state,
            state_since: Some(Utc::now() - Duration::hours(1)),
            inventory_ratio: 0.1,
            margin_usage: 0.2,
            drawdown: 0.0,
            mark_price: 85_000.0,
            outer_low: 76_000.0,
            outer_high: 97_000.0,
            vol: VolSnapshot {
                atr: 200.0,
                rv: 0.5,
                atr_ma: 200.0,
                is_spike: false,
                atr_ready: true,
            },
            liq_distance: None,
            margin_ratio: 5.0,
            data_age_seconds: 1.0,
            price_delta_abs: 10.0,
        }
    }

    #[test]
    fn emergency_outranks_inventory() {
        let (_dir, mut journal, mut engine) = engine();
        let mut i = inputs(Regime::Normal);
        i.inventory_ratio = 0.90; // would fire inventory_stop
        i.liq_distance = Some(0.01); // but emergency wins

        let decision = engine
            .evaluate_on_fill(Utc::now(), &i, &Snapshot::default(), &mut journal)
            .unwrap();
        assert_eq!(decision.target, Regime::EmergencyStop);
        assert_eq!(decision.kind, TriggerKind::LiqDistance);
    }

    #[test]
    fn inventory_warn_fires_on_fill() {
        let (_dir, mut journal, mut engine) = engine();
        let mut i = inputs(Regime::Normal);
        i.inventory_ratio = 0.56;

        let decision = engine
            .evaluate_on_fill(Utc::now(), &i, &Snapshot::default(), &mut journal)
            .unwrap();
        assert_eq!(decision.target, Regime::Defensive);
        assert_eq!(decision.kind, TriggerKind::InventoryWarn);
        // A risk_trigger audit must precede the state change.
        assert_eq!(journal.event_count(), 1);
    }

    #[test]
    fn vol_spike_proposes_defensive_at_bar_close() {
        let (_dir, mut journal, mut engine) = engine();
        let mut i = inputs(Regime::Normal);
        i.vol.is_spike = true;

        let decision = engine
            .evaluate_on_bar_close(Utc::now(), 85_000.0, &i, &Snapshot::default(), &mut journal)
            .unwrap();
        assert_eq!(decision.kind, TriggerKind::VolSpike);
        assert_eq!(decision.target, Regime::Defensive);
    }

    #[test]
    fn api_faults_escalate_to_emergency() {
        let (_dir, mut journal, mut engine) = engine();
        engine.record_api_fault();
        engine.record_api_fault();
        assert!(engine
            .evaluate_immediate(Utc::now(), &inputs(Regime::Normal), &Snapshot::default(), &mut journal)
            .is_none());

        engine.record_api_fault();
        let decision = engine
            .evaluate_immediate(Utc::now(), &inputs(Regime::Normal), &Snapshot::default(), &mut journal)
            .unwrap();
        assert_eq!(decision.kind, TriggerKind::ApiFault);

        engine.reset_api_faults();
        assert_eq!(engine.api_fault_count(), 0);
    }

    #[test]
    fn boundary_fires_immediately_from_normal() {
        let (_dir, mut journal, mut engine) = engine();
        let mut i = inputs(Regime::Normal);
        i.mark_price = 76_050.0; // inside the 0.5*ATR = 100 buffer band

        let decision = engine
            .evaluate_immediate(Utc::now(), &i, &Snapshot::default(), &mut journal)
            .unwrap();
        assert_eq!(decision.kind, TriggerKind::PriceBoundary);
    }

    #[test]
    fn recovery_requires_everything_clear() {
        let (_dir, mut journal, mut engine) = engine();
        let now = Utc::now();

        let mut i = inputs(Regime::Defensive);
        i.inventory_ratio = 0.30;

        // Clean: recovers.
        let decision = engine
            .evaluate_on_bar_close(now, 85_000.0, &i, &Snapshot::default(), &mut journal)
            .unwrap();
        assert_eq!(decision.target, Regime::Normal);
        assert_eq!(decision.kind, TriggerKind::Recovery);

        // Same but with an active spike: held.
        i.vol.is_spike = false;
        i.inventory_ratio = 0.30;
        let mut spiky = i;
        spiky.vol.is_spike = true;
        // is_spike proposes nothing from Defensive (only Normal), and blocks
        // recovery.
        assert!(engine
            .evaluate_on_bar_close(now, 85_000.0, &spiky, &Snapshot::default(), &mut journal)
            .is_none());

        // Inventory still heavy: held.
        let mut heavy = i;
        heavy.inventory_ratio = 0.50;
        assert!(engine
            .evaluate_on_bar_close(now, 85_000.0, &heavy, &Snapshot::default(), &mut journal)
            .is_none());
    }

    #[test]
    fn recovery_not_evaluated_on_fill() {
        let (_dir, mut journal, mut engine) = engine();
        let mut i = inputs(Regime::Defensive);
        i.inventory_ratio = 0.30;
        assert!(engine
            .evaluate_on_fill(Utc::now(), &i, &Snapshot::default(), &mut journal)
            .is_none());
    }

    #[test]
    fn structural_break_full_path() {
        let (_dir, mut journal, mut engine) = engine();
        let t0 = Utc::now();
        let mut i = inputs(Regime::Defensive);
        i.mark_price = 75_000.0;

        let mut fired = None;
        for minute in 1..=240 {
            let decision = engine.evaluate_on_bar_close(
                t0 + Duration::minutes(minute),
                75_000.0,
                &i,
                &Snapshot::default(),
                &mut journal,
            );
            if let Some(d) = decision {
                fired = Some((minute, d));
                break;
            }
        }
        let (minute, decision) = fired.expect("structural break should confirm");
        assert_eq!(minute, 240);
        assert_eq!(decision.kind, TriggerKind::StructuralBreak);
        assert_eq!(decision.target, Regime::DamageControl);
        assert!(engine.structural_confirmed());
    }
}
