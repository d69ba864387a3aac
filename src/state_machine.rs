// =============================================================================
// State Machine — regime transitions with hard-bound entry actions
// =============================================================================
//
// The machine never reaches into the order manager or the broker directly.
// Entry actions run through the `GridActuator` capability, which the engine
// implements; transitions stay unit-testable with a mock actuator and the
// one-way dependency breaks the machine <-> order-manager cycle.
//
// Entry actions per target regime (atomic on successful transition,
// idempotent — transitioning into the held state is a no-op):
//
//   Defensive      mode NoNewBuys; cancel buys outside the core zone and any
//                  non-reduce-only order that would grow inventory
//   DamageControl  mode ReduceOnly; cancel all non-reduce-only orders
//   EmergencyStop  mode KillSwitch; cancel everything; run the emergency exit
//   Normal         mode Full
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditJournal};
use crate::snapshot::Snapshot;
use crate::state::{is_valid_transition, OrderMode, Regime};

/// Which live orders an entry action wants cancelled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CancelFilter {
    /// Buys priced outside the core zone plus anything non-reduce-only that
    /// would grow inventory.
    RiskyBuys { core_low: f64, core_high: f64 },
    NonReduceOnly,
    All,
}

/// Capability the state machine drives during entry actions.
pub trait GridActuator {
    fn set_mode(&mut self, mode: OrderMode);
    /// Returns how many orders the filter selected for cancellation.
    fn cancel_orders_by_filter(&mut self, filter: CancelFilter) -> usize;
    /// Kick off the configured emergency-exit routine; returns a short
    /// result label for the transition log.
    fn emergency_exit(&mut self) -> String;
}

pub struct StateMachine {
    session_id: String,
    current: Regime,
    state_since: Option<DateTime<Utc>>,
    core_zone: (f64, f64),
    transition_count: u64,
}

impl StateMachine {
    pub fn new(session_id: &str, core_zone: (f64, f64)) -> Self {
        Self {
            session_id: session_id.to_string(),
            current: Regime::Normal,
            state_since: None,
            core_zone,
            transition_count: 0,
        }
    }

    pub fn current(&self) -> Regime {
        self.current
    }

    pub fn state_since(&self) -> Option<DateTime<Utc>> {
        self.state_since
    }

    pub fn state_duration_minutes(&self, now: DateTime<Utc>) -> f64 {
        match self.state_since {
            Some(since) => (now - since).num_seconds() as f64 / 60.0,
            None => 0.0,
        }
    }

    /// The core zone used by the Defensive entry action's cancel filter.
    pub fn update_core_zone(&mut self, low: f64, high: f64) {
        self.core_zone = (low, high);
    }

    pub fn can_transition_to(&self, target: Regime) -> bool {
        is_valid_transition(self.current, target)
    }

    /// Execute a transition.
    ///
    /// Returns true on success (including the no-op same-state case). An
    /// illegal edge is refused without mutating anything and without touching
    /// the actuator.
    pub fn transition_to(
        &mut self,
        target: Regime,
        reason: &str,
        now: DateTime<Utc>,
        snapshot: Snapshot,
        actuator: &mut dyn GridActuator,
        journal: &mut AuditJournal,
    ) -> bool {
        if self.current == target {
            return true;
        }
        if !self.can_transition_to(target) {
            warn!(
                from = %self.current,
                to = %target,
                reason,
                "illegal regime transition refused"
            );
            return false;
        }

        let from = self.current;
        self.current = target;
        self.state_since = Some(now);
        self.transition_count += 1;

        self.run_entry_actions(target, actuator);

        info!(
            from = %from,
            to = %target,
            reason,
            "regime transition"
        );

        let event =
            AuditEvent::state_change(&self.session_id, now, &from.to_string(), &target.to_string(), reason, snapshot);
        if let Err(e) = journal.write(&event) {
            tracing::error!(error = %e, "failed to write state_change audit");
        }

        true
    }

    fn run_entry_actions(&self, target: Regime, actuator: &mut dyn GridActuator) {
        match target {
            Regime::Normal => {
                actuator.set_mode(OrderMode::Full);
            }
            Regime::Defensive => {
                actuator.set_mode(OrderMode::NoNewBuys);
                let (core_low, core_high) = self.core_zone;
                let cancelled =
                    actuator.cancel_orders_by_filter(CancelFilter::RiskyBuys { core_low, core_high });
                info!(cancelled, "Defensive entry: risky buys cancelled");
            }
            Regime::DamageControl => {
                actuator.set_mode(OrderMode::ReduceOnly);
                let cancelled = actuator.cancel_orders_by_filter(CancelFilter::NonReduceOnly);
                info!(cancelled, "DamageControl entry: non-reduce-only orders cancelled");
            }
            Regime::EmergencyStop => {
                actuator.set_mode(OrderMode::KillSwitch);
                let cancelled = actuator.cancel_orders_by_filter(CancelFilter::All);
                let exit_result = actuator.emergency_exit();
                warn!(cancelled, exit_result, "EmergencyStop entry: kill switch engaged");
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockActuator {
        modes: Vec<OrderMode>,
        filters: Vec<CancelFilter>,
        exits: usize,
    }

    impl GridActuator for MockActuator {
        fn set_mode(&mut self, mode: OrderMode) {
            self.modes.push(mode);
        }
        fn cancel_orders_by_filter(&mut self, filter: CancelFilter) -> usize {
            self.filters.push(filter);
            3
        }
        fn emergency_exit(&mut self) -> String {
            self.exits += 1;
            "exited".to_string()
        }
    }

    fn harness() -> (tempfile::TempDir, AuditJournal, StateMachine, MockActuator) {
        let dir = tempfile::tempdir().unwrap();
        let journal = AuditJournal::open(dir.path()).unwrap();
        let machine = StateMachine::new("s_test", (80_000.0, 90_000.0));
        (dir, journal, machine, MockActuator::default())
    }

    #[test]
    fn defensive_entry_actions() {
        let (_dir, mut journal, mut machine, mut actuator) = harness();
        let ok = machine.transition_to(
            Regime::Defensive,
            "inventory_warn",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        assert!(ok);
        assert_eq!(machine.current(), Regime::Defensive);
        assert_eq!(actuator.modes, vec![OrderMode::NoNewBuys]);
        assert_eq!(
            actuator.filters,
            vec![CancelFilter::RiskyBuys {
                core_low: 80_000.0,
                core_high: 90_000.0
            }]
        );
        assert_eq!(actuator.exits, 0);
        assert_eq!(journal.event_count(), 1);
    }

    #[test]
    fn damage_control_cancels_non_reduce_only() {
        let (_dir, mut journal, mut machine, mut actuator) = harness();
        machine.transition_to(
            Regime::Defensive,
            "x",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        machine.transition_to(
            Regime::DamageControl,
            "inventory_damage",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        assert_eq!(machine.current(), Regime::DamageControl);
        assert_eq!(actuator.modes.last(), Some(&OrderMode::ReduceOnly));
        assert_eq!(actuator.filters.last(), Some(&CancelFilter::NonReduceOnly));
    }

    #[test]
    fn emergency_runs_exit_routine() {
        let (_dir, mut journal, mut machine, mut actuator) = harness();
        machine.transition_to(
            Regime::EmergencyStop,
            "liq_distance_critical",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        assert_eq!(machine.current(), Regime::EmergencyStop);
        assert_eq!(actuator.modes, vec![OrderMode::KillSwitch]);
        assert_eq!(actuator.filters, vec![CancelFilter::All]);
        assert_eq!(actuator.exits, 1);
    }

    #[test]
    fn illegal_edge_refused_without_mutation() {
        let (_dir, mut journal, mut machine, mut actuator) = harness();
        // Normal -> DamageControl is not an edge.
        let ok = machine.transition_to(
            Regime::DamageControl,
            "x",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        assert!(!ok);
        assert_eq!(machine.current(), Regime::Normal);
        assert!(actuator.modes.is_empty());
        assert!(actuator.filters.is_empty());
        assert_eq!(journal.event_count(), 0);
    }

    #[test]
    fn same_state_transition_is_noop_success() {
        let (_dir, mut journal, mut machine, mut actuator) = harness();
        let ok = machine.transition_to(
            Regime::Normal,
            "noop",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        assert!(ok);
        assert!(actuator.modes.is_empty());
        assert_eq!(journal.event_count(), 0);
    }

    #[test]
    fn emergency_recovers_only_to_normal() {
        let (_dir, mut journal, mut machine, mut actuator) = harness();
        machine.transition_to(
            Regime::EmergencyStop,
            "x",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        let ok = machine.transition_to(
            Regime::Defensive,
            "x",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        assert!(!ok);

        let ok = machine.transition_to(
            Regime::Normal,
            "operator_reset",
            Utc::now(),
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        assert!(ok);
        assert_eq!(actuator.modes.last(), Some(&OrderMode::Full));
    }

    #[test]
    fn state_duration_tracks_since() {
        let (_dir, mut journal, mut machine, mut actuator) = harness();
        let t0 = Utc::now();
        machine.transition_to(
            Regime::Defensive,
            "x",
            t0,
            Snapshot::default(),
            &mut actuator,
            &mut journal,
        );
        let dur = machine.state_duration_minutes(t0 + chrono::Duration::minutes(20));
        assert!((dur - 20.0).abs() < 0.01);
    }
}
