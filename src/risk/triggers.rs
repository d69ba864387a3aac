// =============================================================================
// Risk Triggers — named predicates over the latest snapshot
// =============================================================================
//
// Each trigger is a pure predicate plus a tiny amount of per-trigger memory
// (the structural trigger's contiguous-outside accumulator, the boundary
// trigger's hold-time check). Triggers propose transitions; the risk engine
// arbitrates priority and the state machine executes.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::config::{PriceBoundaryConfig, RiskLimitsConfig, StructuralStopConfig};
use crate::state::Regime;

/// Which predicate fired. The display form is the audit `trigger_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    InventoryWarn,
    InventoryDamage,
    InventoryStop,
    RiskBudget,
    StructuralBreak,
    VolSpike,
    PriceBoundary,
    LiqDistance,
    MarginRatio,
    ApiFault,
    DataStale,
    PriceGap,
    Recovery,
    /// Operator-initiated shutdown path (not a market predicate).
    Operator,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InventoryWarn => "inventory_warn",
            Self::InventoryDamage => "inventory_damage",
            Self::InventoryStop => "inventory_stop",
            Self::RiskBudget => "risk_budget",
            Self::StructuralBreak => "structural_break",
            Self::VolSpike => "vol_spike",
            Self::PriceBoundary => "price_boundary",
            Self::LiqDistance => "liq_distance",
            Self::MarginRatio => "margin_ratio",
            Self::ApiFault => "api_fault",
            Self::DataStale => "data_stale",
            Self::PriceGap => "price_gap",
            Self::Recovery => "recovery",
            Self::Operator => "operator",
        };
        write!(f, "{s}")
    }
}

/// A proposed transition, with the observed value and breached threshold.
#[derive(Debug, Clone)]
pub struct TriggerDecision {
    pub target: Regime,
    pub kind: TriggerKind,
    pub reason: String,
    pub value: f64,
    pub threshold: f64,
    /// Set when the trigger demands a forced inventory reduction.
    pub forced_reduce_target: Option<f64>,
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Tiered inventory-ratio thresholds.
///
/// Invariant (enforced by the config validator):
/// `inv_back_to_normal < inv_warn < inv_damage < inv_stop`.
#[derive(Debug)]
pub struct InventoryTrigger {
    inv_warn: f64,
    inv_damage: f64,
    inv_stop: f64,
    inv_back_to_normal: f64,
    inv_stop_target: f64,
}

impl InventoryTrigger {
    pub fn new(risk: &RiskLimitsConfig) -> Self {
        Self {
            inv_warn: risk.inv_warn,
            inv_damage: risk.inv_damage,
            inv_stop: risk.inv_stop,
            inv_back_to_normal: risk.inv_back_to_normal,
            inv_stop_target: risk.inv_stop_target,
        }
    }

    pub fn back_to_normal(&self) -> f64 {
        self.inv_back_to_normal
    }

    pub fn check(&self, ratio: f64, state: Regime) -> Option<TriggerDecision> {
        if ratio >= self.inv_stop {
            return Some(TriggerDecision {
                target: Regime::DamageControl,
                kind: TriggerKind::InventoryStop,
                reason: format!(
                    "inventory_stop: ratio={:.2}% >= {:.2}%",
                    ratio * 100.0,
                    self.inv_stop * 100.0
                ),
                value: ratio,
                threshold: self.inv_stop,
                forced_reduce_target: Some(self.inv_stop_target),
            });
        }

        if ratio >= self.inv_damage && matches!(state, Regime::Normal | Regime::Defensive) {
            return Some(TriggerDecision {
                target: Regime::DamageControl,
                kind: TriggerKind::InventoryDamage,
                reason: format!(
                    "inventory_damage: ratio={:.2}% >= {:.2}%",
                    ratio * 100.0,
                    self.inv_damage * 100.0
                ),
                value: ratio,
                threshold: self.inv_damage,
                forced_reduce_target: None,
            });
        }

        if ratio >= self.inv_warn && state == Regime::Normal {
            return Some(TriggerDecision {
                target: Regime::Defensive,
                kind: TriggerKind::InventoryWarn,
                reason: format!(
                    "inventory_warn: ratio={:.2}% >= {:.2}%",
                    ratio * 100.0,
                    self.inv_warn * 100.0
                ),
                value: ratio,
                threshold: self.inv_warn,
                forced_reduce_target: None,
            });
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Risk budget
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RiskBudgetTrigger {
    margin_cap: f64,
    max_dd: f64,
}

impl RiskBudgetTrigger {
    pub fn new(risk: &RiskLimitsConfig) -> Self {
        Self {
            margin_cap: risk.margin_cap,
            max_dd: risk.max_dd,
        }
    }

    pub fn check(&self, margin_usage: f64, drawdown: f64, state: Regime) -> Option<TriggerDecision> {
        if state == Regime::EmergencyStop {
            return None;
        }

        if margin_usage >= self.margin_cap {
            return Some(TriggerDecision {
                target: Regime::DamageControl,
                kind: TriggerKind::RiskBudget,
                reason: format!(
                    "margin_cap_exceeded: usage={:.2}% >= {:.2}%",
                    margin_usage * 100.0,
                    self.margin_cap * 100.0
                ),
                value: margin_usage,
                threshold: self.margin_cap,
                forced_reduce_target: None,
            });
        }

        if drawdown >= self.max_dd {
            return Some(TriggerDecision {
                target: Regime::DamageControl,
                kind: TriggerKind::RiskBudget,
                reason: format!(
                    "max_dd_exceeded: dd={:.2}% >= {:.2}%",
                    drawdown * 100.0,
                    self.max_dd * 100.0
                ),
                value: drawdown,
                threshold: self.max_dd,
                forced_reduce_target: None,
            });
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Structural break
// ---------------------------------------------------------------------------

/// Contiguous-minutes accumulator over bar closes outside the buffered outer
/// range. Resets to zero the moment a close lands back inside.
#[derive(Debug)]
pub struct StructuralTrigger {
    atr_buffer_mult: f64,
    confirm_minutes: f64,
    bar_tf_minutes: f64,

    outside_minutes: f64,
    outside_since: Option<DateTime<Utc>>,
    confirmed: bool,
}

impl StructuralTrigger {
    pub fn new(config: &StructuralStopConfig, bar_tf_minutes: f64) -> Self {
        Self {
            atr_buffer_mult: config.atr_buffer_mult,
            confirm_minutes: config.confirm_minutes,
            bar_tf_minutes,
            outside_minutes: 0.0,
            outside_since: None,
            confirmed: false,
        }
    }

    pub fn is_outside(&self) -> bool {
        self.outside_since.is_some()
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn outside_since(&self) -> Option<DateTime<Utc>> {
        self.outside_since
    }

    pub fn outside_minutes(&self) -> f64 {
        self.outside_minutes
    }

    /// Bar-close check. Fires exactly once per confirmed break: once the
    /// engine is in DamageControl/EmergencyStop further closes keep the
    /// accumulator but propose nothing, and a return inside re-arms from
    /// zero.
    pub fn on_bar_close(
        &mut self,
        close: f64,
        outer_low: f64,
        outer_high: f64,
        atr: f64,
        state: Regime,
        now: DateTime<Utc>,
    ) -> Option<TriggerDecision> {
        let buffer = atr * self.atr_buffer_mult;
        let outside = close < outer_low - buffer || close > outer_high + buffer;

        if !outside {
            self.outside_minutes = 0.0;
            self.outside_since = None;
            self.confirmed = false;
            return None;
        }

        if self.outside_since.is_none() {
            self.outside_since = Some(now);
        }
        self.outside_minutes += self.bar_tf_minutes;

        if self.outside_minutes >= self.confirm_minutes && !self.confirmed {
            self.confirmed = true;
            if !matches!(state, Regime::DamageControl | Regime::EmergencyStop) {
                return Some(TriggerDecision {
                    target: Regime::DamageControl,
                    kind: TriggerKind::StructuralBreak,
                    reason: format!(
                        "structural_break_confirmed: close={close:.2} outside for {:.0}min",
                        self.outside_minutes
                    ),
                    value: self.outside_minutes,
                    threshold: self.confirm_minutes,
                    forced_reduce_target: None,
                });
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Price boundary
// ---------------------------------------------------------------------------

/// Immediate check for the mark price entering the buffer band just inside
/// the outer range edges.
#[derive(Debug)]
pub struct PriceBoundaryTrigger {
    buffer_atr_mult: f64,
    min_state_hold_minutes: i64,
}

impl PriceBoundaryTrigger {
    pub fn new(config: &PriceBoundaryConfig) -> Self {
        Self {
            buffer_atr_mult: config.buffer_atr_mult,
            min_state_hold_minutes: config.min_state_hold_minutes,
        }
    }

    fn held_long_enough(&self, state_since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match state_since {
            None => true,
            Some(since) => (now - since).num_minutes() >= self.min_state_hold_minutes,
        }
    }

    pub fn check(
        &self,
        mark_price: f64,
        atr: f64,
        outer_low: f64,
        outer_high: f64,
        state: Regime,
        state_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<TriggerDecision> {
        if state != Regime::Normal || atr <= 0.0 {
            return None;
        }
        // Anti-flap: the previous state must have held for a while.
        if !self.held_long_enough(state_since, now) {
            return None;
        }

        let buffer = atr * self.buffer_atr_mult;
        let lower_band = outer_low + buffer;
        let upper_band = outer_high - buffer;

        let (hit, side, band) = if mark_price <= lower_band {
            (true, "lower", lower_band)
        } else if mark_price >= upper_band {
            (true, "upper", upper_band)
        } else {
            (false, "", 0.0)
        };

        if hit {
            return Some(TriggerDecision {
                target: Regime::Defensive,
                kind: TriggerKind::PriceBoundary,
                reason: format!("price_boundary: mark={mark_price:.2} in {side} buffer zone"),
                value: mark_price,
                threshold: band,
                forced_reduce_target: None,
            });
        }
        None
    }

    /// Whether the price has returned deep enough inside the range for
    /// recovery (1.5x the entry buffer).
    pub fn in_safe_zone(&self, mark_price: f64, atr: f64, outer_low: f64, outer_high: f64) -> bool {
        let buffer = atr * self.buffer_atr_mult;
        let lower_safe = outer_low + buffer * 1.5;
        let upper_safe = outer_high - buffer * 1.5;
        mark_price >= lower_safe && mark_price <= upper_safe
    }

    pub fn recovery_hold_passed(
        &self,
        state_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        self.held_long_enough(state_since, now)
    }
}

// ---------------------------------------------------------------------------
// Emergency
// ---------------------------------------------------------------------------

/// Any-of conditions that bypass everything else and kill the engine.
#[derive(Debug)]
pub struct EmergencyTrigger {
    liq_distance_threshold: f64,
    margin_ratio_threshold: f64,
    api_fault_max_consecutive: u32,
    data_stale_seconds: u64,
    price_gap_atr_mult: f64,
}

impl EmergencyTrigger {
    pub fn new(risk: &RiskLimitsConfig) -> Self {
        Self {
            liq_distance_threshold: risk.liq_distance_threshold,
            margin_ratio_threshold: risk.margin_ratio_threshold,
            api_fault_max_consecutive: risk.api_fault_max_consecutive,
            data_stale_seconds: risk.data_stale_seconds,
            price_gap_atr_mult: risk.price_gap_atr_mult,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &self,
        liq_distance: Option<f64>,
        margin_ratio: f64,
        api_fault_count: u32,
        data_age_seconds: f64,
        price_delta_abs: f64,
        atr: f64,
    ) -> Option<TriggerDecision> {
        // A missing liquidation price skips that axis entirely.
        if let Some(dist) = liq_distance {
            if dist < self.liq_distance_threshold {
                return Some(decision(
                    TriggerKind::LiqDistance,
                    format!(
                        "liq_distance_critical: {:.2}% < {:.2}%",
                        dist * 100.0,
                        self.liq_distance_threshold * 100.0
                    ),
                    dist,
                    self.liq_distance_threshold,
                ));
            }
        }

        if margin_ratio < self.margin_ratio_threshold {
            return Some(decision(
                TriggerKind::MarginRatio,
                format!(
                    "margin_ratio_critical: {margin_ratio:.2} < {:.2}",
                    self.margin_ratio_threshold
                ),
                margin_ratio,
                self.margin_ratio_threshold,
            ));
        }

        if api_fault_count >= self.api_fault_max_consecutive {
            return Some(decision(
                TriggerKind::ApiFault,
                format!("api_fault: consecutive_failures={api_fault_count}"),
                api_fault_count as f64,
                self.api_fault_max_consecutive as f64,
            ));
        }

        if data_age_seconds >= self.data_stale_seconds as f64 {
            return Some(decision(
                TriggerKind::DataStale,
                format!(
                    "data_stale: age={data_age_seconds:.0}s >= {}s",
                    self.data_stale_seconds
                ),
                data_age_seconds,
                self.data_stale_seconds as f64,
            ));
        }

        if atr > 0.0 {
            let gap_threshold = atr * self.price_gap_atr_mult;
            if price_delta_abs > gap_threshold {
                return Some(decision(
                    TriggerKind::PriceGap,
                    format!("price_gap: |dP|={price_delta_abs:.2} > {gap_threshold:.2}"),
                    price_delta_abs,
                    gap_threshold,
                ));
            }
        }

        None
    }
}

fn decision(kind: TriggerKind, reason: String, value: f64, threshold: f64) -> TriggerDecision {
    TriggerDecision {
        target: Regime::EmergencyStop,
        kind,
        reason,
        value,
        threshold,
        forced_reduce_target: None,
    }
}
