// =============================================================================
// Config Validator — invariants, recommended ranges, dangerous combinations
// =============================================================================
//
// Three classes of rule, checked at load time:
//
//   1. Hard invariants      — violation aborts startup.
//   2. Recommended ranges   — out-of-range values are logged as warnings.
//   3. Dangerous combos     — individually legal values that together leave
//                             too little risk buffer; abort startup.
//
// The caller is responsible for writing the `config_invalid` audit event
// before aborting.
// =============================================================================

use tracing::warn;

use crate::config::EngineConfig;

/// Outcome of a full validation pass.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub violations: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Run all three rule classes against `config`.
pub fn validate(config: &EngineConfig) -> ValidationResult {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();

    check_invariants(config, &mut violations);
    check_ranges(config, &mut warnings);
    check_dangerous_combinations(config, &mut violations);

    for w in &warnings {
        warn!(warning = %w, "config parameter outside recommended range");
    }

    ValidationResult {
        violations,
        warnings,
    }
}

fn check_invariants(config: &EngineConfig, violations: &mut Vec<String>) {
    let risk = &config.risk;

    if !(risk.inv_warn < risk.inv_damage && risk.inv_damage < risk.inv_stop) {
        violations.push(format!(
            "invariant violated: inv_warn ({}) < inv_damage ({}) < inv_stop ({})",
            risk.inv_warn, risk.inv_damage, risk.inv_stop
        ));
    }

    if risk.inv_back_to_normal >= risk.inv_warn {
        violations.push(format!(
            "invariant violated: inv_back_to_normal ({}) < inv_warn ({})",
            risk.inv_back_to_normal, risk.inv_warn
        ));
    }

    if config.skew.skew_max > 0.25 {
        violations.push(format!(
            "invariant violated: skew_max ({}) <= 0.25",
            config.skew.skew_max
        ));
    }

    let edf = config.grid.edge_decay_factor;
    if !(edf > 0.0 && edf < 1.0) {
        violations.push(format!(
            "invariant violated: edge_decay_factor ({edf}) must be in (0, 1)"
        ));
    }

    let trader = &config.trader;
    if trader.outer_range_low >= trader.outer_range_high {
        violations.push(format!(
            "invariant violated: outer_range_low ({}) < outer_range_high ({})",
            trader.outer_range_low, trader.outer_range_high
        ));
    }

    if trader.leverage <= 0.0 {
        violations.push(format!(
            "invariant violated: leverage ({}) must be positive",
            trader.leverage
        ));
    }

    if trader.base_order_size <= 0.0 {
        violations.push(format!(
            "invariant violated: base_order_size ({}) must be positive",
            trader.base_order_size
        ));
    }

    let ratio = config.sim.partial_fill_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        violations.push(format!(
            "invariant violated: sim partial_fill_ratio ({ratio}) must be in (0, 1]"
        ));
    }
}

fn check_ranges(config: &EngineConfig, warnings: &mut Vec<String>) {
    let risk = &config.risk;

    let checks: [(&str, f64, f64, f64); 4] = [
        ("inv_warn", risk.inv_warn, 0.40, 0.70),
        ("inv_damage", risk.inv_damage, 0.50, 0.85),
        ("inv_stop", risk.inv_stop, 0.70, 0.95),
        ("inv_back_to_normal", risk.inv_back_to_normal, 0.20, 0.50),
    ];
    for (name, value, lo, hi) in checks {
        if !(lo..=hi).contains(&value) {
            warnings.push(format!(
                "{name} ({value}) outside recommended range [{lo}, {hi}]"
            ));
        }
    }

    if !(0.50..=0.90).contains(&config.zone.zone_cover) {
        warnings.push(format!(
            "zone_cover ({}) outside recommended range [0.50, 0.90]",
            config.zone.zone_cover
        ));
    }

    if !(24..=168).contains(&config.zone.t_zone_hours) {
        warnings.push(format!(
            "t_zone_hours ({}) outside recommended range [24, 168]",
            config.zone.t_zone_hours
        ));
    }

    if config.trader.leverage > 20.0 {
        warnings.push(format!(
            "leverage ({}) above recommended maximum 20",
            config.trader.leverage
        ));
    }
}

fn check_dangerous_combinations(config: &EngineConfig, violations: &mut Vec<String>) {
    let risk = &config.risk;

    if risk.inv_stop - risk.inv_damage < 0.10 {
        violations.push(format!(
            "dangerous combination: inv_stop - inv_damage ({:.2}) < 0.10, risk buffer too small",
            risk.inv_stop - risk.inv_damage
        ));
    }

    if risk.liq_distance_threshold < 0.02 {
        violations.push(format!(
            "dangerous configuration: liq_distance_threshold ({}) < 0.02, too aggressive",
            risk.liq_distance_threshold
        ));
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let result = validate(&EngineConfig::default());
        assert!(result.is_valid(), "violations: {:?}", result.violations);
        assert!(result.warnings.is_empty(), "warnings: {:?}", result.warnings);
    }

    #[test]
    fn broken_inventory_ordering_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.risk.inv_warn = 0.75; // above inv_damage
        let result = validate(&cfg);
        assert!(!result.is_valid());
        assert!(result.violations.iter().any(|v| v.contains("inv_warn")));
    }

    #[test]
    fn back_to_normal_must_be_below_warn() {
        let mut cfg = EngineConfig::default();
        cfg.risk.inv_back_to_normal = 0.60;
        let result = validate(&cfg);
        assert!(!result.is_valid());
    }

    #[test]
    fn skew_cap_enforced() {
        let mut cfg = EngineConfig::default();
        cfg.skew.skew_max = 0.30;
        let result = validate(&cfg);
        assert!(!result.is_valid());
        assert!(result.violations.iter().any(|v| v.contains("skew_max")));
    }

    #[test]
    fn edge_decay_bounds() {
        let mut cfg = EngineConfig::default();
        cfg.grid.edge_decay_factor = 1.0;
        assert!(!validate(&cfg).is_valid());
        cfg.grid.edge_decay_factor = 0.0;
        assert!(!validate(&cfg).is_valid());
        cfg.grid.edge_decay_factor = 0.7;
        assert!(validate(&cfg).is_valid());
    }

    #[test]
    fn inverted_outer_range_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.trader.outer_range_low = 95_000.0;
        cfg.trader.outer_range_high = 90_000.0;
        assert!(!validate(&cfg).is_valid());
    }

    #[test]
    fn narrow_stop_buffer_is_dangerous() {
        let mut cfg = EngineConfig::default();
        cfg.risk.inv_damage = 0.80; // inv_stop (0.85) - 0.80 = 0.05 < 0.10
        let result = validate(&cfg);
        assert!(!result.is_valid());
        assert!(result
            .violations
            .iter()
            .any(|v| v.contains("risk buffer too small")));
    }

    #[test]
    fn tight_liq_distance_is_dangerous() {
        let mut cfg = EngineConfig::default();
        cfg.risk.liq_distance_threshold = 0.015;
        assert!(!validate(&cfg).is_valid());
    }

    #[test]
    fn out_of_range_values_warn_but_pass() {
        let mut cfg = EngineConfig::default();
        cfg.zone.zone_cover = 0.95;
        let result = validate(&cfg);
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("zone_cover")));
    }
}
