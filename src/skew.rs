// =============================================================================
// Skew Engine — conditional price tilt toward inventory relief
// =============================================================================
//
// Gates (all must pass, otherwise skew is zero and the failing gate is
// reported): regime is Normal, the opportunity window is valid, the rung sits
// inside the core zone, and |signed inventory ratio| has crossed the skew
// threshold.
//
// When active: skew_ratio = sign * min(skew_max, excess * skew_per_inv_unit)
// and skewed_price = base_price * (1 + skew_ratio). A long book lowers sell
// prices and raises buy prices; a short book mirrors that.
// =============================================================================

use crate::config::SkewConfig;
use crate::state::Regime;
use crate::types::Side;

/// Outcome of one skew evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct SkewResult {
    pub price: f64,
    pub skew_ratio: f64,
    pub applied: bool,
    /// Gate state: "active" or the first failing gate.
    pub gate: String,
}

pub struct SkewEngine {
    skew_max: f64,
    skew_per_inv_unit: f64,
    inv_threshold: f64,
}

impl SkewEngine {
    pub fn new(config: &SkewConfig) -> Self {
        Self {
            skew_max: config.skew_max,
            skew_per_inv_unit: config.skew_per_inv_unit,
            inv_threshold: config.inv_threshold_for_skew,
        }
    }

    /// Tilt one rung price, or return it unchanged with the gate reason.
    pub fn apply(
        &self,
        base_price: f64,
        side: Side,
        signed_inventory_ratio: f64,
        regime: Regime,
        opportunity_valid: bool,
        in_core_zone: bool,
    ) -> SkewResult {
        if regime != Regime::Normal {
            return SkewResult {
                price: base_price,
                skew_ratio: 0.0,
                applied: false,
                gate: format!("state={regime}"),
            };
        }
        if !opportunity_valid {
            return SkewResult {
                price: base_price,
                skew_ratio: 0.0,
                applied: false,
                gate: "opportunity_invalid".to_string(),
            };
        }
        if !in_core_zone {
            return SkewResult {
                price: base_price,
                skew_ratio: 0.0,
                applied: false,
                gate: "outside_core_zone".to_string(),
            };
        }

        let magnitude = signed_inventory_ratio.abs();
        if magnitude < self.inv_threshold {
            return SkewResult {
                price: base_price,
                skew_ratio: 0.0,
                applied: false,
                gate: format!("inv_below_threshold={:.2}%", magnitude * 100.0),
            };
        }

        let excess = magnitude - self.inv_threshold;
        let size = (excess * self.skew_per_inv_unit).min(self.skew_max);
        if size <= 0.0 {
            return SkewResult {
                price: base_price,
                skew_ratio: 0.0,
                applied: false,
                gate: "no_skew_needed".to_string(),
            };
        }

        // Long book: lower sells to shed, raise buys to slow accumulation.
        // Short book: the mirror image.
        let sign = match (signed_inventory_ratio > 0.0, side) {
            (true, Side::Sell) => -1.0,
            (true, Side::Buy) => 1.0,
            (false, Side::Buy) => -1.0,
            (false, Side::Sell) => 1.0,
        };

        let skew_ratio = sign * size;
        SkewResult {
            price: base_price * (1.0 + skew_ratio),
            skew_ratio,
            applied: true,
            gate: "active".to_string(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SkewEngine {
        SkewEngine::new(&SkewConfig::default())
    }

    #[test]
    fn long_inventory_lowers_sells_raises_buys() {
        let engine = engine();

        let sell = engine.apply(85_000.0, Side::Sell, 0.50, Regime::Normal, true, true);
        assert!(sell.applied);
        assert!(sell.price < 85_000.0);
        // excess 0.20 * 0.1 = 0.02
        assert!((sell.skew_ratio + 0.02).abs() < 1e-12);

        let buy = engine.apply(84_000.0, Side::Buy, 0.50, Regime::Normal, true, true);
        assert!(buy.applied);
        assert!(buy.price > 84_000.0);
        assert!((buy.skew_ratio - 0.02).abs() < 1e-12);
    }

    #[test]
    fn short_inventory_mirrors() {
        let engine = engine();
        let buy = engine.apply(84_000.0, Side::Buy, -0.50, Regime::Normal, true, true);
        assert!(buy.applied);
        assert!(buy.price < 84_000.0);

        let sell = engine.apply(85_000.0, Side::Sell, -0.50, Regime::Normal, true, true);
        assert!(sell.price > 85_000.0);
    }

    #[test]
    fn skew_capped_at_max() {
        let config = SkewConfig {
            skew_max: 0.25,
            skew_per_inv_unit: 10.0, // absurdly steep to hit the cap
            inv_threshold_for_skew: 0.30,
        };
        let engine = SkewEngine::new(&config);
        let result = engine.apply(85_000.0, Side::Sell, 1.0, Regime::Normal, true, true);
        assert!((result.skew_ratio.abs() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn gates_report_first_failure() {
        let engine = engine();

        let r = engine.apply(85_000.0, Side::Sell, 0.50, Regime::Defensive, true, true);
        assert!(!r.applied);
        assert_eq!(r.gate, "state=Defensive");
        assert!((r.price - 85_000.0).abs() < f64::EPSILON);

        let r = engine.apply(85_000.0, Side::Sell, 0.50, Regime::Normal, false, true);
        assert_eq!(r.gate, "opportunity_invalid");

        let r = engine.apply(85_000.0, Side::Sell, 0.50, Regime::Normal, true, false);
        assert_eq!(r.gate, "outside_core_zone");

        let r = engine.apply(85_000.0, Side::Sell, 0.10, Regime::Normal, true, true);
        assert!(r.gate.starts_with("inv_below_threshold"));
    }

    #[test]
    fn threshold_boundary_is_inclusive_zero() {
        let engine = engine();
        // Exactly at the threshold the excess is zero: nothing to apply.
        let r = engine.apply(85_000.0, Side::Sell, 0.30, Regime::Normal, true, true);
        assert!(!r.applied);
    }
}
