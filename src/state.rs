// =============================================================================
// Operating Regimes — permission matrix and transition graph
// =============================================================================
//
// Four regimes with fixed permissions (first match in the table is the whole
// story; nothing else may override it):
//
//   Normal        — full ladder, re-anchor allowed (subject to cooldown/cap)
//   Defensive     — no new buys, sells allowed, reduce-only recommended
//   DamageControl — reduce-only enforced
//   EmergencyStop — kill switch; recovery only via operator reset
//
// Legal transitions:
//   Normal        → Defensive | EmergencyStop
//   Defensive     → Normal | DamageControl | EmergencyStop
//   DamageControl → Normal | Defensive | EmergencyStop
//   EmergencyStop → Normal (operator reset only)
// =============================================================================

use serde::{Deserialize, Serialize};

/// Operating regime of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Normal,
    Defensive,
    DamageControl,
    EmergencyStop,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Defensive => write!(f, "Defensive"),
            Self::DamageControl => write!(f, "DamageControl"),
            Self::EmergencyStop => write!(f, "EmergencyStop"),
        }
    }
}

/// Order-manager mode bound to each regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderMode {
    Full,
    NoNewBuys,
    ReduceOnly,
    KillSwitch,
}

impl std::fmt::Display for OrderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Full"),
            Self::NoNewBuys => write!(f, "NoNewBuys"),
            Self::ReduceOnly => write!(f, "ReduceOnly"),
            Self::KillSwitch => write!(f, "KillSwitch"),
        }
    }
}

/// What a regime permits. Constant per regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub allow_new_buy: bool,
    pub allow_refill_buy: bool,
    pub allow_sell: bool,
    pub allow_reduce_only: bool,
    pub allow_reanchor: bool,
    pub order_mode: OrderMode,
}

impl Permissions {
    pub fn can_increase_inventory(&self) -> bool {
        self.allow_new_buy || self.allow_refill_buy
    }
}

impl Regime {
    /// The constant permission record for this regime.
    pub fn permissions(self) -> Permissions {
        match self {
            Self::Normal => Permissions {
                allow_new_buy: true,
                allow_refill_buy: true,
                allow_sell: true,
                allow_reduce_only: false,
                // Still subject to cooldown and daily-cap constraints.
                allow_reanchor: true,
                order_mode: OrderMode::Full,
            },
            Self::Defensive => Permissions {
                allow_new_buy: false,
                allow_refill_buy: false,
                allow_sell: true,
                allow_reduce_only: true,
                allow_reanchor: false,
                order_mode: OrderMode::NoNewBuys,
            },
            Self::DamageControl => Permissions {
                allow_new_buy: false,
                allow_refill_buy: false,
                allow_sell: true,
                allow_reduce_only: true,
                allow_reanchor: false,
                order_mode: OrderMode::ReduceOnly,
            },
            Self::EmergencyStop => Permissions {
                allow_new_buy: false,
                allow_refill_buy: false,
                allow_sell: true,
                allow_reduce_only: true,
                allow_reanchor: false,
                order_mode: OrderMode::KillSwitch,
            },
        }
    }

    /// All regimes, for exhaustive property checks.
    pub const ALL: [Regime; 4] = [
        Regime::Normal,
        Regime::Defensive,
        Regime::DamageControl,
        Regime::EmergencyStop,
    ];
}

/// Whether `from -> to` is a legal transition. Staying in place is legal.
pub fn is_valid_transition(from: Regime, to: Regime) -> bool {
    if from == to {
        return true;
    }
    match from {
        Regime::Normal => matches!(to, Regime::Defensive | Regime::EmergencyStop),
        Regime::Defensive => matches!(
            to,
            Regime::Normal | Regime::DamageControl | Regime::EmergencyStop
        ),
        Regime::DamageControl => matches!(
            to,
            Regime::Normal | Regime::Defensive | Regime::EmergencyStop
        ),
        // Recovery from EmergencyStop requires operator reset.
        Regime::EmergencyStop => matches!(to, Regime::Normal),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_exact() {
        use Regime::*;
        let legal = [
            (Normal, Defensive),
            (Normal, EmergencyStop),
            (Defensive, Normal),
            (Defensive, DamageControl),
            (Defensive, EmergencyStop),
            (DamageControl, Normal),
            (DamageControl, Defensive),
            (DamageControl, EmergencyStop),
            (EmergencyStop, Normal),
        ];

        for from in Regime::ALL {
            for to in Regime::ALL {
                let expected = from == to || legal.contains(&(from, to));
                assert_eq!(
                    is_valid_transition(from, to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn normal_skips_damage_control() {
        assert!(!is_valid_transition(Regime::Normal, Regime::DamageControl));
    }

    #[test]
    fn emergency_only_recovers_to_normal() {
        assert!(!is_valid_transition(Regime::EmergencyStop, Regime::Defensive));
        assert!(!is_valid_transition(
            Regime::EmergencyStop,
            Regime::DamageControl
        ));
        assert!(is_valid_transition(Regime::EmergencyStop, Regime::Normal));
    }

    #[test]
    fn permission_table_matches_matrix() {
        let normal = Regime::Normal.permissions();
        assert!(normal.allow_new_buy && normal.allow_refill_buy && normal.allow_sell);
        assert!(normal.allow_reanchor);
        assert_eq!(normal.order_mode, OrderMode::Full);

        let defensive = Regime::Defensive.permissions();
        assert!(!defensive.allow_new_buy && !defensive.allow_refill_buy);
        assert!(defensive.allow_sell && defensive.allow_reduce_only);
        assert!(!defensive.allow_reanchor);
        assert_eq!(defensive.order_mode, OrderMode::NoNewBuys);

        let damage = Regime::DamageControl.permissions();
        assert!(!damage.can_increase_inventory());
        assert_eq!(damage.order_mode, OrderMode::ReduceOnly);

        let emergency = Regime::EmergencyStop.permissions();
        assert!(!emergency.can_increase_inventory());
        assert_eq!(emergency.order_mode, OrderMode::KillSwitch);
    }
}
