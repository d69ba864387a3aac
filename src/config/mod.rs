// =============================================================================
// Engine Configuration — nested config tree with YAML loading and hashing
// =============================================================================
//
// Every numeric threshold the engine consults lives here; nothing is hard
// coded in the decision path. All sections carry `#[serde(default)]` so that
// a partial YAML file (or an older one missing new fields) still loads.
//
// The config hash is the first 8 hex chars of SHA-256 over the JSON
// canonicalisation of the tree (serde_json sorts object keys), recomputed at
// load and embedded in every `param_update` audit event.
//
// Persistence of the session snapshot uses an atomic tmp + rename pattern to
// prevent corruption on crash.
// =============================================================================

pub mod validator;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::types::MarketType;

// =============================================================================
// Sections
// =============================================================================

/// Trader-declared inputs: the instrument and the price corridor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderConfig {
    pub symbol: String,
    pub market_type: MarketType,

    /// Price corridor within which grid orders are allowed.
    pub outer_range_low: f64,
    pub outer_range_high: f64,

    /// Starting equity in quote currency.
    pub initial_balance: f64,
    pub leverage: f64,

    /// Base order size per rung, in base units.
    pub base_order_size: f64,

    /// Cap on position notional in quote units. When absent it is derived as
    /// `initial_balance * leverage * inv_cap_pct`.
    pub max_inventory_notional: Option<f64>,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            market_type: MarketType::Swap,
            outer_range_low: 80_000.0,
            outer_range_high: 90_000.0,
            initial_balance: 100.0,
            leverage: 10.0,
            base_order_size: 0.001,
            max_inventory_notional: None,
        }
    }
}

/// Inventory / margin / emergency thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimitsConfig {
    pub inv_warn: f64,
    pub inv_damage: f64,
    pub inv_stop: f64,
    pub inv_back_to_normal: f64,
    /// Forced-reduction target once `inv_stop` is breached.
    pub inv_stop_target: f64,
    /// Fraction of `balance * leverage` used when deriving the notional cap.
    pub inv_cap_pct: f64,

    pub margin_cap: f64,
    pub max_dd: f64,

    pub liq_distance_threshold: f64,
    pub margin_ratio_threshold: f64,
    pub api_fault_max_consecutive: u32,
    pub data_stale_seconds: u64,
    pub price_gap_atr_mult: f64,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            inv_warn: 0.55,
            inv_damage: 0.70,
            inv_stop: 0.85,
            inv_back_to_normal: 0.40,
            inv_stop_target: 0.45,
            inv_cap_pct: 0.30,
            margin_cap: 0.80,
            max_dd: 0.15,
            liq_distance_threshold: 0.03,
            margin_ratio_threshold: 1.2,
            api_fault_max_consecutive: 3,
            data_stale_seconds: 30,
            price_gap_atr_mult: 5.0,
        }
    }
}

/// Price-boundary trigger parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceBoundaryConfig {
    pub buffer_atr_mult: f64,
    pub min_state_hold_minutes: i64,
}

impl Default for PriceBoundaryConfig {
    fn default() -> Self {
        Self {
            buffer_atr_mult: 0.5,
            min_state_hold_minutes: 15,
        }
    }
}

/// Volatility primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityConfig {
    pub atr_len: usize,
    pub rv_len: usize,
    pub atr_ma_len_1m: usize,
    pub atr_ma_len_5m: usize,
    pub spike_mult: f64,
    pub clear_mult: f64,
    pub cooldown_minutes: i64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            atr_len: 14,
            rv_len: 20,
            atr_ma_len_1m: 480,
            atr_ma_len_5m: 96,
            spike_mult: 2.0,
            clear_mult: 1.3,
            cooldown_minutes: 60,
        }
    }
}

/// Structural-break confirmation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralStopConfig {
    pub atr_buffer_mult: f64,
    pub confirm_minutes: f64,
}

impl Default for StructuralStopConfig {
    fn default() -> Self {
        Self {
            atr_buffer_mult: 1.0,
            confirm_minutes: 240.0,
        }
    }
}

/// Core-zone and opportunity-window parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    pub t_zone_hours: i64,
    pub bin_size: f64,
    pub zone_cover: f64,
    pub zone_change_threshold: f64,

    /// Advantage-score weights: fill density / inventory reversion /
    /// breakeven slope.
    pub w1: f64,
    pub w2: f64,
    pub w3: f64,

    pub opportunity_valid_threshold: f64,
    pub opportunity_invalid_threshold: f64,
    pub opportunity_timeout_hours: i64,

    pub activity_lookback_minutes: i64,
    pub reversion_lookback_minutes: i64,
    pub breakeven_lookback_minutes: i64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            t_zone_hours: 48,
            bin_size: 50.0,
            zone_cover: 0.65,
            zone_change_threshold: 0.10,
            w1: 0.4,
            w2: 0.3,
            w3: 0.3,
            opportunity_valid_threshold: 0.4,
            opportunity_invalid_threshold: 0.25,
            opportunity_timeout_hours: 72,
            activity_lookback_minutes: 480,
            reversion_lookback_minutes: 60,
            breakeven_lookback_minutes: 240,
        }
    }
}

/// Ladder shape parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Bar timeframe driving the engine ("1m" or "5m").
    pub bar_tf: String,
    /// "atr" or "fixed".
    pub base_step_method: String,
    /// Fallback spacing when ATR is cold or method is "fixed".
    pub base_step_fixed: f64,
    pub core_compress_factor: f64,
    pub buffer_expand_factor: f64,
    pub n_buy_active: usize,
    pub m_sell_active: usize,
    pub edge_decay_factor: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            bar_tf: "1m".to_string(),
            base_step_method: "atr".to_string(),
            base_step_fixed: 100.0,
            core_compress_factor: 0.7,
            buffer_expand_factor: 1.3,
            n_buy_active: 5,
            m_sell_active: 5,
            edge_decay_factor: 0.7,
        }
    }
}

/// Inventory skew parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkewConfig {
    pub skew_max: f64,
    pub skew_per_inv_unit: f64,
    pub inv_threshold_for_skew: f64,
}

impl Default for SkewConfig {
    fn default() -> Self {
        Self {
            skew_max: 0.25,
            skew_per_inv_unit: 0.1,
            inv_threshold_for_skew: 0.30,
        }
    }
}

/// Harvest / de-risk / house-money parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeRiskConfig {
    pub harvest_profit_threshold: f64,
    pub harvest_inventory_ratio: f64,
    pub harvest_require_minutes: i64,

    pub derisk_efficiency_drop: f64,
    pub derisk_min_inventory: f64,

    pub house_money_profit_pct: f64,
    pub house_money_reduce_target: f64,

    pub reduce_batch_size: f64,
    pub reduce_cooldown_minutes: i64,
}

impl Default for DeRiskConfig {
    fn default() -> Self {
        Self {
            harvest_profit_threshold: 0.02,
            harvest_inventory_ratio: 0.35,
            harvest_require_minutes: 60,
            derisk_efficiency_drop: 0.30,
            derisk_min_inventory: 0.20,
            house_money_profit_pct: 0.05,
            house_money_reduce_target: 0.50,
            reduce_batch_size: 0.10,
            reduce_cooldown_minutes: 15,
        }
    }
}

/// Re-anchor constraints (cooldown, daily cap, range adjustment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReanchorConfig {
    pub offset_atr_mult: f64,
    pub cooldown_hours: i64,
    pub max_per_day: u32,
    pub range_shrink_ratio: f64,
}

impl Default for ReanchorConfig {
    fn default() -> Self {
        Self {
            offset_atr_mult: 1.0,
            cooldown_hours: 24,
            max_per_day: 2,
            range_shrink_ratio: 0.8,
        }
    }
}

/// Control-tick cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// "4h" or "1d".
    pub interval: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            interval: "4h".to_string(),
        }
    }
}

impl ControlConfig {
    pub fn interval_minutes(&self) -> i64 {
        match self.interval.as_str() {
            "1d" => 1440,
            _ => 240,
        }
    }
}

/// Order-lifecycle throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderThrottleConfig {
    pub min_order_lifetime_seconds: i64,
    pub price_change_threshold_atr_mult: f64,
    pub cancel_rate_limit_per_minute: usize,
    pub freeze_duration_seconds: i64,
}

impl Default for OrderThrottleConfig {
    fn default() -> Self {
        Self {
            min_order_lifetime_seconds: 30,
            price_change_threshold_atr_mult: 0.1,
            cancel_rate_limit_per_minute: 10,
            freeze_duration_seconds: 60,
        }
    }
}

/// Venue fee schedule in basis points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeesConfig {
    pub maker_fee_bps: f64,
    pub taker_fee_bps: f64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            maker_fee_bps: 2.0,
            taker_fee_bps: 6.0,
        }
    }
}

/// Emergency-exit layering discipline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub ioc_layers: u32,
    pub layer_step_pct: f64,
    pub market_fallback: bool,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            ioc_layers: 3,
            layer_step_pct: 0.002,
            market_fallback: true,
        }
    }
}

/// Sim-broker matching behaviour (dry-run and tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub partial_fill_enabled: bool,
    pub partial_fill_ratio: f64,
    pub max_fills_per_bar: usize,
    pub slippage_bps: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            partial_fill_enabled: false,
            partial_fill_ratio: 0.5,
            max_fills_per_bar: 2,
            slippage_bps: 5.0,
        }
    }
}

/// Operator API surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3001".to_string(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration tree for the grid engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub trader: TraderConfig,
    pub risk: RiskLimitsConfig,
    pub price_boundary: PriceBoundaryConfig,
    pub volatility: VolatilityConfig,
    pub structural: StructuralStopConfig,
    pub zone: ZoneConfig,
    pub grid: GridConfig,
    pub skew: SkewConfig,
    pub derisk: DeRiskConfig,
    pub reanchor: ReanchorConfig,
    pub control: ControlConfig,
    pub orders: OrderThrottleConfig,
    pub fees: FeesConfig,
    pub exit: ExitConfig,
    pub sim: SimConfig,
    pub api: ApiConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.trader.symbol,
            outer_range_low = config.trader.outer_range_low,
            outer_range_high = config.trader.outer_range_high,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist a YAML snapshot of this configuration next to the journal,
    /// using an atomic write (write to `.tmp`, then rename).
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let content =
            serde_yaml::to_string(self).context("failed to serialise config snapshot")?;

        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;

        info!(path = %path.display(), "config snapshot saved");
        Ok(())
    }

    /// First 8 hex characters of SHA-256 over the canonical JSON rendering of
    /// the tree. serde_json sorts object keys, so the hash is stable across
    /// field-declaration reorderings.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)[..8].to_string()
    }

    /// Effective notional cap for the inventory ratio denominator.
    pub fn max_inventory_notional(&self) -> f64 {
        self.trader.max_inventory_notional.unwrap_or(
            self.trader.initial_balance * self.trader.leverage * self.risk.inv_cap_pct,
        )
    }

    /// ATR-MA window for the spike detector, matched to the bar timeframe.
    pub fn atr_ma_len(&self) -> usize {
        match self.grid.bar_tf.as_str() {
            "5m" => self.volatility.atr_ma_len_5m,
            _ => self.volatility.atr_ma_len_1m,
        }
    }

    /// Bar timeframe expressed in minutes.
    pub fn bar_tf_minutes(&self) -> f64 {
        match self.grid.bar_tf.as_str() {
            "5m" => 5.0,
            "15m" => 15.0,
            "1h" => 60.0,
            _ => 1.0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_thresholds() {
        let cfg = EngineConfig::default();
        assert!((cfg.risk.inv_warn - 0.55).abs() < f64::EPSILON);
        assert!((cfg.risk.inv_damage - 0.70).abs() < f64::EPSILON);
        assert!((cfg.risk.inv_stop - 0.85).abs() < f64::EPSILON);
        assert!((cfg.risk.inv_back_to_normal - 0.40).abs() < f64::EPSILON);
        assert!((cfg.grid.core_compress_factor - 0.7).abs() < f64::EPSILON);
        assert!((cfg.grid.buffer_expand_factor - 1.3).abs() < f64::EPSILON);
        assert_eq!(cfg.orders.cancel_rate_limit_per_minute, 10);
        assert_eq!(cfg.control.interval_minutes(), 240);
        assert_eq!(cfg.atr_ma_len(), 480);
    }

    #[test]
    fn deserialise_empty_yaml_uses_defaults() {
        let cfg: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.trader.symbol, "BTCUSDT");
        assert_eq!(cfg.volatility.atr_len, 14);
        assert!((cfg.structural.confirm_minutes - 240.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_yaml_fills_defaults() {
        let yaml = r#"
trader:
  symbol: ETHUSDT
  outer_range_low: 2000.0
  outer_range_high: 3000.0
grid:
  bar_tf: 5m
"#;
        let cfg: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.trader.symbol, "ETHUSDT");
        assert!((cfg.trader.outer_range_low - 2000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.atr_ma_len(), 96);
        // Untouched sections keep their defaults.
        assert!((cfg.risk.margin_cap - 0.80).abs() < f64::EPSILON);
        assert_eq!(cfg.grid.n_buy_active, 5);
    }

    #[test]
    fn config_hash_is_stable_and_sensitive() {
        let cfg = EngineConfig::default();
        let h1 = cfg.hash();
        let h2 = cfg.hash();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 8);

        let mut changed = cfg.clone();
        changed.risk.inv_warn = 0.60;
        assert_ne!(h1, changed.hash());
    }

    #[test]
    fn derived_inventory_notional() {
        let mut cfg = EngineConfig::default();
        cfg.trader.initial_balance = 100.0;
        cfg.trader.leverage = 10.0;
        cfg.risk.inv_cap_pct = 0.30;
        cfg.trader.max_inventory_notional = None;
        assert!((cfg.max_inventory_notional() - 300.0).abs() < 1e-9);

        cfg.trader.max_inventory_notional = Some(5_000.0);
        assert!((cfg.max_inventory_notional() - 5_000.0).abs() < 1e-9);
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_snapshot.yaml");

        let cfg = EngineConfig::default();
        cfg.save_snapshot(&path).unwrap();

        let reloaded = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.hash(), reloaded.hash());
    }
}
