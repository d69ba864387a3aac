// =============================================================================
// Grid Generator — the desired order set for the current tick
// =============================================================================
//
// Regime shapes:
//   Normal         up to N buys below price; reduce-only sells above, sized
//                  to cover the held inventory (a flat book quotes no sells)
//   Defensive      no buys; sells only within the core zone at the core step
//   DamageControl  reduce-only sells only
//   EmergencyStop  empty set
//
// An invalid opportunity window downgrades any regime (except EmergencyStop)
// to reduce-only sells.
//
// Spacing: base_step = ATR (configured fixed value while ATR is cold);
// core_step = base * core_compress_factor inside the core zone,
// buffer_step = base * buffer_expand_factor outside it. The last two rungs of
// each side taper by edge_decay_factor per step.
// =============================================================================

use chrono::{DateTime, Utc};

use crate::config::GridConfig;
use crate::state::Regime;
use crate::types::{GridOrder, OrderStatus, Side};

/// An intended ladder rung, before it becomes an order intent.
#[derive(Debug, Clone)]
pub struct GridLevel {
    pub level_id: i32,
    pub price: f64,
    pub side: Side,
    pub base_size: f64,
    pub decayed_size: f64,
    pub in_core: bool,
}

/// Everything the generator needs for one tick, read-only.
#[derive(Debug, Clone, Copy)]
pub struct GridContext {
    pub current_price: f64,
    pub regime: Regime,
    pub position_qty: f64,
    pub atr: f64,
    pub atr_ready: bool,
    pub outer_low: f64,
    pub outer_high: f64,
    pub core_low: f64,
    pub core_high: f64,
    pub opportunity_valid: bool,
    pub now: DateTime<Utc>,
}

pub struct GridEngine {
    session_id: String,
    symbol: String,
    base_size: f64,

    base_step_method: String,
    base_step_fixed: f64,
    core_compress_factor: f64,
    buffer_expand_factor: f64,
    n_buy_active: usize,
    m_sell_active: usize,
    edge_decay_factor: f64,

    /// Process-local monotonic sequence feeding client order IDs.
    order_sequence: u32,
}

impl GridEngine {
    pub fn new(config: &GridConfig, session_id: &str, symbol: &str, base_size: f64) -> Self {
        Self {
            session_id: session_id.to_string(),
            symbol: symbol.to_string(),
            base_size,
            base_step_method: config.base_step_method.clone(),
            base_step_fixed: config.base_step_fixed,
            core_compress_factor: config.core_compress_factor,
            buffer_expand_factor: config.buffer_expand_factor,
            n_buy_active: config.n_buy_active,
            m_sell_active: config.m_sell_active,
            edge_decay_factor: config.edge_decay_factor,
            order_sequence: 0,
        }
    }

    /// Materialize the desired order set.
    pub fn generate(&mut self, ctx: &GridContext) -> Vec<GridOrder> {
        if ctx.regime == Regime::EmergencyStop {
            return Vec::new();
        }

        // Opportunity gate: without a valid window the grid only unwinds.
        if !ctx.opportunity_valid {
            return self.reduce_only_sells(ctx, ctx.outer_high);
        }

        match ctx.regime {
            Regime::Normal => {
                let mut orders = self.buy_ladder(ctx);
                orders.extend(self.reduce_only_sells(ctx, ctx.outer_high));
                orders
            }
            Regime::Defensive => self.reduce_only_sells(ctx, ctx.core_high),
            Regime::DamageControl => self.reduce_only_sells(ctx, ctx.outer_high),
            Regime::EmergencyStop => Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Ladder construction
    // -------------------------------------------------------------------------

    fn base_step(&self, ctx: &GridContext) -> f64 {
        if self.base_step_method == "fixed" || !ctx.atr_ready || ctx.atr <= 0.0 {
            self.base_step_fixed
        } else {
            ctx.atr
        }
    }

    fn buy_ladder(&mut self, ctx: &GridContext) -> Vec<GridOrder> {
        let base_step = self.base_step(ctx);
        let core_step = base_step * self.core_compress_factor;
        let buffer_step = base_step * self.buffer_expand_factor;

        let mut levels = Vec::new();
        let mut price = ctx.current_price - core_step;

        for i in 0..self.n_buy_active {
            if price < ctx.outer_low {
                break;
            }
            let in_core = price >= ctx.core_low && price <= ctx.core_high;
            let decay = self.edge_decay(i, self.n_buy_active);

            levels.push(GridLevel {
                level_id: -(i as i32 + 1),
                price,
                side: Side::Buy,
                base_size: self.base_size,
                decayed_size: self.base_size * decay,
                in_core,
            });

            price -= if in_core { core_step } else { buffer_step };
        }

        levels
            .into_iter()
            .map(|level| self.order_from_level(ctx, level, false))
            .collect()
    }

    /// Sell rungs above price, sized to cover (and never exceed) the held
    /// inventory. Flat book means no sells.
    fn reduce_only_sells(&mut self, ctx: &GridContext, upper_bound: f64) -> Vec<GridOrder> {
        let mut remaining = ctx.position_qty;
        if remaining <= 0.0 {
            return Vec::new();
        }

        let base_step = self.base_step(ctx);
        let core_step = base_step * self.core_compress_factor;
        let buffer_step = base_step * self.buffer_expand_factor;

        let mut orders = Vec::new();
        let mut price = ctx.current_price + core_step;

        for i in 0..self.m_sell_active {
            if price > upper_bound || remaining <= 0.0 {
                break;
            }
            let in_core = price >= ctx.core_low && price <= ctx.core_high;
            let decay = self.edge_decay(i, self.m_sell_active);
            let qty = (self.base_size * decay).min(remaining);
            remaining -= qty;

            let level = GridLevel {
                level_id: i as i32 + 1,
                price,
                side: Side::Sell,
                base_size: self.base_size,
                decayed_size: qty,
                in_core,
            };
            orders.push(self.order_from_level(ctx, level, true));

            price += if in_core { core_step } else { buffer_step };
        }

        orders
    }

    /// Taper for the outermost two rungs of a side.
    fn edge_decay(&self, level_index: usize, max_levels: usize) -> f64 {
        if max_levels <= 1 {
            return 1.0;
        }
        let edge_start = max_levels.saturating_sub(2);
        if level_index < edge_start {
            return 1.0;
        }
        let steps = (level_index - edge_start + 1) as i32;
        self.edge_decay_factor.powi(steps)
    }

    fn order_from_level(&mut self, ctx: &GridContext, level: GridLevel, reduce_only: bool) -> GridOrder {
        self.order_sequence += 1;
        GridOrder {
            client_order_id: GridOrder::make_client_order_id(
                &self.session_id,
                level.level_id,
                level.side,
                self.order_sequence,
            ),
            exchange_order_id: None,
            symbol: self.symbol.clone(),
            side: level.side,
            price: level.price,
            qty: level.decayed_size,
            reduce_only,
            grid_level: level.level_id,
            session_id: self.session_id.clone(),
            status: OrderStatus::Pending,
            filled_qty: 0.0,
            remaining_qty: level.decayed_size,
            avg_fill_price: 0.0,
            created_at: ctx.now,
            updated_at: None,
            in_core: level.in_core,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> GridEngine {
        GridEngine::new(&GridConfig::default(), "s_test", "BTCUSDT", 0.001)
    }

    fn ctx(regime: Regime, position_qty: f64) -> GridContext {
        GridContext {
            current_price: 85_000.0,
            regime,
            position_qty,
            atr: 200.0,
            atr_ready: true,
            outer_low: 76_000.0,
            outer_high: 97_000.0,
            core_low: 76_000.0,
            core_high: 97_000.0,
            opportunity_valid: true,
            now: Utc::now(),
        }
    }

    #[test]
    fn cold_start_buys_only() {
        let mut engine = engine();
        let orders = engine.generate(&ctx(Regime::Normal, 0.0));

        let buys: Vec<_> = orders.iter().filter(|o| o.side == Side::Buy).collect();
        let sells: Vec<_> = orders.iter().filter(|o| o.side == Side::Sell).collect();
        assert_eq!(buys.len(), 5);
        assert!(sells.is_empty(), "flat inventory quotes no sells");

        // Buy levels are negative, descending in price.
        for (i, buy) in buys.iter().enumerate() {
            assert_eq!(buy.grid_level, -(i as i32 + 1));
            assert!(buy.price < 85_000.0);
            assert!(!buy.reduce_only);
        }
        for pair in buys.windows(2) {
            assert!(pair[0].price > pair[1].price);
        }
    }

    #[test]
    fn buys_bounded_by_outer_range() {
        let mut engine = engine();
        let mut c = ctx(Regime::Normal, 0.0);
        c.current_price = 76_200.0; // barely above outer_low
        let orders = engine.generate(&c);
        let buys: Vec<_> = orders.iter().filter(|o| o.side == Side::Buy).collect();
        assert!(buys.len() <= 2, "only rungs inside the range: {}", buys.len());
        for buy in buys {
            assert!(buy.price >= c.outer_low);
        }
    }

    #[test]
    fn inventory_grows_sell_side() {
        let mut engine = engine();

        // 0.0006 held: one sell covering exactly that.
        let orders = engine.generate(&ctx(Regime::Normal, 0.0006));
        let sells: Vec<_> = orders.iter().filter(|o| o.side == Side::Sell).collect();
        assert_eq!(sells.len(), 1);
        assert!((sells[0].qty - 0.0006).abs() < 1e-12);
        assert!(sells[0].reduce_only);
        assert_eq!(sells[0].grid_level, 1);
        assert!(sells[0].price > 85_000.0);

        // 0.0035 held: several rungs, total never exceeding the position.
        let orders = engine.generate(&ctx(Regime::Normal, 0.0035));
        let sells: Vec<_> = orders.iter().filter(|o| o.side == Side::Sell).collect();
        assert!(sells.len() > 1);
        let total: f64 = sells.iter().map(|o| o.qty).sum();
        assert!(total <= 0.0035 + 1e-12);
    }

    #[test]
    fn core_step_compresses_spacing() {
        let mut engine = engine();
        let mut c = ctx(Regime::Normal, 0.0);
        c.core_low = 84_500.0;
        c.core_high = 86_000.0;

        let orders = engine.generate(&c);
        let buys: Vec<_> = orders.iter().filter(|o| o.side == Side::Buy).collect();

        // First steps (in core) use 0.7 * 200 = 140; once the ladder leaves
        // the core, steps expand to 1.3 * 200 = 260.
        let step1 = 85_000.0 - buys[0].price;
        assert!((step1 - 140.0).abs() < 1e-6, "step1 {step1}");

        let in_core_count = buys.iter().filter(|o| o.in_core).count();
        assert!(in_core_count >= 1 && in_core_count < buys.len());
    }

    #[test]
    fn edge_decay_tapers_last_two_rungs() {
        let mut engine = engine();
        let orders = engine.generate(&ctx(Regime::Normal, 0.0));
        let buys: Vec<_> = orders.iter().filter(|o| o.side == Side::Buy).collect();
        assert_eq!(buys.len(), 5);

        // Levels 1..3 full size, level 4 decayed once, level 5 twice.
        assert!((buys[0].qty - 0.001).abs() < 1e-12);
        assert!((buys[2].qty - 0.001).abs() < 1e-12);
        assert!((buys[3].qty - 0.001 * 0.7).abs() < 1e-12);
        assert!((buys[4].qty - 0.001 * 0.49).abs() < 1e-12);
    }

    #[test]
    fn defensive_sells_confined_to_core() {
        let mut engine = engine();
        let mut c = ctx(Regime::Defensive, 0.01);
        c.core_low = 84_000.0;
        c.core_high = 85_400.0;

        let orders = engine.generate(&c);
        assert!(!orders.is_empty());
        for order in &orders {
            assert_eq!(order.side, Side::Sell);
            assert!(order.reduce_only);
            assert!(order.price <= c.core_high);
        }
    }

    #[test]
    fn damage_control_reduce_only_sells() {
        let mut engine = engine();
        let orders = engine.generate(&ctx(Regime::DamageControl, 0.01));
        assert!(!orders.is_empty());
        for order in &orders {
            assert_eq!(order.side, Side::Sell);
            assert!(order.reduce_only);
            assert!(order.grid_level > 0);
        }
    }

    #[test]
    fn emergency_stop_generates_nothing() {
        let mut engine = engine();
        assert!(engine.generate(&ctx(Regime::EmergencyStop, 0.01)).is_empty());
    }

    #[test]
    fn invalid_opportunity_downgrades_to_reduce_only() {
        let mut engine = engine();
        let mut c = ctx(Regime::Normal, 0.01);
        c.opportunity_valid = false;

        let orders = engine.generate(&c);
        assert!(!orders.is_empty());
        for order in &orders {
            assert_eq!(order.side, Side::Sell);
            assert!(order.reduce_only);
        }
    }

    #[test]
    fn cold_atr_falls_back_to_fixed_step() {
        let mut engine = engine();
        let mut c = ctx(Regime::Normal, 0.0);
        c.atr_ready = false;
        c.atr = 0.0;

        let orders = engine.generate(&c);
        let first_buy = orders.iter().find(|o| o.side == Side::Buy).unwrap();
        // base_step_fixed (100) * core_compress (0.7) = 70
        assert!((85_000.0 - first_buy.price - 70.0).abs() < 1e-6);
    }

    #[test]
    fn client_ids_are_unique_and_monotonic() {
        let mut engine = engine();
        let a = engine.generate(&ctx(Regime::Normal, 0.002));
        let b = engine.generate(&ctx(Regime::Normal, 0.002));
        let mut ids: Vec<&str> = a
            .iter()
            .chain(b.iter())
            .map(|o| o.client_order_id.as_str())
            .collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before, "client order IDs must never repeat");
    }
}
