// =============================================================================
// Engine — single-consumer event loop gluing facts to decisions to orders
// =============================================================================
//
// One logical ordering per event:
//   1. apply the event to its primitive (inventory on fill, volatility on bar
//      close, account view on price tick)
//   2. rebuild trigger inputs from the resulting snapshot
//   3. evaluate triggers in priority order
//   4. on a firing trigger, run the state-machine transition (bound entry
//      actions + audits)
//   5. regenerate the desired order set (grid + skew)
//   6. diff through the order manager and hand placements/cancellations to
//      the execution adapter
//   7. adapter fills feed back in and are processed before the next event
//
// All mutation happens on this one task; adapters publish into the queue.
// Control ticks are virtual events injected when wall-clock crosses the
// interval boundary, never interleaved with an in-flight event.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::account::AccountView;
use crate::advantage::AdvantageGate;
use crate::audit::{AuditEvent, AuditJournal, AuditKind};
use crate::config::EngineConfig;
use crate::derisk::{DeRiskEngine, DeRiskInputs};
use crate::execution::{self, Broker, ExecError, FillEvent};
use crate::grid::{GridContext, GridEngine};
use crate::inventory::{Breakeven, Inventory};
use crate::market_data::Candle;
use crate::orders::OrderManager;
use crate::risk::{RiskEngine, RiskInputs, TriggerDecision, TriggerKind};
use crate::skew::SkewEngine;
use crate::snapshot::Snapshot;
use crate::state::{OrderMode, Regime};
use crate::state_machine::{CancelFilter, GridActuator, StateMachine};
use crate::types::Side;
use crate::volatility::VolatilityModel;

/// Events the decision core consumes, in arrival order.
#[derive(Debug)]
pub enum EngineEvent {
    BarClose(Candle),
    PriceUpdate { mark: f64, last: f64 },
    Fill(FillEvent),
    /// Venue-reported account fields (live reconciliation).
    AccountUpdate {
        equity: f64,
        available: f64,
        margin_used: f64,
        margin_ratio: f64,
        liq_price: Option<f64>,
    },
    /// Virtual event on wall-clock interval boundaries.
    ControlTick,
    /// Periodic liveness check driving the data-staleness axis.
    Heartbeat,
    /// Operator-requested recovery out of EmergencyStop.
    OperatorReset,
    Shutdown,
}

/// Shared read view for the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub session_id: String,
    pub config_hash: String,
    pub regime: String,
    pub order_mode: String,
    pub mark_price: f64,
    pub inventory_ratio: f64,
    /// Ratio drift per minute over the trailing hour.
    pub inventory_slope: f64,
    pub position_qty: f64,
    pub equity: f64,
    pub opportunity_valid: bool,
    pub opportunity_score: f64,
    pub core_zone: (f64, f64),
    pub active_orders: usize,
    pub paused: bool,
    pub events_processed: u64,
}

/// Buffers venue commands requested by entry actions; the engine flushes them
/// immediately after the transition returns, keeping the adapter seam outside
/// the state machine.
struct EngineActuator<'a> {
    orders: &'a mut OrderManager,
    pending_cancels: Vec<String>,
    exit_requested: bool,
}

impl GridActuator for EngineActuator<'_> {
    fn set_mode(&mut self, mode: OrderMode) {
        self.orders.set_mode(mode);
    }

    fn cancel_orders_by_filter(&mut self, filter: CancelFilter) -> usize {
        let ids = self.orders.ids_matching(filter);
        for id in &ids {
            self.orders.on_cancelled(id);
        }
        self.pending_cancels.extend(ids.iter().cloned());
        ids.len()
    }

    fn emergency_exit(&mut self) -> String {
        self.exit_requested = true;
        "requested".to_string()
    }
}

pub struct Engine {
    config: EngineConfig,
    session_id: String,
    config_hash: String,

    journal: AuditJournal,
    machine: StateMachine,
    risk: RiskEngine,
    vol: VolatilityModel,
    inventory: Inventory,
    breakeven: Breakeven,
    account: AccountView,
    gate: AdvantageGate,
    grid: GridEngine,
    skew: SkewEngine,
    derisk: DeRiskEngine,
    orders: OrderManager,
    broker: Broker,

    status: Arc<RwLock<EngineStatus>>,

    mark_price: f64,
    last_price: f64,
    prev_tick_price: Option<f64>,
    last_data_at: Option<DateTime<Utc>>,
    data_stale_reported: bool,

    next_control_tick: DateTime<Utc>,
    events_processed: u64,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        broker: Broker,
        journal: AuditJournal,
        session_id: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        let config_hash = config.hash();
        let trader = &config.trader;
        let outer = (trader.outer_range_low, trader.outer_range_high);

        let status = Arc::new(RwLock::new(EngineStatus {
            session_id: session_id.clone(),
            config_hash: config_hash.clone(),
            regime: Regime::Normal.to_string(),
            order_mode: OrderMode::Full.to_string(),
            mark_price: 0.0,
            inventory_ratio: 0.0,
            inventory_slope: 0.0,
            position_qty: 0.0,
            equity: trader.initial_balance,
            opportunity_valid: true,
            opportunity_score: 0.5,
            core_zone: outer,
            active_orders: 0,
            paused: false,
            events_processed: 0,
        }));

        Self {
            machine: StateMachine::new(&session_id, outer),
            risk: RiskEngine::new(&config, &session_id),
            vol: VolatilityModel::new(
                &config.volatility,
                config.atr_ma_len(),
                config.bar_tf_minutes(),
            ),
            inventory: Inventory::new(config.max_inventory_notional()),
            breakeven: Breakeven::default(),
            account: AccountView::new(trader.initial_balance),
            gate: AdvantageGate::new(&config.zone, &session_id, &config_hash, outer.0, outer.1),
            grid: GridEngine::new(
                &config.grid,
                &session_id,
                &trader.symbol,
                trader.base_order_size,
            ),
            skew: SkewEngine::new(&config.skew),
            derisk: DeRiskEngine::new(&config.derisk),
            orders: OrderManager::new(&session_id, &config.orders),
            broker,
            journal,
            status,
            mark_price: 0.0,
            last_price: 0.0,
            prev_tick_price: None,
            last_data_at: None,
            data_stale_reported: false,
            next_control_tick: started_at
                + Duration::minutes(config.control.interval_minutes()),
            session_id,
            config_hash,
            config,
            events_processed: 0,
        }
    }

    pub fn status_handle(&self) -> Arc<RwLock<EngineStatus>> {
        self.status.clone()
    }

    /// Startup bookkeeping: the session-start `param_update` (startup is not
    /// a transition, so no `state_change` is written).
    pub fn initialize(&mut self, now: DateTime<Utc>) -> Result<()> {
        let event = AuditEvent::param_update(
            &self.session_id,
            now,
            "session",
            serde_json::Value::Null,
            serde_json::json!(self.session_id),
            &self.config_hash,
            "startup",
        );
        self.journal.write(&event)?;

        info!(
            session_id = %self.session_id,
            config_hash = %self.config_hash,
            symbol = %self.config.trader.symbol,
            outer_range_low = self.config.trader.outer_range_low,
            outer_range_high = self.config.trader.outer_range_high,
            "engine initialised"
        );
        Ok(())
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    pub async fn run(mut self, mut rx: UnboundedReceiver<EngineEvent>) -> Result<()> {
        let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(10));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let until_tick = (self.next_control_tick - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let now = Utc::now();
                    if matches!(event, EngineEvent::Shutdown) {
                        self.shutdown(now).await;
                        break;
                    }
                    self.handle_event(event, now).await;
                }
                _ = tokio::time::sleep(until_tick) => {
                    let now = Utc::now();
                    self.handle_event(EngineEvent::ControlTick, now).await;
                }
                _ = heartbeat.tick() => {
                    let now = Utc::now();
                    self.handle_event(EngineEvent::Heartbeat, now).await;
                }
            }
        }
        Ok(())
    }

    /// Process one event to completion, including any fills the adapter
    /// produced as a consequence.
    pub async fn handle_event(&mut self, event: EngineEvent, now: DateTime<Utc>) {
        self.events_processed += 1;

        match event {
            EngineEvent::BarClose(candle) => self.on_bar_close(candle, now).await,
            EngineEvent::PriceUpdate { mark, last } => self.on_price_update(mark, last, now).await,
            EngineEvent::Fill(fill) => self.process_fill(fill, now).await,
            EngineEvent::AccountUpdate {
                equity,
                available,
                margin_used,
                margin_ratio,
                liq_price,
            } => {
                self.on_account_update(equity, available, margin_used, margin_ratio, liq_price, now)
                    .await
            }
            EngineEvent::ControlTick => self.on_control_tick(now).await,
            EngineEvent::Heartbeat => self.on_heartbeat(now).await,
            EngineEvent::OperatorReset => self.on_operator_reset(now).await,
            EngineEvent::Shutdown => self.shutdown(now).await,
        }

        // Adapter feedback: drain fills generated by anything above (sim IOC
        // reductions, emergency exits) before the next queue event.
        loop {
            let fills = match self.broker.poll_fills().await {
                Ok(fills) => fills,
                Err(e) => {
                    warn!(error = %e, "fill poll failed");
                    break;
                }
            };
            if fills.is_empty() {
                break;
            }
            for fill in fills {
                self.process_fill(fill, now).await;
            }
        }

        self.publish_status();
    }

    // =========================================================================
    // Event handlers
    // =========================================================================

    async fn on_bar_close(&mut self, candle: Candle, now: DateTime<Utc>) {
        // 1. Primitives.
        self.vol.on_bar_close(candle.high, candle.low, candle.close, now);
        self.inventory.update_price(candle.close, now);
        self.mark_price = candle.close;
        self.last_price = candle.close;
        self.last_data_at = Some(now);
        self.data_stale_reported = false;
        self.refresh_account(now);

        let vol = self.vol.snapshot();
        self.orders.update_atr(vol.atr);
        self.gate.observe(
            now,
            candle.close,
            self.inventory.ratio(),
            self.breakeven.price(),
        );

        // Sim matching runs against the closed bar; resulting fills are
        // processed before any risk decision so inventory is current.
        let fills = self.broker.on_bar_close(&candle, now);
        for fill in fills {
            self.process_fill(fill, now).await;
        }

        // 2-4. Triggers.
        let snapshot = self.snapshot(now);
        let inputs = self.risk_inputs();
        let decision = self.risk.evaluate_on_bar_close(
            now,
            candle.close,
            &inputs,
            &snapshot,
            &mut self.journal,
        );
        if let Some(decision) = decision {
            self.apply_decision(decision, now).await;
        }

        // Harvest / de-risk / house-money arbitration rides the bar cadence.
        self.evaluate_derisk(now).await;

        // 5-6. Orders.
        self.refresh_orders(now).await;
    }

    async fn on_price_update(&mut self, mark: f64, last: f64, now: DateTime<Utc>) {
        let delta = match self.prev_tick_price {
            Some(prev) => (mark - prev).abs(),
            None => 0.0,
        };
        self.prev_tick_price = Some(mark);
        self.mark_price = mark;
        self.last_price = last;
        self.last_data_at = Some(now);
        self.data_stale_reported = false;

        self.inventory.update_price(mark, now);
        self.refresh_account(now);

        let snapshot = self.snapshot(now);
        let mut inputs = self.risk_inputs();
        inputs.price_delta_abs = delta;

        let decision = self
            .risk
            .evaluate_immediate(now, &inputs, &snapshot, &mut self.journal);
        if let Some(decision) = decision {
            self.apply_decision(decision, now).await;
        }

        self.refresh_orders(now).await;
    }

    async fn process_fill(&mut self, fill: FillEvent, now: DateTime<Utc>) {
        self.last_data_at = Some(now);

        // Realized PnL: a sell against the held cost basis books
        // qty * (price - breakeven) - fee; buys only pay their fee.
        let realized = match (fill.side, self.breakeven.price()) {
            (Side::Sell, Some(be)) => fill.fill_qty * (fill.fill_price - be) - fill.fee,
            _ => -fill.fee,
        };

        self.inventory
            .update_on_fill(fill.side, fill.fill_qty, fill.fill_price, now);
        self.breakeven
            .update_on_fill(fill.side, fill.fill_price, fill.fill_qty, fill.fee, 0.0);
        self.account.apply_realized(realized, now);
        self.mark_price = fill.fill_price;

        self.orders.apply_fill(
            &fill.client_order_id,
            fill.fill_qty,
            fill.fill_price,
            fill.is_partial,
            now,
        );

        let flat_after = self.inventory.position_qty().abs() < 1e-12;
        self.gate
            .record_fill(now, fill.fill_price, fill.fill_qty, fill.side, flat_after);
        if flat_after {
            self.breakeven.reset();
        }

        info!(
            client_order_id = %fill.client_order_id,
            side = %fill.side,
            fill_price = fill.fill_price,
            fill_qty = fill.fill_qty,
            inventory_ratio = self.inventory.ratio(),
            "fill processed"
        );

        self.refresh_account(now);

        let snapshot = self.snapshot(now);
        let inputs = self.risk_inputs();
        let decision = self
            .risk
            .evaluate_on_fill(now, &inputs, &snapshot, &mut self.journal);
        if let Some(decision) = decision {
            self.apply_decision(decision, now).await;
        }

        self.refresh_orders(now).await;
    }

    async fn on_control_tick(&mut self, now: DateTime<Utc>) {
        self.gate.on_control_tick(now, &mut self.journal);

        let (core_low, core_high) = self.gate.core_zone();
        self.machine.update_core_zone(core_low, core_high);

        self.next_control_tick =
            now + Duration::minutes(self.config.control.interval_minutes());

        self.refresh_orders(now).await;
    }

    async fn on_heartbeat(&mut self, now: DateTime<Utc>) {
        let age = self.data_age_seconds(now);
        if age >= self.config.risk.data_stale_seconds as f64 && !self.data_stale_reported {
            self.data_stale_reported = true;
            let event = AuditEvent::data_unavailable(
                &self.session_id,
                now,
                &format!("no market data for {age:.0}s"),
            );
            if let Err(e) = self.journal.write(&event) {
                error!(error = %e, "failed to write data_unavailable audit");
            }
        }

        let snapshot = self.snapshot(now);
        let inputs = self.risk_inputs_with_age(age);
        let decision = self
            .risk
            .evaluate_immediate(now, &inputs, &snapshot, &mut self.journal);
        if let Some(decision) = decision {
            self.apply_decision(decision, now).await;
        }
    }

    async fn on_operator_reset(&mut self, now: DateTime<Utc>) {
        if self.machine.current() != Regime::EmergencyStop {
            warn!("operator reset ignored: engine is not in EmergencyStop");
            return;
        }

        // The reset is honored only once the emergency axes are clear.
        let inputs = self.risk_inputs();
        if inputs.liq_distance.map_or(false, |d| d < self.config.risk.liq_distance_threshold)
            || inputs.margin_ratio < self.config.risk.margin_ratio_threshold
            || self.data_age_seconds(now) >= self.config.risk.data_stale_seconds as f64
        {
            warn!("operator reset refused: emergency conditions still present");
            return;
        }
        self.risk.reset_api_faults();

        let snapshot = self.snapshot(now);
        let this = &mut *self;
        let mut actuator = EngineActuator {
            orders: &mut this.orders,
            pending_cancels: Vec::new(),
            exit_requested: false,
        };
        let ok = this.machine.transition_to(
            Regime::Normal,
            "operator_reset",
            now,
            snapshot,
            &mut actuator,
            &mut this.journal,
        );
        if ok {
            info!("operator reset accepted; regime back to Normal");
            self.refresh_orders(now).await;
        }
    }

    /// Operator-initiated shutdown: EmergencyStop entry actions, then any
    /// order that never resolved is pinned in the journal as stuck.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) {
        info!("shutdown requested; entering EmergencyStop");
        let decision = TriggerDecision {
            target: Regime::EmergencyStop,
            kind: TriggerKind::Operator,
            reason: "operator_shutdown".to_string(),
            value: 0.0,
            threshold: 0.0,
            forced_reduce_target: None,
        };
        let _ = self.apply_transition(decision, now).await;

        for order in self.orders.active_orders() {
            let event = AuditEvent::order_stuck(
                &self.session_id,
                now,
                &order.client_order_id,
                "unresolved at shutdown deadline",
            );
            if let Err(e) = self.journal.write(&event) {
                error!(error = %e, "failed to write order_stuck audit");
            }
        }
    }

    // =========================================================================
    // Decision application
    // =========================================================================

    async fn apply_decision(&mut self, decision: TriggerDecision, now: DateTime<Utc>) {
        // Named stop events precede the transition they demand.
        let stop_kind = match decision.kind {
            TriggerKind::InventoryStop => Some(AuditKind::InventoryStop),
            TriggerKind::RiskBudget => Some(AuditKind::RiskBudgetStop),
            TriggerKind::StructuralBreak => Some(AuditKind::StructuralStop),
            _ => None,
        };
        if let Some(kind) = stop_kind {
            let event = AuditEvent::stop(
                kind,
                &self.session_id,
                now,
                &decision.kind.to_string(),
                decision.value,
                decision.threshold,
                &decision.reason,
                self.snapshot(now),
            );
            if let Err(e) = self.journal.write(&event) {
                error!(error = %e, "failed to write stop audit");
            }
        }

        let forced_reduce_target = decision.forced_reduce_target;
        self.apply_transition(decision, now).await;

        // Forced reduction runs regardless of whether the transition edge was
        // accepted: an inventory stop from a regime with no direct edge to
        // DamageControl must still unwind the position.
        if let Some(target_ratio) = forced_reduce_target {
            self.reduce_to(target_ratio, now).await;
        }
    }

    async fn apply_transition(&mut self, decision: TriggerDecision, now: DateTime<Utc>) -> bool {
        let snapshot = self.snapshot(now);

        let (ok, pending_cancels, exit_requested) = {
            let this = &mut *self;
            let mut actuator = EngineActuator {
                orders: &mut this.orders,
                pending_cancels: Vec::new(),
                exit_requested: false,
            };
            let ok = this.machine.transition_to(
                decision.target,
                &decision.reason,
                now,
                snapshot,
                &mut actuator,
                &mut this.journal,
            );
            (ok, actuator.pending_cancels, actuator.exit_requested)
        };

        if !ok {
            warn!(target = %decision.target, reason = %decision.reason, "transition refused");
            return false;
        }

        // Flush the venue commands the entry actions buffered.
        for client_order_id in pending_cancels {
            if let Err(e) = self.broker.cancel_order(&client_order_id).await {
                self.note_exec_error(&e);
                warn!(client_order_id = %client_order_id, error = %e, "entry-action cancel failed");
            }
        }

        if exit_requested {
            let exit_result = execution::emergency_exit(
                &mut self.broker,
                &self.config.trader.symbol,
                self.inventory.position_qty(),
                self.mark_price,
                &self.config.exit,
                now,
            )
            .await;

            let mut event = AuditEvent::stop(
                AuditKind::EmergencyStop,
                &self.session_id,
                now,
                &decision.kind.to_string(),
                decision.value,
                decision.threshold,
                &decision.reason,
                self.snapshot(now),
            );
            event.exit_method = Some("IOC_LAYERED".to_string());
            event.exit_result = Some(exit_result);
            if let Err(e) = self.journal.write(&event) {
                error!(error = %e, "failed to write emergency_stop audit");
            }
        }

        true
    }

    async fn evaluate_derisk(&mut self, now: DateTime<Utc>) {
        let inputs = DeRiskInputs {
            regime: self.machine.current(),
            inventory_ratio: self.inventory.ratio(),
            breakeven_price: self.breakeven.price(),
            current_price: self.mark_price,
            opportunity_valid: self.gate.opportunity_valid(),
            opportunity_valid_minutes: self.gate.opportunity_valid_minutes(now),
            initial_equity: self.account.initial_equity,
            current_equity: self.account.equity,
        };
        if let Some(proposal) = self.derisk.evaluate(now, &inputs) {
            info!(
                reason = %proposal.reason,
                target_ratio = proposal.target_ratio,
                "reduction proposed"
            );
            self.reduce_to(proposal.target_ratio, now).await;
            self.derisk.on_reduce_executed(now);
        }
    }

    /// One reduce-only IOC batch sized from the ratio delta.
    async fn reduce_to(&mut self, target_ratio: f64, now: DateTime<Utc>) {
        let current_ratio = self.inventory.ratio();
        if current_ratio <= target_ratio || self.mark_price <= 0.0 {
            return;
        }
        let delta_notional =
            (current_ratio - target_ratio) * self.config.max_inventory_notional();
        let qty = (delta_notional / self.mark_price).min(self.inventory.position_qty().abs());
        if qty <= 0.0 {
            return;
        }

        let (side, price) = if self.inventory.is_long() {
            (Side::Sell, self.mark_price * 0.999)
        } else {
            (Side::Buy, self.mark_price * 1.001)
        };

        match self
            .broker
            .place_ioc_reduce(&self.config.trader.symbol, side, qty, price, now)
            .await
        {
            Ok(_) => {
                self.risk.reset_api_faults();
                info!(qty, target_ratio, "reduction batch placed");
            }
            Err(e) => {
                self.note_exec_error(&e);
                warn!(error = %e, "reduction batch failed");
            }
        }
    }

    // =========================================================================
    // Order refresh (grid + skew + diff + dispatch)
    // =========================================================================

    async fn refresh_orders(&mut self, now: DateTime<Utc>) {
        if self.mark_price <= 0.0 || self.status.read().paused {
            return;
        }

        let vol = self.vol.snapshot();
        let (core_low, core_high) = self.gate.core_zone();
        let ctx = GridContext {
            current_price: self.mark_price,
            regime: self.machine.current(),
            position_qty: self.inventory.position_qty(),
            atr: vol.atr,
            atr_ready: vol.atr_ready,
            outer_low: self.config.trader.outer_range_low,
            outer_high: self.config.trader.outer_range_high,
            core_low,
            core_high,
            opportunity_valid: self.gate.opportunity_valid(),
            now,
        };
        let mut desired = self.grid.generate(&ctx);

        // Conditional inventory tilt on core-zone rungs.
        let signed_ratio = self.inventory.signed_ratio();
        for order in &mut desired {
            let result = self.skew.apply(
                order.price,
                order.side,
                signed_ratio,
                ctx.regime,
                ctx.opportunity_valid,
                order.in_core,
            );
            if result.applied {
                order.price = result.price;
            }
        }

        let sync = self.orders.sync(&desired, now, &mut self.journal);

        for client_order_id in sync.to_cancel {
            match self.broker.cancel_order(&client_order_id).await {
                Ok(true) => {
                    self.orders.on_cancelled(&client_order_id);
                    self.risk.reset_api_faults();
                }
                Ok(false) => {
                    self.orders.mark_stuck(&client_order_id);
                    let event = AuditEvent::order_stuck(
                        &self.session_id,
                        now,
                        &client_order_id,
                        "venue refused cancellation",
                    );
                    if let Err(e) = self.journal.write(&event) {
                        error!(error = %e, "failed to write order_stuck audit");
                    }
                }
                Err(e) => {
                    self.note_exec_error(&e);
                    self.orders.mark_stuck(&client_order_id);
                }
            }
        }

        for order in sync.to_place {
            match self.broker.place_order(&order).await {
                Ok(exchange_id) => {
                    self.orders.register_placed(order, &exchange_id, now);
                    self.risk.reset_api_faults();
                }
                Err(e) => {
                    self.note_exec_error(&e);
                    warn!(
                        client_order_id = %order.client_order_id,
                        error = %e,
                        "placement failed"
                    );
                    self.orders.on_place_failed(&order);
                }
            }
        }
    }

    // =========================================================================
    // Inputs, snapshots, status
    // =========================================================================

    fn note_exec_error(&mut self, error: &ExecError) {
        // Transients already consumed their retry budget inside the adapter.
        if error.is_transient() {
            self.risk.record_api_fault();
        }
    }

    fn data_age_seconds(&self, now: DateTime<Utc>) -> f64 {
        match self.last_data_at {
            Some(at) => (now - at).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }

    fn refresh_account(&mut self, now: DateTime<Utc>) {
        let unrealized = match self.breakeven.price() {
            Some(be) if self.mark_price > 0.0 => {
                self.inventory.position_qty() * (self.mark_price - be)
            }
            _ => 0.0,
        };
        let margin_used = if self.config.trader.leverage > 0.0 {
            self.inventory.notional_value() / self.config.trader.leverage
        } else {
            0.0
        };
        self.account
            .update_mark(self.mark_price, unrealized, margin_used, now);
    }

    /// Venue-reported account fields; the margin and liquidation axes may
    /// turn critical here, so the immediate triggers run right after.
    async fn on_account_update(
        &mut self,
        equity: f64,
        available: f64,
        margin_used: f64,
        margin_ratio: f64,
        liq_price: Option<f64>,
        now: DateTime<Utc>,
    ) {
        self.account
            .update_from_venue(equity, available, margin_used, margin_ratio, liq_price, now);

        let snapshot = self.snapshot(now);
        let inputs = self.risk_inputs();
        let decision = self
            .risk
            .evaluate_immediate(now, &inputs, &snapshot, &mut self.journal);
        if let Some(decision) = decision {
            self.apply_decision(decision, now).await;
        }
    }

    fn risk_inputs(&self) -> RiskInputs {
        RiskInputs {
            state: self.machine.current(),
            state_since: self.machine.state_since(),
            inventory_ratio: self.inventory.ratio(),
            margin_usage: self.account.margin_usage(),
            drawdown: self.account.drawdown(),
            mark_price: self.mark_price,
            outer_low: self.config.trader.outer_range_low,
            outer_high: self.config.trader.outer_range_high,
            vol: self.vol.snapshot(),
            liq_distance: self.account.liq_distance(),
            margin_ratio: self.account.margin_ratio,
            data_age_seconds: 0.0,
            price_delta_abs: 0.0,
        }
    }

    fn risk_inputs_with_age(&self, data_age_seconds: f64) -> RiskInputs {
        let mut inputs = self.risk_inputs();
        inputs.data_age_seconds = data_age_seconds;
        inputs
    }

    fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let vol = self.vol.snapshot();
        let (core_low, core_high) = self.gate.core_zone();
        Snapshot {
            timestamp: now,
            mark_price: self.mark_price,
            last_price: self.last_price,
            state: self.machine.current(),
            inventory_ratio: self.inventory.ratio(),
            position_qty: self.inventory.position_qty(),
            breakeven_price: self.breakeven.price().unwrap_or(0.0),
            realized_pnl: self.account.realized_pnl,
            unrealized_pnl: self.account.unrealized_pnl,
            equity: self.account.equity,
            margin_usage: self.account.margin_usage(),
            liq_distance: self.account.liq_distance(),
            outer_range_low: self.config.trader.outer_range_low,
            outer_range_high: self.config.trader.outer_range_high,
            core_zone: Some((core_low, core_high)),
            active_orders: self.orders.summary(self.mark_price),
            atr: vol.atr,
            rv: vol.rv,
            vol_spike: vol.is_spike,
            structural_break_confirmed: self.risk.structural_confirmed(),
            outside_since: self.risk.outside_since(),
            config_hash: self.config_hash.clone(),
            session_id: self.session_id.clone(),
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.regime = self.machine.current().to_string();
        status.order_mode = self.orders.mode().to_string();
        status.mark_price = self.mark_price;
        status.inventory_ratio = self.inventory.ratio();
        status.inventory_slope = self.inventory.slope(60);
        status.position_qty = self.inventory.position_qty();
        status.equity = self.account.equity;
        status.opportunity_valid = self.gate.opportunity_valid();
        status.opportunity_score = self.gate.opportunity_score();
        status.core_zone = self.gate.core_zone();
        status.active_orders = self.orders.active_count();
        status.events_processed = self.events_processed;
    }

    // Test-facing accessors; the API goes through the status handle instead.
    pub fn regime(&self) -> Regime {
        self.machine.current()
    }

    pub fn order_mode(&self) -> OrderMode {
        self.orders.mode()
    }

    pub fn inventory_ratio(&self) -> f64 {
        self.inventory.ratio()
    }

    pub fn position_qty(&self) -> f64 {
        self.inventory.position_qty()
    }

    pub fn breakeven_price(&self) -> Option<f64> {
        self.breakeven.price()
    }

    pub fn journal(&self) -> &AuditJournal {
        &self.journal
    }

    pub fn active_orders(&self) -> Vec<crate::types::GridOrder> {
        self.orders.active_orders()
    }
}
