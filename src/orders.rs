// =============================================================================
// Order Manager — diffing, throttling, idempotence, mode enforcement
// =============================================================================
//
// Desired vs live orders are keyed by (grid_level, side):
//   key only in current             -> cancel
//   key only in desired             -> place
//   in both, price moved > threshold -> cancel now, place on a later pass
//   in both otherwise               -> keep
//
// The replace path is deliberately two-phase: a key is never re-emitted while
// its previous intent (a pending place or cancel) is unresolved, so fills and
// cancellations for one rung always resolve in issue order.
//
// Churn control: orders younger than min_order_lifetime_seconds are not
// cancellable via diff; cancellations are counted in a rolling 60 s window
// and crossing cancel_rate_limit_per_minute freezes the manager for
// freeze_duration_seconds (placement refused, `cancel_rate_exceeded`
// emitted).
//
// Idempotence: every client order ID ever processed is remembered;
// re-submission is refused with an `order_duplicate_blocked` audit.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditJournal};
use crate::config::OrderThrottleConfig;
use crate::snapshot::OrdersSummary;
use crate::state::OrderMode;
use crate::state_machine::CancelFilter;
use crate::types::{GridOrder, OrderStatus, Side};

/// Output of one diff pass.
#[derive(Debug, Default)]
pub struct SyncResult {
    pub to_place: Vec<GridOrder>,
    pub to_cancel: Vec<String>,
}

type LevelKey = (i32, Side);

pub struct OrderManager {
    session_id: String,
    throttle: OrderThrottleConfig,

    mode: OrderMode,
    active: HashMap<String, GridOrder>,
    created_at: HashMap<String, DateTime<Utc>>,
    processed_ids: HashSet<String>,

    cancel_window: VecDeque<DateTime<Utc>>,
    frozen_until: Option<DateTime<Utc>>,
    atr: f64,

    /// Keys with an unresolved place/cancel intent.
    inflight: HashSet<LevelKey>,
}

impl OrderManager {
    pub fn new(session_id: &str, throttle: &OrderThrottleConfig) -> Self {
        Self {
            session_id: session_id.to_string(),
            throttle: throttle.clone(),
            mode: OrderMode::Full,
            active: HashMap::new(),
            created_at: HashMap::new(),
            processed_ids: HashSet::new(),
            cancel_window: VecDeque::new(),
            frozen_until: None,
            atr: 0.0,
            inflight: HashSet::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Mode & inputs
    // -------------------------------------------------------------------------

    pub fn set_mode(&mut self, mode: OrderMode) {
        if self.mode != mode {
            debug!(from = %self.mode, to = %mode, "order mode changed");
        }
        self.mode = mode;
    }

    pub fn mode(&self) -> OrderMode {
        self.mode
    }

    pub fn update_atr(&mut self, atr: f64) {
        self.atr = atr;
    }

    pub fn is_frozen(&self, now: DateTime<Utc>) -> bool {
        matches!(self.frozen_until, Some(until) if now < until)
    }

    // -------------------------------------------------------------------------
    // Placement gate
    // -------------------------------------------------------------------------

    /// Mode enforcement + idempotence + freeze. Blocked orders are audited.
    pub fn can_place(
        &mut self,
        order: &GridOrder,
        now: DateTime<Utc>,
        journal: &mut AuditJournal,
    ) -> Result<(), String> {
        if self.is_frozen(now) {
            return Err("order_manager_frozen".to_string());
        }

        if let Err(reason) = self.mode_allows(order) {
            let event = AuditEvent::order_blocked(
                &self.session_id,
                now,
                &format!("{}_{}", order.side, order.grid_level),
                &self.mode.to_string(),
                &reason,
            );
            if let Err(e) = journal.write(&event) {
                tracing::error!(error = %e, "failed to write order_blocked audit");
            }
            return Err(reason);
        }

        if self.processed_ids.contains(&order.client_order_id) {
            let event =
                AuditEvent::duplicate_blocked(&self.session_id, now, &order.client_order_id);
            if let Err(e) = journal.write(&event) {
                tracing::error!(error = %e, "failed to write duplicate audit");
            }
            return Err("duplicate_order".to_string());
        }

        Ok(())
    }

    fn mode_allows(&self, order: &GridOrder) -> Result<(), String> {
        match self.mode {
            OrderMode::KillSwitch => Err("kill_switch_active".to_string()),
            OrderMode::ReduceOnly if !order.reduce_only => Err("reduce_only_mode".to_string()),
            OrderMode::NoNewBuys if order.side == Side::Buy && !order.reduce_only => {
                Err("no_new_buys_mode".to_string())
            }
            _ => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Diff
    // -------------------------------------------------------------------------

    /// Compute the place/cancel sets for the desired ladder against the live
    /// set this manager tracks.
    pub fn sync(
        &mut self,
        desired: &[GridOrder],
        now: DateTime<Utc>,
        journal: &mut AuditJournal,
    ) -> SyncResult {
        let mut result = SyncResult::default();

        if self.is_frozen(now) {
            return result;
        }
        self.frozen_until = None;

        let desired_by_key: HashMap<LevelKey, &GridOrder> = desired
            .iter()
            .map(|o| ((o.grid_level, o.side), o))
            .collect();
        let current_by_key: HashMap<LevelKey, GridOrder> = self
            .active
            .values()
            .filter(|o| o.is_open())
            .map(|o| ((o.grid_level, o.side), o.clone()))
            .collect();

        // Cancels: keys gone from desired, plus price moves beyond threshold.
        let mut marked_this_pass: Vec<LevelKey> = Vec::new();
        for (key, current) in &current_by_key {
            if self.inflight.contains(key) {
                continue;
            }
            let wants_cancel = match desired_by_key.get(key) {
                None => true,
                Some(desired) => self.price_moved(current, desired),
            };
            if !wants_cancel || !self.cancellable(current, now) {
                continue;
            }

            if !self.try_record_cancel(now, journal) {
                // Freeze tripped: nothing from this pass goes out, so the
                // keys staged above must not stay pinned as in-flight.
                for key in marked_this_pass {
                    self.inflight.remove(&key);
                }
                return SyncResult::default();
            }
            result.to_cancel.push(current.client_order_id.clone());
            self.inflight.insert(*key);
            marked_this_pass.push(*key);
        }

        // Places: keys not currently live. A replaced key re-enters here on a
        // later pass, after its cancel resolves.
        for (key, desired) in &desired_by_key {
            if current_by_key.contains_key(key) || self.inflight.contains(key) {
                continue;
            }
            match self.can_place(desired, now, journal) {
                Ok(()) => {
                    result.to_place.push((*desired).clone());
                    self.inflight.insert(*key);
                }
                Err(reason) => {
                    debug!(
                        client_order_id = %desired.client_order_id,
                        reason,
                        "placement suppressed"
                    );
                }
            }
        }

        result
    }

    fn price_moved(&self, current: &GridOrder, desired: &GridOrder) -> bool {
        let threshold = if self.atr > 0.0 {
            self.atr * self.throttle.price_change_threshold_atr_mult
        } else {
            // 5 bps fallback while ATR is cold.
            current.price * 0.0005
        };
        (current.price - desired.price).abs() > threshold
    }

    fn cancellable(&self, order: &GridOrder, now: DateTime<Utc>) -> bool {
        match self.created_at.get(&order.client_order_id) {
            None => true,
            Some(created) => {
                (now - *created).num_seconds() >= self.throttle.min_order_lifetime_seconds
            }
        }
    }

    /// Roll the cancel window forward and account one cancellation. Crossing
    /// the per-minute limit freezes the manager and emits the audit.
    fn try_record_cancel(&mut self, now: DateTime<Utc>, journal: &mut AuditJournal) -> bool {
        let cutoff = now - Duration::seconds(60);
        while matches!(self.cancel_window.front(), Some(ts) if *ts <= cutoff) {
            self.cancel_window.pop_front();
        }

        if self.cancel_window.len() >= self.throttle.cancel_rate_limit_per_minute {
            self.frozen_until =
                Some(now + Duration::seconds(self.throttle.freeze_duration_seconds));
            warn!(
                window = self.cancel_window.len(),
                limit = self.throttle.cancel_rate_limit_per_minute,
                "cancel rate limit hit; freezing order manager"
            );
            let event = AuditEvent::cancel_rate_exceeded(
                &self.session_id,
                now,
                &format!(
                    "cancel_rate_limit: {} in window >= {}",
                    self.cancel_window.len(),
                    self.throttle.cancel_rate_limit_per_minute
                ),
            );
            if let Err(e) = journal.write(&event) {
                tracing::error!(error = %e, "failed to write cancel_rate audit");
            }
            return false;
        }

        self.cancel_window.push_back(now);
        true
    }

    // -------------------------------------------------------------------------
    // Lifecycle resolution (from the execution adapter)
    // -------------------------------------------------------------------------

    /// A placement was acknowledged by the venue.
    pub fn register_placed(&mut self, mut order: GridOrder, exchange_id: &str, now: DateTime<Utc>) {
        order.exchange_order_id = Some(exchange_id.to_string());
        order.status = OrderStatus::Open;
        order.remaining_qty = order.qty;

        self.inflight.remove(&(order.grid_level, order.side));
        self.processed_ids.insert(order.client_order_id.clone());
        self.created_at.insert(order.client_order_id.clone(), now);
        self.active.insert(order.client_order_id.clone(), order);
    }

    /// A placement was refused by the venue.
    pub fn on_place_failed(&mut self, order: &GridOrder) {
        self.inflight.remove(&(order.grid_level, order.side));
        self.processed_ids.insert(order.client_order_id.clone());
    }

    /// A cancellation was acknowledged.
    pub fn on_cancelled(&mut self, client_order_id: &str) {
        if let Some(order) = self.active.remove(client_order_id) {
            self.inflight.remove(&(order.grid_level, order.side));
        }
        self.created_at.remove(client_order_id);
    }

    /// A cancellation could not be resolved; the order is pinned as stuck.
    pub fn mark_stuck(&mut self, client_order_id: &str) {
        if let Some(order) = self.active.get_mut(client_order_id) {
            order.status = OrderStatus::Stuck;
            self.inflight.remove(&(order.grid_level, order.side));
        }
    }

    /// Apply a fill to the tracked order; returns a copy of the updated
    /// order, if the fill correlated to one.
    pub fn apply_fill(
        &mut self,
        client_order_id: &str,
        fill_qty: f64,
        fill_price: f64,
        is_partial: bool,
        now: DateTime<Utc>,
    ) -> Option<GridOrder> {
        let order = self.active.get_mut(client_order_id)?;

        let prev_notional = order.avg_fill_price * order.filled_qty;
        order.filled_qty += fill_qty;
        order.remaining_qty = (order.qty - order.filled_qty).max(0.0);
        if order.filled_qty > 0.0 {
            order.avg_fill_price = (prev_notional + fill_price * fill_qty) / order.filled_qty;
        }
        order.updated_at = Some(now);
        order.status = if is_partial && order.remaining_qty > 1e-12 {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };

        let snapshot = order.clone();
        if snapshot.status == OrderStatus::Filled {
            self.active.remove(client_order_id);
            self.created_at.remove(client_order_id);
            self.inflight
                .remove(&(snapshot.grid_level, snapshot.side));
        }
        Some(snapshot)
    }

    // -------------------------------------------------------------------------
    // Entry-action filters & views
    // -------------------------------------------------------------------------

    /// Client IDs selected by a state-entry cancel filter.
    pub fn ids_matching(&self, filter: CancelFilter) -> Vec<String> {
        self.active
            .values()
            .filter(|o| match filter {
                CancelFilter::All => true,
                CancelFilter::NonReduceOnly => !o.reduce_only,
                CancelFilter::RiskyBuys {
                    core_low,
                    core_high,
                } => {
                    o.side == Side::Buy
                        && !o.reduce_only
                        && (o.price < core_low || o.price > core_high)
                }
            })
            .map(|o| o.client_order_id.clone())
            .collect()
    }

    pub fn active_orders(&self) -> Vec<GridOrder> {
        self.active.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Snapshot summary of the live set.
    pub fn summary(&self, mark_price: f64) -> OrdersSummary {
        let mut summary = OrdersSummary {
            total_count: self.active.len(),
            ..Default::default()
        };
        for order in self.active.values() {
            let distance = (order.price - mark_price).abs();
            match order.side {
                Side::Buy => {
                    summary.buy_count += 1;
                    summary.total_buy_notional += order.notional();
                    summary.max_buy_distance = summary.max_buy_distance.max(distance);
                }
                Side::Sell => {
                    summary.sell_count += 1;
                    summary.total_sell_notional += order.notional();
                    summary.max_sell_distance = summary.max_sell_distance.max(distance);
                }
            }
            if order.reduce_only {
                summary.reduce_only_count += 1;
            }
        }
        summary
    }
}
