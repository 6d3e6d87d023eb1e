//! Risk monitor: fill detection, the stop-loss ladder and the circuit
//! breaker.
//!
//! Each pass polls every open entry for fills, then every position for its
//! take-profit status and current best bid. Positions walk the ladder
//!
//! ```text
//! MONITORING -> L1_WARN -> L2_TIMING -> EXITED
//! ```
//!
//! where L2_TIMING only ends in an exit after the bid has stayed below L2
//! for the full confirmation period without interruption. Any failure on
//! one order or position is logged and retried on the next pass.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{CircuitBreakerConfig, StopLossConfig};
use crate::engine::executor::ExecutionEngine;
use crate::engine::state::SharedState;
use crate::platforms::TradingClient;
use crate::storage::{PersistenceService, TradeRecord};
use crate::types::{
    EntryOrder, FillEvent, HardStopEvent, OrderState, OrderStatus, Position, Side, StopStage,
    TradeOutcome,
};

/// Last bid at or above this counts as a win when a position disappears
/// without our exit.
const RESOLUTION_MIDPOINT: Decimal = dec!(0.5);

// ---------------------------------------------------------------------------
// Stop-loss ladder
// ---------------------------------------------------------------------------

/// Result of feeding one bid observation through the ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LadderStep {
    pub stage: StopStage,
    pub l2_started_at: Option<DateTime<Utc>>,
    /// The bid has held below L2 for the full confirmation period.
    pub force_exit: bool,
}

/// Advance the ladder for one bid.
///
/// Pure in `(stage, timer, bid, now)`. The L2 timer survives only while
/// the previous stage was `L2Timing` and the bid is still below L2; any
/// observation at or above L2 clears it.
pub fn step_ladder(
    stage: StopStage,
    l2_started_at: Option<DateTime<Utc>>,
    bid: Decimal,
    now: DateTime<Utc>,
    cfg: &StopLossConfig,
) -> LadderStep {
    if stage == StopStage::Exited {
        return LadderStep {
            stage,
            l2_started_at: None,
            force_exit: false,
        };
    }

    if bid >= cfg.l1_trigger {
        return LadderStep {
            stage: StopStage::Monitoring,
            l2_started_at: None,
            force_exit: false,
        };
    }

    if bid >= cfg.l2_trigger {
        return LadderStep {
            stage: StopStage::L1Warn,
            l2_started_at: None,
            force_exit: false,
        };
    }

    let started = match (stage, l2_started_at) {
        (StopStage::L2Timing, Some(t)) => t,
        _ => now,
    };
    let confirm = Duration::seconds(cfg.l2_confirm_secs as i64);
    LadderStep {
        stage: StopStage::L2Timing,
        l2_started_at: Some(started),
        force_exit: now - started >= confirm,
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Sliding-window count of hard stops with a fixed cool-down.
///
/// The count is always recomputed from the pruned event list. Once
/// tripped, the cool-down runs from the trip moment; events recorded
/// during it do not extend it.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    window: Duration,
    max_events: usize,
    cooldown: Duration,
    events: Vec<HardStopEvent>,
    tripped_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(cfg: &CircuitBreakerConfig) -> Self {
        Self {
            window: Duration::hours(cfg.window_hours as i64),
            max_events: cfg.max_hard_stops,
            cooldown: Duration::hours(cfg.cooldown_hours as i64),
            events: Vec::new(),
            tripped_at: None,
        }
    }

    pub fn record(&mut self, event: HardStopEvent) {
        self.events.push(event);
    }

    /// Prune expired events and re-evaluate. Returns true while new entries
    /// must be suppressed.
    pub fn check(&mut self, now: DateTime<Utc>) -> bool {
        let cutoff = now - self.window;
        self.events.retain(|e| e.at > cutoff);

        if let Some(t) = self.tripped_at {
            if now < t + self.cooldown {
                return true;
            }
            info!(tripped_at = %t, "Circuit breaker cool-down over, entries resumed");
            self.tripped_at = None;
        }

        if self.events.len() >= self.max_events {
            self.tripped_at = Some(now);
            error!(
                hard_stops = self.events.len(),
                window_hours = self.window.num_hours(),
                cooldown_hours = self.cooldown.num_hours(),
                "CIRCUIT BREAKER TRIPPED, new entries suppressed"
            );
            return true;
        }
        false
    }

    pub fn is_tripped(&self, now: DateTime<Utc>) -> bool {
        self.tripped_at.is_some_and(|t| now < t + self.cooldown)
    }

    pub fn events(&self) -> &[HardStopEvent] {
        &self.events
    }

    pub fn tripped_at(&self) -> Option<DateTime<Utc>> {
        self.tripped_at
    }

    pub fn restore(&mut self, events: Vec<HardStopEvent>, tripped_at: Option<DateTime<Utc>>) {
        self.events = events;
        self.tripped_at = tripped_at;
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Counters for one monitoring pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub fills: usize,
    pub expired: usize,
    pub take_profits: usize,
    pub hard_stops: usize,
    pub resolved_externally: usize,
    pub breaker_tripped: bool,
}

pub struct RiskMonitor {
    client: Arc<dyn TradingClient>,
    executor: ExecutionEngine,
    state: Arc<SharedState>,
    store: Arc<dyn PersistenceService>,
    cfg: StopLossConfig,
}

impl RiskMonitor {
    pub fn new(
        client: Arc<dyn TradingClient>,
        executor: ExecutionEngine,
        state: Arc<SharedState>,
        store: Arc<dyn PersistenceService>,
        cfg: StopLossConfig,
    ) -> Self {
        Self {
            client,
            executor,
            state,
            store,
            cfg,
        }
    }

    /// One full monitoring pass.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        let mut report = PassReport {
            breaker_tripped: self.state.breaker_check(now),
            ..PassReport::default()
        };

        report.expired = self.executor.sweep_expired(now).await;

        for entry in self.state.entries() {
            if self.poll_entry(entry, now).await {
                report.fills += 1;
            }
        }

        for position in self.state.positions() {
            match self.check_position(position, now).await {
                Some(PositionExit::TakeProfit) => report.take_profits += 1,
                Some(PositionExit::HardStop) => report.hard_stops += 1,
                Some(PositionExit::External) => report.resolved_externally += 1,
                None => {}
            }
        }

        if report != PassReport::default() {
            debug!(?report, "Monitor pass");
        }
        report
    }

    // -- Fill detection ----------------------------------------------------

    /// Returns true if this call opened a position from the entry.
    async fn poll_entry(&self, entry: EntryOrder, now: DateTime<Utc>) -> bool {
        let order = match self.client.get_order(&entry.order_id).await {
            Ok(o) => o,
            Err(e) => {
                warn!(order_id = %entry.order_id, error = %e, "Entry status poll failed");
                return false;
            }
        };

        match order.status {
            OrderStatus::Filled => self.handle_fill(&order, now).await,
            OrderStatus::Cancelled => {
                if self.state.take_entry(&entry.order_id).is_some() {
                    warn!(order_id = %entry.order_id, "Entry cancelled at venue, deregistered");
                }
                false
            }
            OrderStatus::Live | OrderStatus::PartiallyFilled => false,
        }
    }

    async fn handle_fill(&self, order: &OrderState, now: DateTime<Utc>) -> bool {
        // Whoever removes the entry first owns it; a concurrent timeout
        // that already took it will have failed to cancel and put it back.
        let Some(entry) = self.state.take_entry(&order.order_id) else {
            return false;
        };

        let size = if order.size_matched > Decimal::ZERO {
            order.size_matched
        } else {
            entry.size
        };
        let fill = FillEvent {
            order_id: entry.order_id.clone(),
            token_id: entry.token_id.clone(),
            price: order.price,
            size,
        };

        let position = Position::from_fill(&entry, &fill, now);
        let token_id = position.token_id.clone();
        self.state.insert_position(position);
        info!(
            order_id = %fill.order_id,
            token_id = %token_id,
            price = %fill.price,
            size = %fill.size,
            bot = %entry.bot,
            "Entry filled, position opened"
        );

        let record = TradeRecord {
            bot: entry.bot.clone(),
            market_id: entry.market_id.clone(),
            token_id: entry.token_id.clone(),
            question: entry.question.clone(),
            category: entry.category.clone(),
            side: Side::Yes,
            entry_price: fill.price,
            size: fill.size,
            confidence: entry.confidence,
            features: entry.features.clone(),
            opened_at: now,
        };
        match self.store.log_trade(&record).await {
            Ok(id) => {
                self.state.modify_position(&token_id, |p| p.trade_id = Some(id));
            }
            Err(e) => warn!(token_id = %token_id, error = %e, "Trade logging failed"),
        }

        self.place_take_profit(&fill).await;
        true
    }

    async fn place_take_profit(&self, fill: &FillEvent) {
        match self.executor.on_fill(fill).await {
            Ok(Some(tp_id)) => {
                self.state
                    .modify_position(&fill.token_id, |p| p.take_profit_order_id = Some(tp_id));
            }
            Ok(None) => {}
            Err(e) => warn!(order_id = %fill.order_id, error = %e, "Take-profit placement failed, will retry"),
        }
    }

    // -- Position checks ---------------------------------------------------

    async fn check_position(&self, position: Position, now: DateTime<Utc>) -> Option<PositionExit> {
        if position.stage == StopStage::Monitoring
            && position.take_profit_order_id.is_none()
            && !self.state.take_profit_placed(&position.entry_order_id)
        {
            let fill = FillEvent {
                order_id: position.entry_order_id.clone(),
                token_id: position.token_id.clone(),
                price: position.entry_price,
                size: position.size,
            };
            self.place_take_profit(&fill).await;
        }

        if let Some(tp_id) = &position.take_profit_order_id {
            match self.client.get_order(tp_id).await {
                Ok(o) if o.status == OrderStatus::Filled => {
                    self.close(&position, TradeOutcome::Win, o.price).await;
                    info!(token_id = %position.token_id, price = %o.price, "Take-profit filled");
                    return Some(PositionExit::TakeProfit);
                }
                Ok(_) => {}
                Err(e) => warn!(order_id = %tp_id, error = %e, "Take-profit status poll failed"),
            }
        }

        let book = match self.client.get_order_book(&position.token_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(token_id = %position.token_id, error = %e, "Book poll failed");
                return self.check_resolved(&position).await;
            }
        };
        let bid = book.best_bid().unwrap_or(Decimal::ZERO);

        let step = step_ladder(position.stage, position.l2_started_at, bid, now, &self.cfg);
        self.log_transition(&position, &step, bid);

        let mut tp_id = position.take_profit_order_id.clone();
        if step.stage != StopStage::Monitoring {
            if let Some(id) = tp_id.clone() {
                match self.executor.cancel_take_profit(&id).await {
                    Ok(()) => {
                        info!(token_id = %position.token_id, order_id = %id, %bid, "Take-profit pulled");
                        tp_id = None;
                    }
                    Err(e) => warn!(token_id = %position.token_id, error = %e, "Take-profit cancel failed, will retry"),
                }
            }
        }

        self.state.modify_position(&position.token_id, |p| {
            p.stage = step.stage;
            p.l2_started_at = step.l2_started_at;
            p.last_bid = Some(bid);
            p.take_profit_order_id = tp_id;
        });

        if step.force_exit {
            let mut current = position.clone();
            current.last_bid = Some(bid);
            return self.hard_stop(&current, now).await;
        }
        None
    }

    fn log_transition(&self, position: &Position, step: &LadderStep, bid: Decimal) {
        if step.stage == position.stage {
            return;
        }
        match step.stage {
            StopStage::L1Warn => warn!(
                token_id = %position.token_id,
                %bid,
                l1 = %self.cfg.l1_trigger,
                "L1 breached, position on watch"
            ),
            StopStage::L2Timing => warn!(
                token_id = %position.token_id,
                %bid,
                l2 = %self.cfg.l2_trigger,
                confirm_secs = self.cfg.l2_confirm_secs,
                "L2 breached, confirmation timer started"
            ),
            StopStage::Monitoring => info!(token_id = %position.token_id, %bid, "Bid recovered above L1"),
            StopStage::Exited => {}
        }
    }

    /// Force the position out at the aggressive exit price.
    ///
    /// On failure the position stays in `L2Timing` with its timer intact,
    /// so the next pass retries immediately.
    async fn hard_stop(&self, position: &Position, now: DateTime<Utc>) -> Option<PositionExit> {
        let balance = match self.client.get_balance(&position.token_id).await {
            Ok(b) => b,
            Err(e) => {
                error!(
                    severity = "critical",
                    token_id = %position.token_id,
                    error = %e,
                    "FORCED EXIT FAILED: balance unavailable, position unprotected"
                );
                return None;
            }
        };

        if balance <= Decimal::ZERO {
            return self.resolve_external(position).await;
        }

        match self.executor.force_exit(&position.token_id, balance).await {
            Ok(order_id) => {
                self.state.record_hard_stop(HardStopEvent {
                    token_id: position.token_id.clone(),
                    at: now,
                });
                // Suppress entries at once rather than at the next pass.
                self.state.breaker_check(now);
                let exit_price = self.executor.config().exit_price;
                let mut exited = position.clone();
                exited.size = balance;
                self.close(&exited, TradeOutcome::Loss, exit_price).await;
                warn!(
                    token_id = %position.token_id,
                    order_id = %order_id,
                    size = %balance,
                    stage = %StopStage::Exited,
                    "Hard stop executed"
                );
                Some(PositionExit::HardStop)
            }
            Err(e) => {
                let detail = format!("{e:#}");
                error!(
                    severity = "critical",
                    token_id = %position.token_id,
                    size = %balance,
                    error = %detail,
                    "FORCED EXIT FAILED, position unprotected, retrying next pass"
                );
                None
            }
        }
    }

    /// After a failed book poll: a zero balance means the market resolved
    /// or the shares left by other means.
    async fn check_resolved(&self, position: &Position) -> Option<PositionExit> {
        match self.client.get_balance(&position.token_id).await {
            Ok(b) if b <= Decimal::ZERO => self.resolve_external(position).await,
            Ok(_) => None,
            Err(e) => {
                warn!(token_id = %position.token_id, error = %e, "Balance poll failed");
                None
            }
        }
    }

    async fn resolve_external(&self, position: &Position) -> Option<PositionExit> {
        let last = position.last_bid.unwrap_or(Decimal::ZERO);
        let (outcome, exit_price) = if last >= RESOLUTION_MIDPOINT {
            (TradeOutcome::Win, Decimal::ONE)
        } else {
            (TradeOutcome::Loss, Decimal::ZERO)
        };
        self.close(position, outcome, exit_price).await;
        info!(
            token_id = %position.token_id,
            last_bid = %last,
            outcome = outcome.as_str(),
            "Position gone from account, resolved externally"
        );
        Some(PositionExit::External)
    }

    /// Drop the position and record how it ended.
    async fn close(&self, position: &Position, outcome: TradeOutcome, exit_price: Decimal) {
        self.state.remove_position(&position.token_id);

        let pnl = position.pnl_at(exit_price);
        if let Some(trade_id) = position.trade_id {
            if let Err(e) = self.store.resolve_trade(trade_id, outcome, pnl).await {
                warn!(trade_id, error = %e, "Trade resolution failed");
            }
        }
        if let Err(e) = self
            .store
            .record_outcome(&position.bot, &position.features, Side::Yes, outcome.is_win())
            .await
        {
            warn!(bot = %position.bot, error = %e, "Outcome recording failed");
        }
        info!(
            token_id = %position.token_id,
            bot = %position.bot,
            outcome = outcome.as_str(),
            %pnl,
            "Position closed"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionExit {
    TakeProfit,
    HardStop,
    External,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
