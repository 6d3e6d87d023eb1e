//! Execution engine.
//!
//! Turns accepted signals into maker entry orders, brackets filled entries
//! with a take-profit, expires entries that rest too long, and builds the
//! marketable sell used by hard stops. Placement and cancellation failures
//! are logged and never propagate out of a loop.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ExecutionConfig, PriceBand};
use crate::engine::state::SharedState;
use crate::platforms::TradingClient;
use crate::strategy::Decision;
use crate::types::{
    EligibleMarket, EngineError, EntryOrder, FillEvent, OrderBook, OrderSide, OrderSpec,
    OrderType,
};

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// Maker entry price: best bid plus the increment, clamped to the band and
/// rounded to the venue's 0.001 tick. An empty bid side prices at the floor.
pub fn entry_price(book: &OrderBook, band: PriceBand, increment: Decimal) -> Decimal {
    let raw = match book.best_bid() {
        Some(bid) => band.clamp(bid + increment),
        None => band.floor,
    };
    raw.round_dp(3)
}

/// Shares bought for `amount` dollars at `price`, to 0.01.
pub fn entry_size(amount: Decimal, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (amount / price).round_dp(2)
}

/// What happened to an entry on expiry.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpireOutcome {
    /// Already gone: filled, cancelled or expired by someone else.
    Gone,
    Cancelled,
    /// Cancellation failed; the entry was put back for a later retry.
    Retained,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ExecutionEngine {
    client: Arc<dyn TradingClient>,
    state: Arc<SharedState>,
    cfg: ExecutionConfig,
    order_amount: Decimal,
}

impl ExecutionEngine {
    pub fn new(
        client: Arc<dyn TradingClient>,
        state: Arc<SharedState>,
        cfg: ExecutionConfig,
        order_amount: Decimal,
    ) -> Self {
        Self {
            client,
            state,
            cfg,
            order_amount,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.cfg
    }

    /// Place a post-only maker entry for an accepted decision.
    ///
    /// Returns `None` when entries are suppressed by the circuit breaker,
    /// when the token already has an entry or position, or when placement
    /// fails. On success the entry is registered before this returns and a
    /// timeout task is scheduled.
    pub async fn submit(
        &self,
        eligible: &EligibleMarket,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Option<EntryOrder> {
        let market = &eligible.market;

        if self.state.entries_suppressed(now) {
            debug!(market = %market.id, "Entries suppressed by circuit breaker");
            return None;
        }
        if self.state.token_busy(&market.token_id) {
            debug!(token_id = %market.token_id, "Token already has an entry or position");
            return None;
        }

        let book = match self.client.get_order_book(&market.token_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(token_id = %market.token_id, error = %e, "Book refresh failed, entry skipped");
                return None;
            }
        };

        let band = self.cfg.band_for(eligible.time_class);
        let price = entry_price(&book, band, self.cfg.entry_increment);
        let size = entry_size(self.order_amount, price);
        if size <= Decimal::ZERO {
            warn!(token_id = %market.token_id, %price, "Entry size rounds to zero");
            return None;
        }

        let spec = OrderSpec {
            token_id: market.token_id.clone(),
            side: OrderSide::Buy,
            price,
            size,
            order_type: OrderType::GtcPostOnly,
        };

        let order_id = match self.place(&spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(token_id = %market.token_id, %price, error = %e, "Entry placement failed");
                return None;
            }
        };

        let entry = EntryOrder {
            order_id: order_id.clone(),
            token_id: market.token_id.clone(),
            market_id: market.id.clone(),
            question: market.question.clone(),
            category: market.category.clone(),
            bot: decision.bot.clone(),
            features: decision.features.clone(),
            confidence: decision.confidence,
            price,
            size,
            placed_at: now,
        };

        if let Err(refusal) = self.state.register_entry(entry.clone()) {
            // Lost a race for the token while the order was in flight.
            warn!(order_id = %order_id, ?refusal, "Entry not registered, cancelling");
            if let Err(e) = self.client.cancel_order(&order_id).await {
                warn!(order_id = %order_id, error = %e, "Cancel of unregistered entry failed");
            }
            return None;
        }

        info!(
            order_id = %order_id,
            token_id = %entry.token_id,
            bot = %entry.bot,
            %price,
            %size,
            class = %eligible.time_class,
            signal_target = %decision.signal.target_price,
            confidence = decision.confidence,
            "Entry placed"
        );

        self.schedule_timeout(order_id);
        Some(entry)
    }

    fn schedule_timeout(&self, order_id: String) {
        let engine = self.clone();
        let timeout = self.cfg.entry_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            engine.expire_entry(&order_id).await;
        });
    }

    async fn place(&self, spec: &OrderSpec) -> Result<String> {
        let signed = self
            .client
            .create_order(spec)
            .context("Failed to sign order")?;
        let resp = self
            .client
            .post_order(&signed)
            .await
            .context("Failed to post order")?;
        match (resp.success, resp.order_id) {
            (true, Some(id)) => Ok(id),
            (_, _) => Err(EngineError::OrderRejected {
                token_id: spec.token_id.clone(),
                reason: resp.error.unwrap_or_else(|| "no order id returned".into()),
            }
            .into()),
        }
    }

    /// Place the take-profit for a filled entry.
    ///
    /// Idempotent per entry order id: returns `Ok(None)` if a take-profit
    /// was already placed. A failed placement releases the claim so the
    /// next call retries.
    pub async fn on_fill(&self, fill: &FillEvent) -> Result<Option<String>> {
        if !self.state.claim_take_profit(&fill.order_id) {
            debug!(order_id = %fill.order_id, "Take-profit already placed");
            return Ok(None);
        }

        let spec = OrderSpec {
            token_id: fill.token_id.clone(),
            side: OrderSide::Sell,
            price: self.cfg.take_profit_price,
            size: fill.size,
            order_type: OrderType::Gtc,
        };

        match self.place(&spec).await {
            Ok(tp_id) => {
                info!(
                    entry = %fill.order_id,
                    take_profit = %tp_id,
                    price = %spec.price,
                    size = %spec.size,
                    "Take-profit placed"
                );
                Ok(Some(tp_id))
            }
            Err(e) => {
                self.state.release_take_profit(&fill.order_id);
                Err(e.context(format!("take-profit for {}", fill.order_id)))
            }
        }
    }

    /// Sell the full held size at the configured aggressive price. Position
    /// state is left to the caller.
    pub async fn force_exit(&self, token_id: &str, size: Decimal) -> Result<String> {
        let spec = OrderSpec {
            token_id: token_id.to_string(),
            side: OrderSide::Sell,
            price: self.cfg.exit_price,
            size,
            order_type: OrderType::Gtc,
        };
        let order_id = self.place(&spec).await.context("Forced exit")?;
        info!(token_id, order_id = %order_id, %size, price = %spec.price, "Forced exit placed");
        Ok(order_id)
    }

    pub async fn cancel_take_profit(&self, order_id: &str) -> Result<()> {
        self.client
            .cancel_order(order_id)
            .await
            .with_context(|| format!("Failed to cancel take-profit {order_id}"))
    }

    /// Cancel and deregister an entry that has rested past its timeout.
    pub async fn expire_entry(&self, order_id: &str) -> ExpireOutcome {
        let Some(entry) = self.state.take_entry(order_id) else {
            return ExpireOutcome::Gone;
        };

        match self.client.cancel_order(order_id).await {
            Ok(()) => {
                info!(order_id, token_id = %entry.token_id, "Entry timed out, cancelled");
                ExpireOutcome::Cancelled
            }
            Err(e) => {
                warn!(order_id, error = %e, "Entry cancel failed, will retry");
                self.state.restore_entry(entry);
                ExpireOutcome::Retained
            }
        }
    }

    /// Expire every entry older than the timeout. Picks up entries whose
    /// scheduled cancellation failed or that were restored from disk.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let timeout = ChronoDuration::seconds(self.cfg.entry_timeout_secs as i64);
        let stale: Vec<String> = self
            .state
            .entries()
            .into_iter()
            .filter(|e| now - e.placed_at >= timeout)
            .map(|e| e.order_id)
            .collect();

        let mut cancelled = 0;
        for order_id in stale {
            if self.expire_entry(&order_id).await == ExpireOutcome::Cancelled {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Best-effort cancellation of every outstanding entry at shutdown.
    pub async fn cancel_all_entries(&self) -> usize {
        let entries: Vec<_> = self
            .state
            .entries()
            .into_iter()
            .filter_map(|e| self.state.take_entry(&e.order_id))
            .collect();

        let results = join_all(entries.iter().map(|e| self.client.cancel_order(&e.order_id))).await;

        let mut cancelled = 0;
        for (entry, result) in entries.iter().zip(results) {
            match result {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(order_id = %entry.order_id, error = %e, "Shutdown cancel failed"),
            }
        }
        info!(cancelled, total = entries.len(), "Outstanding entries cancelled");
        cancelled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
