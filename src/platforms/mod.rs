//! Venue integrations.
//!
//! Defines the collaborator contracts the engine consumes:
//! - `TradingClient`: signed order creation/submission/cancellation,
//!   order-book and balance queries
//! - `MarketFeed`: discovery of active markets as raw records
//!
//! and provides implementations for:
//! - Polymarket Gamma API: market feed
//! - Paper trading: simulated execution against live CLOB books

pub mod paper;
pub mod polymarket;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{OrderBook, OrderSpec, OrderState, PostOrderResponse, SignedOrder};

/// Abstraction over the trading venue.
///
/// Every call may fail transiently; callers treat failures as retryable
/// and never abort a loop on them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradingClient: Send + Sync {
    /// Current order book for an outcome token.
    async fn get_order_book(&self, token_id: &str) -> Result<OrderBook>;

    /// Sign an order locally. No network round-trip.
    fn create_order(&self, spec: &OrderSpec) -> Result<SignedOrder>;

    /// Submit a signed order.
    async fn post_order(&self, order: &SignedOrder) -> Result<PostOrderResponse>;

    /// Status of a previously submitted order.
    async fn get_order(&self, order_id: &str) -> Result<OrderState>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Shares of `token_id` currently held.
    async fn get_balance(&self, token_id: &str) -> Result<Decimal>;
}

/// A market record as delivered by the feed, before validation.
///
/// Every field is optional or loosely typed; the scanner decides what is
/// malformed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMarket {
    pub condition_id: Option<String>,
    pub question: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    /// ISO-8601 resolution timestamp.
    pub end_date: Option<String>,
    /// Per-outcome token ids, YES first.
    pub token_ids: Vec<String>,
    pub one_day_price_change: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

/// Source of candidate markets.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn fetch_active_markets(&self) -> Result<Vec<RawMarket>>;
}
