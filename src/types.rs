//! Shared types for the POLYARB agent.
//!
//! These types form the data model used across all modules. Market
//! snapshots and order books are immutable per cycle; entry orders and
//! positions are owned by the execution engine and risk monitor.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Order book
// ---------------------------------------------------------------------------

/// A single price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Dollar value resting at this level (price × size).
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

/// Order book snapshot for one outcome token.
///
/// Bids are kept best-first (descending), asks best-first (ascending),
/// regardless of the order the venue returned them in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub token_id: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn new(token_id: impl Into<String>, mut bids: Vec<PriceLevel>, mut asks: Vec<PriceLevel>) -> Self {
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        Self {
            token_id: token_id.into(),
            bids,
            asks,
        }
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Combined notional across the top `levels` bid levels.
    pub fn bid_depth(&self, levels: usize) -> Decimal {
        self.bids.iter().take(levels).map(PriceLevel::notional).sum()
    }
}

// ---------------------------------------------------------------------------
// Market
// ---------------------------------------------------------------------------

/// A tradeable binary market, snapshotted once per scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Venue condition identifier.
    pub id: String,
    /// Outcome token we would buy (the YES token).
    pub token_id: String,
    pub question: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub resolves_at: DateTime<Utc>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    /// 24h price change. `None` means the feed had no data, which is
    /// distinct from a flat market (`Some(0.0)`).
    pub price_change_24h: Option<f64>,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bid = self
            .best_bid
            .map(|b| format!("{:.1}¢", b * Decimal::ONE_HUNDRED))
            .unwrap_or_else(|| "-".to_string());
        write!(f, "[{}] {} (bid: {bid}, resolves {})", self.category, self.question, self.resolves_at)
    }
}

impl Market {
    /// Hours remaining until resolution, negative once past.
    pub fn hours_to_resolution(&self, now: DateTime<Utc>) -> f64 {
        (self.resolves_at - now).num_seconds() as f64 / 3600.0
    }
}

/// Coarse bucket of hours-until-resolution selecting the entry price band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeClass {
    Short,
    Extended,
}

impl fmt::Display for TimeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeClass::Short => write!(f, "short"),
            TimeClass::Extended => write!(f, "extended"),
        }
    }
}

/// A market that survived every scanner filter, with the book it was
/// judged against.
#[derive(Debug, Clone)]
pub struct EligibleMarket {
    pub market: Market,
    pub book: OrderBook,
    pub time_class: TimeClass,
    pub hours_to_resolution: f64,
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Skip,
}

/// Output of a bot's analysis of one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    /// Confidence in [0, 1]. Zero for skips.
    pub confidence: f64,
    pub target_price: Decimal,
    pub rationale: String,
}

impl Signal {
    pub fn buy(confidence: f64, target_price: Decimal, rationale: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Buy,
            confidence: confidence.clamp(0.0, 1.0),
            target_price,
            rationale: rationale.into(),
        }
    }

    pub fn skip(rationale: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Skip,
            confidence: 0.0,
            target_price: Decimal::ZERO,
            rationale: rationale.into(),
        }
    }

    pub fn is_buy(&self) -> bool {
        self.action == SignalAction::Buy
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            SignalAction::Buy => write!(
                f,
                "BUY @ {} conf={:.0}% ({})",
                self.target_price,
                self.confidence * 100.0,
                self.rationale
            ),
            SignalAction::Skip => write!(f, "SKIP ({})", self.rationale),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Outcome side a trade was placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Yes,
    No,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Yes => write!(f, "yes"),
            Side::No => write!(f, "no"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Good-till-cancelled; may take liquidity.
    Gtc,
    /// Good-till-cancelled, rejected if it would match on arrival.
    GtcPostOnly,
}

/// Unsigned description of a limit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub order_type: OrderType,
}

/// An order ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedOrder {
    pub spec: OrderSpec,
    pub signature: String,
}

/// Venue acknowledgement of a submitted order.
#[derive(Debug, Clone, PartialEq)]
pub struct PostOrderResponse {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

impl PostOrderResponse {
    pub fn accepted(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Live,
    PartiallyFilled,
    Filled,
    Cancelled,
}

/// Venue view of one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderState {
    pub order_id: String,
    pub token_id: String,
    pub status: OrderStatus,
    pub price: Decimal,
    pub original_size: Decimal,
    pub size_matched: Decimal,
}

/// A confirmed entry fill.
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub order_id: String,
    pub token_id: String,
    pub price: Decimal,
    pub size: Decimal,
}

// ---------------------------------------------------------------------------
// Entry orders & positions
// ---------------------------------------------------------------------------

/// A resting maker entry, owned by the execution engine until it fills,
/// is cancelled, or times out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryOrder {
    pub order_id: String,
    pub token_id: String,
    pub market_id: String,
    pub question: String,
    pub category: String,
    /// Bot whose signal produced this entry.
    pub bot: String,
    /// Feature buckets captured at signal time, used for outcome learning.
    pub features: Vec<String>,
    pub confidence: f64,
    pub price: Decimal,
    pub size: Decimal,
    pub placed_at: DateTime<Utc>,
}

impl fmt::Display for EntryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] BUY {} @ {} ({}) by {}",
            self.order_id, self.size, self.price, self.question, self.bot
        )
    }
}

/// Stop-loss ladder stage of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopStage {
    Monitoring,
    L1Warn,
    L2Timing,
    Exited,
}

impl fmt::Display for StopStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopStage::Monitoring => write!(f, "MONITORING"),
            StopStage::L1Warn => write!(f, "L1_WARN"),
            StopStage::L2Timing => write!(f, "L2_TIMING"),
            StopStage::Exited => write!(f, "EXITED"),
        }
    }
}

/// A filled entry under risk monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub token_id: String,
    pub entry_order_id: String,
    pub market_id: String,
    pub question: String,
    pub category: String,
    pub bot: String,
    pub features: Vec<String>,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub opened_at: DateTime<Utc>,
    /// Persistence id of the logged trade, if logging succeeded.
    pub trade_id: Option<i64>,
    pub take_profit_order_id: Option<String>,
    pub stage: StopStage,
    /// Set only while the bid sits continuously below L2.
    pub l2_started_at: Option<DateTime<Utc>>,
    pub last_bid: Option<Decimal>,
}

impl Position {
    /// Open a position from a confirmed entry fill.
    pub fn from_fill(entry: &EntryOrder, fill: &FillEvent, now: DateTime<Utc>) -> Self {
        Self {
            token_id: entry.token_id.clone(),
            entry_order_id: entry.order_id.clone(),
            market_id: entry.market_id.clone(),
            question: entry.question.clone(),
            category: entry.category.clone(),
            bot: entry.bot.clone(),
            features: entry.features.clone(),
            entry_price: fill.price,
            size: fill.size,
            opened_at: now,
            trade_id: None,
            take_profit_order_id: None,
            stage: StopStage::Monitoring,
            l2_started_at: None,
            last_bid: None,
        }
    }

    /// Realised P&L if the full size were closed at `exit_price`.
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.size
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} size={} entry={} stage={}",
            self.token_id, self.question, self.size, self.entry_price, self.stage
        )
    }
}

/// A confirmed L2 forced exit, counted by the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardStopEvent {
    pub token_id: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Outcomes & learning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Win,
    Loss,
}

impl TradeOutcome {
    pub fn is_win(&self) -> bool {
        matches!(self, TradeOutcome::Win)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Win => "win",
            TradeOutcome::Loss => "loss",
        }
    }
}

/// Win/loss counters for one (bot, feature) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureTally {
    pub wins: u32,
    pub losses: u32,
}

impl FeatureTally {
    pub fn total(&self) -> u32 {
        self.wins + self.losses
    }
}

/// Per-feature counters for one bot, keyed by feature name.
pub type FeatureTallies = HashMap<String, FeatureTally>;

/// Convert a price to `f64` for scoring maths.
pub fn price_f64(price: Decimal) -> f64 {
    price.to_f64().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for POLYARB.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Venue error during {operation}: {message}")]
    Venue { operation: String, message: String },

    #[error("Order rejected for {token_id}: {reason}")]
    OrderRejected { token_id: String, reason: String },

    #[error("Malformed market record: {0}")]
    MalformedMarket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_book_sorts_levels() {
        let book = OrderBook::new(
            "tok",
            vec![
                PriceLevel::new(dec!(0.90), dec!(10)),
                PriceLevel::new(dec!(0.95), dec!(20)),
            ],
            vec![
                PriceLevel::new(dec!(0.99), dec!(5)),
                PriceLevel::new(dec!(0.97), dec!(5)),
            ],
        );
        assert_eq!(book.best_bid(), Some(dec!(0.95)));
        assert_eq!(book.best_ask(), Some(dec!(0.97)));
    }

    #[test]
    fn test_bid_depth_top_levels() {
        let book = OrderBook::new(
            "tok",
            vec![
                PriceLevel::new(dec!(0.95), dec!(100)),
                PriceLevel::new(dec!(0.94), dec!(200)),
                PriceLevel::new(dec!(0.50), dec!(1000)),
            ],
            vec![],
        );
        assert_eq!(book.bid_depth(2), dec!(95) + dec!(188));
        assert_eq!(book.bid_depth(10), dec!(95) + dec!(188) + dec!(500));
    }

    #[test]
    fn test_empty_book() {
        let book = OrderBook::new("tok", vec![], vec![]);
        assert!(book.best_bid().is_none());
        assert_eq!(book.bid_depth(2), Decimal::ZERO);
    }

    #[test]
    fn test_hours_to_resolution() {
        let now = Utc::now();
        let market = Market {
            id: "c".into(),
            token_id: "t".into(),
            question: "q".into(),
            description: String::new(),
            category: "Sports".into(),
            tags: vec![],
            resolves_at: now + Duration::minutes(90),
            best_bid: None,
            best_ask: None,
            price_change_24h: None,
        };
        assert!((market.hours_to_resolution(now) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_signal_clamps_confidence() {
        let s = Signal::buy(1.7, dec!(0.95), "x");
        assert_eq!(s.confidence, 1.0);
        assert!(s.is_buy());
        assert!(!Signal::skip("no").is_buy());
    }

    #[test]
    fn test_position_pnl() {
        let now = Utc::now();
        let entry = EntryOrder {
            order_id: "o1".into(),
            token_id: "t".into(),
            market_id: "m".into(),
            question: "q".into(),
            category: "Sports".into(),
            bot: "Sniper-V1".into(),
            features: vec![],
            confidence: 0.9,
            price: dec!(0.95),
            size: dec!(52.63),
            placed_at: now,
        };
        let fill = FillEvent {
            order_id: "o1".into(),
            token_id: "t".into(),
            price: dec!(0.95),
            size: dec!(100),
        };
        let pos = Position::from_fill(&entry, &fill, now);
        assert_eq!(pos.stage, StopStage::Monitoring);
        assert_eq!(pos.pnl_at(dec!(0.99)), dec!(4.00));
        assert_eq!(pos.pnl_at(dec!(0.85)), dec!(-10.00));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(StopStage::L2Timing.to_string(), "L2_TIMING");
        assert_eq!(TradeOutcome::Loss.as_str(), "loss");
    }
}
