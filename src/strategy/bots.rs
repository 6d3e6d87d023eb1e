//! Bot variants.
//!
//! Each bot scores a market's order book into a `Signal`. The variants
//! share the same screening steps (price band, book depth, momentum) and
//! differ only in their parameters and in how they scale confidence.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{price_f64, Market, OrderBook, Signal};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// How a bot treats the 24h price-change signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MomentumRule {
    /// Momentum is not consulted.
    Ignore,
    /// Skip if the market fell by more than `tolerance`. Missing data passes.
    MaxDrop { tolerance: f64 },
    /// Require at least `minimum` positive change. Missing data skips.
    MinRise { minimum: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotParams {
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Bid levels counted towards depth.
    pub levels: usize,
    /// Depth must reach `order_amount × depth_multiplier`.
    pub depth_multiplier: Decimal,
    /// Added to the best bid for the target price.
    pub increment: Decimal,
    /// Confidence = best bid × this.
    pub confidence_scale: f64,
    pub momentum: MomentumRule,
}

// ---------------------------------------------------------------------------
// Bot capability
// ---------------------------------------------------------------------------

pub trait Bot: Send + Sync {
    /// Versioned bot name, used as the learning key.
    fn name(&self) -> &str;

    /// Variant identifier, persisted alongside the parameters.
    fn strategy_type(&self) -> &'static str;

    fn params(&self) -> &BotParams;

    fn analyze(&self, market: &Market, book: &OrderBook) -> Signal;
}

/// Common screening. Returns the best bid if every check passes, or the
/// skip signal explaining which one failed.
fn screen(params: &BotParams, order_amount: Decimal, market: &Market, book: &OrderBook) -> Result<Decimal, Signal> {
    let best_bid = book.best_bid().ok_or_else(|| Signal::skip("Empty bid side"))?;

    if best_bid < params.min_price || best_bid > params.max_price {
        return Err(Signal::skip(format!(
            "Price {best_bid} out of range [{}, {}]",
            params.min_price, params.max_price
        )));
    }

    let depth = book.bid_depth(params.levels);
    let required = order_amount * params.depth_multiplier;
    if depth < required {
        return Err(Signal::skip(format!("Low liquidity: depth {depth} < {required}")));
    }

    match (params.momentum, market.price_change_24h) {
        (MomentumRule::MaxDrop { tolerance }, Some(change)) if change < -tolerance => {
            return Err(Signal::skip(format!("Price drop {change} < -{tolerance}")));
        }
        (MomentumRule::MinRise { .. }, None) => {
            return Err(Signal::skip("No momentum data"));
        }
        (MomentumRule::MinRise { minimum }, Some(change)) if change < minimum => {
            return Err(Signal::skip(format!("Momentum {change} < {minimum}")));
        }
        _ => {}
    }

    Ok(best_bid)
}

fn target_price(params: &BotParams, best_bid: Decimal) -> Decimal {
    (best_bid + params.increment)
        .max(params.min_price)
        .min(params.max_price)
        .round_dp(3)
}

fn confidence(params: &BotParams, best_bid: Decimal) -> f64 {
    price_f64(best_bid) * params.confidence_scale
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// High-price near-certain entries; refuses falling markets.
pub struct SniperBot {
    params: BotParams,
    order_amount: Decimal,
}

impl SniperBot {
    pub const NAME: &'static str = "Sniper-V1";

    pub fn new(order_amount: Decimal) -> Self {
        Self::with_params(Self::default_params(), order_amount)
    }

    pub fn with_params(params: BotParams, order_amount: Decimal) -> Self {
        Self { params, order_amount }
    }

    pub fn default_params() -> BotParams {
        BotParams {
            min_price: dec!(0.93),
            max_price: dec!(0.99),
            levels: 2,
            depth_multiplier: dec!(5),
            increment: dec!(0.001),
            confidence_scale: 1.0,
            momentum: MomentumRule::MaxDrop { tolerance: 0.02 },
        }
    }
}

impl Bot for SniperBot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn strategy_type(&self) -> &'static str {
        "sniper"
    }

    fn params(&self) -> &BotParams {
        &self.params
    }

    fn analyze(&self, market: &Market, book: &OrderBook) -> Signal {
        match screen(&self.params, self.order_amount, market, book) {
            Ok(bid) => Signal::buy(
                confidence(&self.params, bid),
                target_price(&self.params, bid),
                format!("Sniper entry at {bid}"),
            ),
            Err(skip) => skip,
        }
    }
}

/// Follows markets with strong positive 24h momentum.
pub struct TrendBot {
    params: BotParams,
    order_amount: Decimal,
}

impl TrendBot {
    pub const NAME: &'static str = "Trend-V1";

    pub fn new(order_amount: Decimal) -> Self {
        Self::with_params(Self::default_params(), order_amount)
    }

    pub fn with_params(params: BotParams, order_amount: Decimal) -> Self {
        Self { params, order_amount }
    }

    pub fn default_params() -> BotParams {
        BotParams {
            min_price: dec!(0.70),
            max_price: dec!(0.99),
            levels: 2,
            depth_multiplier: dec!(5),
            increment: dec!(0.001),
            confidence_scale: 0.9,
            momentum: MomentumRule::MinRise { minimum: 0.05 },
        }
    }
}

impl Bot for TrendBot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn strategy_type(&self) -> &'static str {
        "trend"
    }

    fn params(&self) -> &BotParams {
        &self.params
    }

    fn analyze(&self, market: &Market, book: &OrderBook) -> Signal {
        match screen(&self.params, self.order_amount, market, book) {
            Ok(bid) => Signal::buy(
                confidence(&self.params, bid),
                target_price(&self.params, bid),
                format!(
                    "Trend follow at {bid} (mom: {:+.3})",
                    market.price_change_24h.unwrap_or_default()
                ),
            ),
            Err(skip) => skip,
        }
    }
}

/// Wide price band, deep books only, bids more aggressively.
pub struct ArbBot {
    params: BotParams,
    order_amount: Decimal,
}

impl ArbBot {
    pub const NAME: &'static str = "Arb-V1";

    pub fn new(order_amount: Decimal) -> Self {
        Self::with_params(Self::default_params(), order_amount)
    }

    pub fn with_params(params: BotParams, order_amount: Decimal) -> Self {
        Self { params, order_amount }
    }

    pub fn default_params() -> BotParams {
        BotParams {
            min_price: dec!(0.60),
            max_price: dec!(0.99),
            levels: 3,
            depth_multiplier: dec!(10),
            increment: dec!(0.002),
            confidence_scale: 0.8,
            momentum: MomentumRule::Ignore,
        }
    }
}

impl Bot for ArbBot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn strategy_type(&self) -> &'static str {
        "arb"
    }

    fn params(&self) -> &BotParams {
        &self.params
    }

    fn analyze(&self, market: &Market, book: &OrderBook) -> Signal {
        match screen(&self.params, self.order_amount, market, book) {
            Ok(bid) => Signal::buy(
                confidence(&self.params, bid),
                target_price(&self.params, bid),
                format!("Arb entry at {bid}"),
            ),
            Err(skip) => skip,
        }
    }
}

/// Build a bot of the given variant with explicit parameters.
pub fn build_bot(strategy_type: &str, params: BotParams, order_amount: Decimal) -> Option<Box<dyn Bot>> {
    match strategy_type {
        "sniper" => Some(Box::new(SniperBot::with_params(params, order_amount))),
        "trend" => Some(Box::new(TrendBot::with_params(params, order_amount))),
        "arb" => Some(Box::new(ArbBot::with_params(params, order_amount))),
        _ => None,
    }
}

/// The built-in roster with default parameters.
pub fn default_bots(order_amount: Decimal) -> Vec<Box<dyn Bot>> {
    vec![
        Box::new(SniperBot::new(order_amount)),
        Box::new(TrendBot::new(order_amount)),
        Box::new(ArbBot::new(order_amount)),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
