//! Strategy engine: bot signals scaled by learned feature bias.

pub mod bias;
pub mod bots;

use chrono::{DateTime, Timelike, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::types::{price_f64, EligibleMarket, FeatureTallies, Signal};
use bias::{extract_features, BiasEstimator};
use bots::Bot;

/// An accepted signal, attributed to the bot that produced it.
#[derive(Debug, Clone)]
pub struct Decision {
    pub bot: String,
    pub signal: Signal,
    /// Learned win probability for the market's features.
    pub bias: f64,
    /// Signal confidence after bias scaling.
    pub confidence: f64,
    pub features: Vec<String>,
}

/// Runs every bot over an eligible market and keeps the strongest
/// accepted signal.
///
/// Final confidence is `signal.confidence × bias / prior`, so a bot with no
/// history keeps its raw confidence. A signal is accepted when the final
/// confidence reaches `min_confidence`.
pub struct StrategyEngine {
    bots: Vec<Box<dyn Bot>>,
    estimator: BiasEstimator,
    min_confidence: f64,
}

impl StrategyEngine {
    pub fn new(bots: Vec<Box<dyn Bot>>, estimator: BiasEstimator, min_confidence: f64) -> Self {
        Self {
            bots,
            estimator,
            min_confidence,
        }
    }

    pub fn bots(&self) -> &[Box<dyn Bot>] {
        &self.bots
    }

    /// Evaluate one market. `learned` maps bot name to its feature tallies;
    /// bots without an entry are scored from the prior alone.
    pub fn evaluate(
        &self,
        eligible: &EligibleMarket,
        learned: &HashMap<String, FeatureTallies>,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        let best_bid = eligible.book.best_bid()?;
        let features = extract_features(price_f64(best_bid), now.hour());
        let empty = FeatureTallies::new();
        let mut best: Option<Decision> = None;

        for bot in &self.bots {
            let signal = bot.analyze(&eligible.market, &eligible.book);
            if !signal.is_buy() {
                debug!(
                    bot = bot.name(),
                    market = %eligible.market.id,
                    reason = %signal.rationale,
                    "Bot skipped"
                );
                continue;
            }

            let tallies = learned.get(bot.name()).unwrap_or(&empty);
            let bias = self.estimator.estimate(tallies, &features);
            let confidence = (signal.confidence * bias / self.estimator.prior()).clamp(0.0, 1.0);

            if confidence < self.min_confidence {
                debug!(
                    bot = bot.name(),
                    market = %eligible.market.id,
                    raw = signal.confidence,
                    bias,
                    confidence,
                    "Signal below confidence threshold"
                );
                continue;
            }

            if best.as_ref().map_or(true, |d| confidence > d.confidence) {
                best = Some(Decision {
                    bot: bot.name().to_string(),
                    signal,
                    bias,
                    confidence,
                    features: features.clone(),
                });
            }
        }

        best
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
