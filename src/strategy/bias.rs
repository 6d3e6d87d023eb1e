//! Feature-bucketed bias estimation.
//!
//! Turns cumulative per-feature win/loss counts into a probability that
//! nudges signal confidence. Each market is described by a price bucket
//! and a 6-hour window of the UTC day; buckets with history shift a prior
//! log-odds by a smoothed, weight-capped amount.

use tracing::debug;

use crate::types::FeatureTallies;

/// Price buckets as (name, inclusive low, exclusive high).
pub const PRICE_BUCKETS: [(&str, f64, f64); 5] = [
    ("price_very_low", 0.0, 0.30),
    ("price_low", 0.30, 0.45),
    ("price_neutral", 0.45, 0.55),
    ("price_high", 0.55, 0.70),
    ("price_very_high", 0.70, 1.01),
];

/// Buckets with fewer outcomes than this are ignored.
const MIN_OUTCOMES: u32 = 2;
const STRENGTH_PER_SQRT_OUTCOME: f64 = 0.5;
const MAX_STRENGTH: f64 = 3.0;
const FEATURE_WEIGHT: f64 = 0.35;
const BIAS_FLOOR: f64 = 0.05;
const BIAS_CEILING: f64 = 0.95;

/// Feature keys for a market priced at `price` observed at `hour_utc`.
pub fn extract_features(price: f64, hour_utc: u32) -> Vec<String> {
    let mut features = Vec::with_capacity(2);
    if let Some((name, _, _)) = PRICE_BUCKETS
        .iter()
        .find(|(_, lo, hi)| price >= *lo && price < *hi)
    {
        features.push((*name).to_string());
    }
    features.push(format!("hour_{}", (hour_utc % 24) / 6 * 6));
    features
}

fn log_odds(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

#[derive(Debug, Clone)]
pub struct BiasEstimator {
    prior: f64,
}

impl BiasEstimator {
    /// `prior` is the win probability assumed with no history.
    pub fn new(prior: f64) -> Self {
        Self { prior }
    }

    pub fn prior(&self) -> f64 {
        self.prior
    }

    /// Learned win probability for a feature set, clamped to [0.05, 0.95].
    pub fn estimate(&self, tallies: &FeatureTallies, features: &[String]) -> f64 {
        let mut total_log_odds = if self.prior > 0.0 && self.prior < 1.0 {
            log_odds(self.prior)
        } else {
            0.0
        };

        for feature in features {
            let Some(tally) = tallies.get(feature) else {
                continue;
            };
            let total = tally.total();
            if total < MIN_OUTCOMES {
                continue;
            }

            let win_rate = (tally.wins as f64 + 1.0) / (total as f64 + 2.0);
            let strength = ((total as f64).sqrt() * STRENGTH_PER_SQRT_OUTCOME).min(MAX_STRENGTH);
            let shift = log_odds(win_rate) * strength * FEATURE_WEIGHT;
            debug!(feature = %feature, wins = tally.wins, losses = tally.losses, shift, "Feature bias applied");
            total_log_odds += shift;
        }

        logistic(total_log_odds).clamp(BIAS_FLOOR, BIAS_CEILING)
    }
}
