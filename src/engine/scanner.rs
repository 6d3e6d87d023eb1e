//! Market scanner and eligibility filter pipeline.
//!
//! Pulls raw market records from the feed, normalises them into typed
//! `Market` snapshots, and runs four filters in a fixed order:
//!
//! 1. Poison keywords in the question or description
//! 2. Excluded category or tag
//! 3. Inclusive hours-to-resolution window
//! 4. Safety lock: top-two bid depth, entry price band and 24h momentum
//!
//! The first three are pure and run before any book is fetched. Survivors
//! keep the feed's order; ranking happens in the strategy engine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::platforms::{MarketFeed, RawMarket, TradingClient};
use crate::types::{EligibleMarket, EngineError, Market, OrderBook, TimeClass};

/// Bid levels summed by the depth check.
const DEPTH_LEVELS: usize = 2;

/// Fallback category when neither the feed nor the tags name one.
const DEFAULT_CATEGORY: &str = "Other";

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

fn parse_resolution(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn opt_decimal(v: Option<f64>) -> Option<Decimal> {
    v.and_then(Decimal::from_f64).map(|d| d.round_dp(4))
}

/// Turn a raw feed record into a typed market snapshot.
///
/// A record without a token id, question or parseable resolution time is
/// malformed and skipped by the caller.
pub fn normalize(raw: RawMarket) -> Result<Market, EngineError> {
    let id = raw
        .condition_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::MalformedMarket("missing condition id".into()))?;
    let token_id = raw
        .token_ids
        .into_iter()
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::MalformedMarket(format!("{id}: missing token id")))?;
    let question = raw
        .question
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| EngineError::MalformedMarket(format!("{id}: missing question")))?;
    let end = raw
        .end_date
        .ok_or_else(|| EngineError::MalformedMarket(format!("{id}: missing resolution time")))?;
    let resolves_at = parse_resolution(&end)
        .ok_or_else(|| EngineError::MalformedMarket(format!("{id}: bad resolution time {end:?}")))?;

    let category = raw
        .category
        .filter(|c| !c.trim().is_empty())
        .or_else(|| raw.tags.first().cloned())
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());

    Ok(Market {
        id,
        token_id,
        question,
        description: raw.description.unwrap_or_default(),
        category,
        tags: raw.tags,
        resolves_at,
        best_bid: opt_decimal(raw.best_bid),
        best_ask: opt_decimal(raw.best_ask),
        price_change_24h: raw.one_day_price_change,
    })
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Why a market was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Poison(String),
    ExcludedCategory(String),
    OutsideWindow(f64),
    NoBids,
    ThinBook { depth: Decimal, required: Decimal },
    PriceOutOfBand(Decimal),
    FallingKnife(f64),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Poison(k) => write!(f, "poison keyword '{k}'"),
            Rejection::ExcludedCategory(c) => write!(f, "excluded category '{c}'"),
            Rejection::OutsideWindow(h) => write!(f, "resolves in {h:.1}h, outside window"),
            Rejection::NoBids => write!(f, "empty bid side"),
            Rejection::ThinBook { depth, required } => {
                write!(f, "top-{DEPTH_LEVELS} depth ${depth:.2} < ${required:.2}")
            }
            Rejection::PriceOutOfBand(p) => write!(f, "best bid {p} outside entry band"),
            Rejection::FallingKnife(c) => write!(f, "24h change {c:+.3} below tolerance"),
        }
    }
}

/// Stage 1: first poison keyword found in the question or description.
pub fn poison_filter(market: &Market, keywords: &[String]) -> Result<(), Rejection> {
    let text = format!("{} {}", market.question, market.description).to_lowercase();
    match keywords
        .iter()
        .find(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
    {
        Some(k) => Err(Rejection::Poison(k.clone())),
        None => Ok(()),
    }
}

/// Stage 2: category or any tag label in the exclusion set.
pub fn category_filter(market: &Market, excluded: &[String]) -> Result<(), Rejection> {
    let hit = std::iter::once(&market.category)
        .chain(market.tags.iter())
        .find(|label| excluded.iter().any(|x| x.eq_ignore_ascii_case(label)));
    match hit {
        Some(label) => Err(Rejection::ExcludedCategory(label.clone())),
        None => Ok(()),
    }
}

/// Stage 3: inclusive hours-to-resolution window.
pub fn time_window_filter(hours: f64, cfg: &FilterConfig) -> Result<(), Rejection> {
    if hours >= cfg.min_hours_to_resolution && hours <= cfg.max_hours_to_resolution {
        Ok(())
    } else {
        Err(Rejection::OutsideWindow(hours))
    }
}

/// Stage 4: liquidity, price band and momentum checks against a live book.
///
/// A missing 24h change is "no data" and passes; only an observed drop
/// steeper than the tolerance rejects.
pub fn safety_lock(market: &Market, book: &OrderBook, cfg: &FilterConfig) -> Result<(), Rejection> {
    let best_bid = book.best_bid().ok_or(Rejection::NoBids)?;

    let depth = book.bid_depth(DEPTH_LEVELS);
    let required = cfg.order_amount * cfg.depth_multiplier;
    if depth < required {
        return Err(Rejection::ThinBook { depth, required });
    }

    if best_bid < cfg.min_entry_price || best_bid > cfg.max_entry_price {
        return Err(Rejection::PriceOutOfBand(best_bid));
    }

    if let Some(change) = market.price_change_24h {
        if change < -cfg.max_daily_drop {
            return Err(Rejection::FallingKnife(change));
        }
    }

    Ok(())
}

pub fn classify(hours: f64, cfg: &FilterConfig) -> TimeClass {
    if hours <= cfg.short_horizon_max_hours {
        TimeClass::Short
    } else {
        TimeClass::Extended
    }
}

/// The book-free stages, in pipeline order.
pub fn pre_filter(market: &Market, hours: f64, cfg: &FilterConfig) -> Result<(), Rejection> {
    poison_filter(market, &cfg.poison_keywords)?;
    category_filter(market, &cfg.excluded_categories)?;
    time_window_filter(hours, cfg)
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct MarketScanner {
    feed: Arc<dyn MarketFeed>,
    client: Arc<dyn TradingClient>,
    filters: FilterConfig,
}

impl MarketScanner {
    pub fn new(feed: Arc<dyn MarketFeed>, client: Arc<dyn TradingClient>, filters: FilterConfig) -> Self {
        Self { feed, client, filters }
    }

    /// Fetch and filter one cycle's markets.
    ///
    /// Never fails: a feed error yields an empty set, and a malformed
    /// record or failed book fetch drops only that market.
    pub async fn scan(&self, now: DateTime<Utc>) -> Vec<EligibleMarket> {
        let raw = match self.feed.fetch_active_markets().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Market feed failed, skipping cycle");
                return Vec::new();
            }
        };

        let total = raw.len();
        let mut malformed = 0usize;
        let mut rejected = 0usize;
        let mut eligible = Vec::new();

        for record in raw {
            let market = match normalize(record) {
                Ok(m) => m,
                Err(e) => {
                    malformed += 1;
                    debug!(error = %e, "Skipping record");
                    continue;
                }
            };

            let hours = market.hours_to_resolution(now);
            if let Err(reason) = pre_filter(&market, hours, &self.filters) {
                rejected += 1;
                debug!(market = %market.id, %reason, "Filtered");
                continue;
            }

            let book = match self.client.get_order_book(&market.token_id).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(market = %market.id, error = %e, "Book fetch failed, skipping market");
                    continue;
                }
            };

            if let Err(reason) = safety_lock(&market, &book, &self.filters) {
                rejected += 1;
                debug!(market = %market.id, %reason, "Safety lock");
                continue;
            }

            let time_class = classify(hours, &self.filters);
            debug!(market = %market, %time_class, hours, "Eligible");
            eligible.push(EligibleMarket {
                market,
                book,
                time_class,
                hours_to_resolution: hours,
            });
        }

        info!(
            total,
            malformed,
            rejected,
            eligible = eligible.len(),
            "Scan complete"
        );
        eligible
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
