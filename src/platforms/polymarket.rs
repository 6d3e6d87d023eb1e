//! Polymarket Gamma integration.
//!
//! Uses the Gamma API for market discovery (no auth required). Records are
//! decoded one at a time so a single malformed market never sinks the
//! whole batch.
//!
//! Gamma API: https://gamma-api.polymarket.com

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::VenueConfig;
use crate::platforms::{MarketFeed, RawMarket};

// ---------------------------------------------------------------------------
// Gamma API response types (market discovery)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Clone)]
pub struct GammaMarket {
    #[serde(default, rename = "conditionId")]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(default, rename = "endDateIso")]
    pub end_date_iso: Option<String>,
    /// Token ids as a JSON-encoded string: "[\"123\",\"456\"]"
    #[serde(default, rename = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    #[serde(default, rename = "oneDayPriceChange")]
    pub one_day_price_change: Option<f64>,
    #[serde(default, rename = "bestBid")]
    pub best_bid: Option<f64>,
    #[serde(default, rename = "bestAsk")]
    pub best_ask: Option<f64>,
    #[serde(default)]
    pub tags: Option<Vec<GammaTag>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GammaTag {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub slug: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GammaFeed {
    http: Client,
    base_url: String,
    page_size: u32,
}

impl GammaFeed {
    pub fn new(venue: &VenueConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(venue.request_timeout_secs))
            .build()
            .context("Failed to build Gamma HTTP client")?;

        Ok(Self {
            http,
            base_url: venue.gamma_url.trim_end_matches('/').to_string(),
            page_size: venue.market_page_size,
        })
    }

    /// Fetch active markets as untyped JSON values.
    async fn fetch_raw(&self) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/markets", self.base_url);
        debug!(url = %url, "Fetching active markets from Gamma API");

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("active", "true"),
                ("closed", "false"),
                ("limit", &self.page_size.to_string()),
            ])
            .send()
            .await
            .context("Gamma API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Gamma API error {status}: {body}");
        }

        resp.json()
            .await
            .context("Failed to parse Gamma markets response")
    }

    /// Decode one Gamma record. Returns `None` if the JSON shape is unusable.
    pub fn decode(value: serde_json::Value) -> Option<RawMarket> {
        match serde_json::from_value::<GammaMarket>(value) {
            Ok(gm) => Some(Self::convert(gm)),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable Gamma market record");
                None
            }
        }
    }

    /// Convert a Gamma market into a raw feed record.
    pub fn convert(gm: GammaMarket) -> RawMarket {
        let token_ids = gm
            .clob_token_ids
            .as_deref()
            .map(Self::parse_token_ids)
            .unwrap_or_default();
        let tags = gm
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|t| if t.label.is_empty() { t.slug } else { t.label })
            .filter(|t| !t.is_empty())
            .collect();

        RawMarket {
            condition_id: gm.condition_id,
            question: gm.question,
            description: gm.description,
            category: gm.category,
            tags,
            end_date: gm.end_date.or(gm.end_date_iso),
            token_ids,
            one_day_price_change: gm.one_day_price_change,
            best_bid: gm.best_bid,
            best_ask: gm.best_ask,
        }
    }

    /// Parse token ids from Gamma's string format.
    /// Handles: "[\"123\",\"456\"]", "123, 456".
    pub fn parse_token_ids(s: &str) -> Vec<String> {
        if let Ok(ids) = serde_json::from_str::<Vec<String>>(s) {
            return ids;
        }
        s.replace(['[', ']', '"', '\\'], "")
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }
}

#[async_trait]
impl MarketFeed for GammaFeed {
    async fn fetch_active_markets(&self) -> Result<Vec<RawMarket>> {
        let values = self.fetch_raw().await?;
        let total = values.len();
        let markets: Vec<RawMarket> = values.into_iter().filter_map(Self::decode).collect();

        info!(
            fetched = total,
            decoded = markets.len(),
            "Gamma markets fetched"
        );
        Ok(markets)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
