//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section has defaults so a partial file is enough; the result is
//! validated once at startup and then handed to each component by value.
//! No component reads global state.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::types::{EngineError, TimeClass};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub venue: VenueConfig,
    pub filters: FilterConfig,
    pub execution: ExecutionConfig,
    pub stop_loss: StopLossConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub learning: LearningConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub scan_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub snapshot_path: String,
    pub database_url: String,
    pub max_active_positions_per_category: usize,
    pub global_max_positions: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "POLYARB-001".to_string(),
            scan_interval_secs: 60,
            monitor_interval_secs: 2,
            snapshot_interval_secs: 5,
            snapshot_path: "bot_state.json".to_string(),
            database_url: "sqlite://arena.db?mode=rwc".to_string(),
            max_active_positions_per_category: 5,
            global_max_positions: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VenueConfig {
    pub gamma_url: String,
    pub clob_url: String,
    pub market_page_size: u32,
    pub request_timeout_secs: u64,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            gamma_url: "https://gamma-api.polymarket.com".to_string(),
            clob_url: "https://clob.polymarket.com".to_string(),
            market_page_size: 500,
            request_timeout_secs: 15,
        }
    }
}

/// Scanner filter pipeline parameters.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterConfig {
    /// Dollar amount committed per entry.
    pub order_amount: Decimal,
    /// Case-insensitive substrings that disqualify a market outright.
    pub poison_keywords: Vec<String>,
    /// Categories or tag labels never traded (case-insensitive).
    pub excluded_categories: Vec<String>,
    pub min_hours_to_resolution: f64,
    /// Upper bound of the window. Markets beyond `short_horizon_max_hours`
    /// but inside it trade in the extended band.
    pub max_hours_to_resolution: f64,
    /// Markets resolving within this many hours are `TimeClass::Short`.
    pub short_horizon_max_hours: f64,
    pub min_entry_price: Decimal,
    pub max_entry_price: Decimal,
    /// Top-two bid depth must reach `order_amount × depth_multiplier`.
    pub depth_multiplier: Decimal,
    /// Reject when the 24h price change is below `-max_daily_drop`.
    pub max_daily_drop: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            order_amount: dec!(50.0),
            poison_keywords: [
                "dispute", "uma", "opinion", "oscars", "twitter", "tweet", "x.com",
                "announce", "live", "next goal", "minute",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            excluded_categories: Vec::new(),
            min_hours_to_resolution: 1.0,
            max_hours_to_resolution: 48.0,
            short_horizon_max_hours: 12.0,
            min_entry_price: dec!(0.90),
            max_entry_price: dec!(0.99),
            depth_multiplier: dec!(5),
            max_daily_drop: 0.05,
        }
    }
}

/// Inclusive price band.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct PriceBand {
    pub floor: Decimal,
    pub ceiling: Decimal,
}

impl PriceBand {
    pub fn new(floor: Decimal, ceiling: Decimal) -> Self {
        Self { floor, ceiling }
    }

    pub fn clamp(&self, price: Decimal) -> Decimal {
        price.max(self.floor).min(self.ceiling)
    }

    pub fn contains(&self, price: Decimal) -> bool {
        price >= self.floor && price <= self.ceiling
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Amount added to the best bid for the maker entry.
    pub entry_increment: Decimal,
    pub short_band: PriceBand,
    pub extended_band: PriceBand,
    pub take_profit_price: Decimal,
    pub entry_timeout_secs: u64,
    /// Aggressive sell price used for forced exits.
    pub exit_price: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            entry_increment: dec!(0.001),
            short_band: PriceBand::new(dec!(0.94), dec!(0.96)),
            extended_band: PriceBand::new(dec!(0.96), dec!(0.97)),
            take_profit_price: dec!(0.99),
            entry_timeout_secs: 15 * 60,
            exit_price: dec!(0.10),
        }
    }
}

impl ExecutionConfig {
    pub fn band_for(&self, class: TimeClass) -> PriceBand {
        match class {
            TimeClass::Short => self.short_band,
            TimeClass::Extended => self.extended_band,
        }
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::from_secs(self.entry_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StopLossConfig {
    /// Warning line: take-profit is pulled below this bid.
    pub l1_trigger: Decimal,
    /// Hard stop line: a sustained bid below this forces an exit.
    pub l2_trigger: Decimal,
    pub l2_confirm_secs: u64,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            l1_trigger: dec!(0.91),
            l2_trigger: dec!(0.85),
            l2_confirm_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub window_hours: u64,
    pub max_hard_stops: usize,
    pub cooldown_hours: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_hours: 12,
            max_hard_stops: 2,
            cooldown_hours: 24,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LearningConfig {
    /// Prior win probability before any outcome history.
    pub prior_win_prob: f64,
    /// Final (bias-scaled) confidence needed to accept a signal.
    pub min_confidence: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            prior_win_prob: 0.5,
            min_confidence: 0.5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to load config file: {path}"))?;
        Ok(config)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run safely with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let f = &self.filters;
        let e = &self.execution;
        let s = &self.stop_loss;

        if f.order_amount <= Decimal::ZERO {
            return Err(EngineError::Config("order_amount must be positive".into()));
        }
        if f.min_hours_to_resolution > f.max_hours_to_resolution {
            return Err(EngineError::Config(format!(
                "time window is empty: {}h..{}h",
                f.min_hours_to_resolution, f.max_hours_to_resolution
            )));
        }
        if f.min_entry_price > f.max_entry_price {
            return Err(EngineError::Config("entry price band is inverted".into()));
        }
        for (name, band) in [("short_band", e.short_band), ("extended_band", e.extended_band)] {
            if band.floor > band.ceiling || band.floor <= Decimal::ZERO || band.ceiling >= Decimal::ONE {
                return Err(EngineError::Config(format!("{name} must satisfy 0 < floor <= ceiling < 1")));
            }
        }
        if !(s.l2_trigger < s.l1_trigger && s.l1_trigger < e.take_profit_price) {
            return Err(EngineError::Config(format!(
                "stop-loss ladder must satisfy l2 ({}) < l1 ({}) < take_profit ({})",
                s.l2_trigger, s.l1_trigger, e.take_profit_price
            )));
        }
        if e.exit_price <= Decimal::ZERO {
            return Err(EngineError::Config("exit_price must be positive".into()));
        }
        if self.circuit_breaker.max_hard_stops == 0 {
            return Err(EngineError::Config("max_hard_stops must be at least 1".into()));
        }
        let p0 = self.learning.prior_win_prob;
        if !(p0 > 0.0 && p0 < 1.0) {
            return Err(EngineError::Config(format!("prior_win_prob {p0} must lie in (0, 1)")));
        }
        if self.agent.scan_interval_secs == 0
            || self.agent.monitor_interval_secs == 0
            || self.agent.snapshot_interval_secs == 0
        {
            return Err(EngineError::Config("loop intervals must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.stop_loss.l1_trigger, dec!(0.91));
        assert_eq!(cfg.circuit_breaker.max_hard_stops, 2);
        assert!(cfg.filters.poison_keywords.iter().any(|k| k == "uma"));
        assert!(cfg.filters.max_hours_to_resolution > cfg.filters.short_horizon_max_hours);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [filters]
            order_amount = 25.0
            excluded_categories = ["Opinion"]

            [stop_loss]
            l2_confirm_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(cfg.filters.order_amount, dec!(25));
        assert_eq!(cfg.filters.excluded_categories, vec!["Opinion".to_string()]);
        assert_eq!(cfg.stop_loss.l2_confirm_secs, 30);
        assert_eq!(cfg.stop_loss.l2_trigger, dec!(0.85));
        assert_eq!(cfg.execution.entry_timeout_secs, 900);
    }

    #[test]
    fn test_inverted_ladder_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [stop_loss]
            l1_trigger = 0.80
            l2_trigger = 0.85
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("stop-loss ladder"));
    }

    #[test]
    fn test_bad_prior_rejected() {
        let mut cfg = AppConfig::default();
        cfg.learning.prior_win_prob = 1.0;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_band_clamp() {
        let band = PriceBand::new(dec!(0.94), dec!(0.96));
        assert_eq!(band.clamp(dec!(0.931)), dec!(0.94));
        assert_eq!(band.clamp(dec!(0.951)), dec!(0.951));
        assert_eq!(band.clamp(dec!(0.99)), dec!(0.96));
        assert!(band.contains(dec!(0.96)));
        assert!(!band.contains(dec!(0.961)));
    }

    #[test]
    fn test_band_for_time_class() {
        let cfg = ExecutionConfig::default();
        assert_eq!(cfg.band_for(TimeClass::Short).floor, dec!(0.94));
        assert_eq!(cfg.band_for(TimeClass::Extended).ceiling, dec!(0.97));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load("/nonexistent/polyarb.toml").is_err());
    }
}
