//! Persistence layer.
//!
//! Two concerns live here:
//! - the `PersistenceService` contract (trade log, outcome learning, bot
//!   configs), implemented over SQLite in `sqlite.rs`;
//! - the JSON status snapshot of the shared in-memory state, written
//!   periodically for external inspection and reloaded on restart.

pub mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::engine::state::StateSnapshot;
use crate::strategy::bots::BotParams;
use crate::types::{FeatureTallies, Side, TradeOutcome};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Fields logged when an entry fill opens a trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub bot: String,
    pub market_id: String,
    pub token_id: String,
    pub question: String,
    pub category: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub confidence: f64,
    pub features: Vec<String>,
    pub opened_at: DateTime<Utc>,
}

/// Persisted bot parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfigRecord {
    pub name: String,
    /// `sniper`, `trend` or `arb`.
    pub strategy_type: String,
    pub params: BotParams,
}

/// Resolved-trade summary for one bot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotPerformance {
    pub trades: u32,
    pub wins: u32,
    pub total_pnl: Decimal,
}

impl BotPerformance {
    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

/// Trade and learning store consumed by the engine.
///
/// Engine loops treat every failure here as non-fatal: a trade that cannot
/// be logged is still monitored and exited normally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceService: Send + Sync {
    /// Record an opened trade, returning its id.
    async fn log_trade(&self, trade: &TradeRecord) -> Result<i64>;

    async fn resolve_trade(&self, trade_id: i64, outcome: TradeOutcome, pnl: Decimal) -> Result<()>;

    /// Accumulate one resolved outcome into the bot's feature counters.
    ///
    /// Counters are kept from the YES side: a NO-side trade that won is a
    /// YES loss.
    async fn record_outcome(&self, bot: &str, features: &[String], side: Side, won: bool) -> Result<()>;

    /// Cumulative per-feature win/loss counts for a bot.
    async fn get_learned_bias_inputs(&self, bot: &str) -> Result<FeatureTallies>;

    async fn save_bot_config(&self, config: &BotConfigRecord) -> Result<()>;

    async fn get_bot_config(&self, name: &str) -> Result<Option<BotConfigRecord>>;

    /// Resolved trades opened at or after `since`.
    async fn bot_performance(&self, bot: &str, since: DateTime<Utc>) -> Result<BotPerformance>;
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Write the status snapshot as pretty JSON.
///
/// Written to a sibling temp file first and renamed into place so readers
/// never see a partial file.
pub fn save_snapshot(snapshot: &StateSnapshot, path: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("Failed to serialise snapshot")?;

    let tmp = format!("{path}.tmp");
    std::fs::write(&tmp, &json).with_context(|| format!("Failed to write snapshot to {tmp}"))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move snapshot into {path}"))?;

    debug!(
        path,
        entries = snapshot.active_entry_orders.len(),
        positions = snapshot.active_positions.len(),
        "Snapshot saved"
    );
    Ok(())
}

/// Load a snapshot written by a previous run.
/// Returns None if the file doesn't exist (fresh start).
pub fn load_snapshot(path: &str) -> Result<Option<StateSnapshot>> {
    if !Path::new(path).exists() {
        info!(path, "No saved snapshot found, starting fresh");
        return Ok(None);
    }

    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read snapshot from {path}"))?;
    let snapshot: StateSnapshot =
        serde_json::from_str(&json).with_context(|| format!("Failed to parse snapshot from {path}"))?;

    info!(
        path,
        written_at = %snapshot.written_at,
        entries = snapshot.active_entry_orders.len(),
        positions = snapshot.active_positions.len(),
        hard_stops = snapshot.hard_stops.len(),
        "Snapshot loaded from disk"
    );
    Ok(Some(snapshot))
}

/// Delete the snapshot file (for testing or reset).
pub fn delete_snapshot(path: &str) -> Result<()> {
    if Path::new(path).exists() {
        std::fs::remove_file(path).with_context(|| format!("Failed to delete snapshot {path}"))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
