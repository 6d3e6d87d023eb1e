//! SQLite-backed persistence service.
//!
//! Tables:
//! - `trades`: one row per filled entry, resolved later with outcome + pnl
//! - `bot_learning`: cumulative (bot, feature) win/loss counters
//! - `bot_configs`: bot parameters as JSON
//!
//! Decimals and timestamps are stored as text (RFC 3339, UTC, fixed
//! precision) so ordering comparisons in SQL stay lexical.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use super::{BotConfigRecord, BotPerformance, PersistenceService, TradeRecord};
use crate::types::{EngineError, FeatureTallies, FeatureTally, Side, TradeOutcome};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS trades (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        bot          TEXT NOT NULL,
        market_id    TEXT NOT NULL,
        token_id     TEXT NOT NULL,
        question     TEXT NOT NULL,
        category     TEXT NOT NULL,
        side         TEXT NOT NULL,
        entry_price  TEXT NOT NULL,
        size         TEXT NOT NULL,
        confidence   REAL NOT NULL,
        features     TEXT NOT NULL,
        opened_at    TEXT NOT NULL,
        outcome      TEXT,
        pnl          TEXT,
        resolved_at  TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_trades_bot_opened ON trades (bot, opened_at)",
    r#"
    CREATE TABLE IF NOT EXISTS bot_learning (
        bot      TEXT NOT NULL,
        feature  TEXT NOT NULL,
        wins     INTEGER NOT NULL DEFAULT 0,
        losses   INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (bot, feature)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bot_configs (
        name           TEXT PRIMARY KEY,
        strategy_type  TEXT NOT NULL,
        params         TEXT NOT NULL,
        updated_at     TEXT NOT NULL
    )
    "#,
];

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Yes => "yes",
        Side::No => "no",
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .with_context(|| format!("Failed to open database {url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url, "Database ready");
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query
    /// on the same memory instance.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceService for SqliteStore {
    async fn log_trade(&self, trade: &TradeRecord) -> Result<i64> {
        let features = serde_json::to_string(&trade.features).context("Failed to encode features")?;
        let result = sqlx::query(
            r#"
            INSERT INTO trades
                (bot, market_id, token_id, question, category, side,
                 entry_price, size, confidence, features, opened_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.bot)
        .bind(&trade.market_id)
        .bind(&trade.token_id)
        .bind(&trade.question)
        .bind(&trade.category)
        .bind(side_str(trade.side))
        .bind(trade.entry_price.to_string())
        .bind(trade.size.to_string())
        .bind(trade.confidence)
        .bind(features)
        .bind(ts(trade.opened_at))
        .execute(&self.pool)
        .await
        .context("Failed to log trade")?;

        let id = result.last_insert_rowid();
        debug!(trade_id = id, bot = %trade.bot, token_id = %trade.token_id, "Trade logged");
        Ok(id)
    }

    async fn resolve_trade(&self, trade_id: i64, outcome: TradeOutcome, pnl: Decimal) -> Result<()> {
        let result = sqlx::query(
            "UPDATE trades SET outcome = ?, pnl = ?, resolved_at = ? WHERE id = ? AND outcome IS NULL",
        )
        .bind(outcome.as_str())
        .bind(pnl.to_string())
        .bind(ts(Utc::now()))
        .bind(trade_id)
        .execute(&self.pool)
        .await
        .context("Failed to resolve trade")?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Storage(format!("trade {trade_id} missing or already resolved")).into());
        }
        debug!(trade_id, outcome = outcome.as_str(), %pnl, "Trade resolved");
        Ok(())
    }

    async fn record_outcome(&self, bot: &str, features: &[String], side: Side, won: bool) -> Result<()> {
        let yes_won = (side == Side::Yes) == won;
        let (wins, losses) = if yes_won { (1i64, 0i64) } else { (0, 1) };

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        for feature in features {
            sqlx::query(
                r#"
                INSERT INTO bot_learning (bot, feature, wins, losses) VALUES (?, ?, ?, ?)
                ON CONFLICT (bot, feature) DO UPDATE SET
                    wins = wins + excluded.wins,
                    losses = losses + excluded.losses
                "#,
            )
            .bind(bot)
            .bind(feature)
            .bind(wins)
            .bind(losses)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to record outcome for {bot}/{feature}"))?;
        }
        tx.commit().await.context("Failed to commit outcome")?;
        Ok(())
    }

    async fn get_learned_bias_inputs(&self, bot: &str) -> Result<FeatureTallies> {
        let rows = sqlx::query("SELECT feature, wins, losses FROM bot_learning WHERE bot = ?")
            .bind(bot)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load bias inputs")?;

        let mut tallies = FeatureTallies::new();
        for row in rows {
            let feature: String = row.try_get("feature")?;
            let wins: i64 = row.try_get("wins")?;
            let losses: i64 = row.try_get("losses")?;
            tallies.insert(
                feature,
                FeatureTally {
                    wins: wins.max(0) as u32,
                    losses: losses.max(0) as u32,
                },
            );
        }
        Ok(tallies)
    }

    async fn save_bot_config(&self, config: &BotConfigRecord) -> Result<()> {
        let params = serde_json::to_string(&config.params).context("Failed to encode bot params")?;
        sqlx::query(
            r#"
            INSERT INTO bot_configs (name, strategy_type, params, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                strategy_type = excluded.strategy_type,
                params = excluded.params,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.name)
        .bind(&config.strategy_type)
        .bind(params)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save config for {}", config.name))?;
        Ok(())
    }

    async fn get_bot_config(&self, name: &str) -> Result<Option<BotConfigRecord>> {
        let row = sqlx::query("SELECT name, strategy_type, params FROM bot_configs WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to load config for {name}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let params: String = row.try_get("params")?;
        Ok(Some(BotConfigRecord {
            name: row.try_get("name")?,
            strategy_type: row.try_get("strategy_type")?,
            params: serde_json::from_str(&params)
                .with_context(|| format!("Stored params for {name} are invalid"))?,
        }))
    }

    async fn bot_performance(&self, bot: &str, since: DateTime<Utc>) -> Result<BotPerformance> {
        let rows = sqlx::query(
            "SELECT outcome, pnl FROM trades WHERE bot = ? AND outcome IS NOT NULL AND opened_at >= ?",
        )
        .bind(bot)
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to load bot performance")?;

        let mut perf = BotPerformance::default();
        for row in rows {
            let outcome: String = row.try_get("outcome")?;
            let pnl: Option<String> = row.try_get("pnl")?;
            perf.trades += 1;
            if outcome == TradeOutcome::Win.as_str() {
                perf.wins += 1;
            }
            if let Some(p) = pnl {
                perf.total_pnl += Decimal::from_str(&p).unwrap_or(Decimal::ZERO);
            }
        }
        Ok(perf)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
