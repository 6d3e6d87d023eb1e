//! Orchestrator: wires the components and runs the concurrent loops.
//!
//! Three tasks share one `SharedState`:
//! - scan loop: scanner -> strategy engine -> execution engine
//! - monitor loop: risk monitor pass every `monitor_interval_secs`
//! - snapshot loop: JSON status file every `snapshot_interval_secs`
//!
//! A `watch` channel carries the shutdown signal. On shutdown every loop
//! finishes its current iteration, outstanding entries are cancelled and a
//! final snapshot is written.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::engine::executor::ExecutionEngine;
use crate::engine::monitor::{CircuitBreaker, RiskMonitor};
use crate::engine::scanner::MarketScanner;
use crate::engine::state::SharedState;
use crate::platforms::{MarketFeed, TradingClient};
use crate::storage::{self, BotConfigRecord, PersistenceService};
use crate::strategy::bias::BiasEstimator;
use crate::strategy::bots::{build_bot, default_bots, Bot};
use crate::strategy::StrategyEngine;
use crate::types::FeatureTallies;

/// Look-back for the startup performance summary.
const PERFORMANCE_LOOKBACK_DAYS: i64 = 7;

/// Outcome of one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub eligible: usize,
    pub signals: usize,
    pub capped: usize,
    pub entries_placed: usize,
}

/// Resolve each bot's parameters: stored parameters override the built-in
/// defaults, and the effective set is written back.
pub async fn prepare_bots(store: &dyn PersistenceService, cfg: &AppConfig) -> Vec<Box<dyn Bot>> {
    let amount = cfg.filters.order_amount;
    let mut bots = Vec::new();

    for default in default_bots(amount) {
        let bot = match store.get_bot_config(default.name()).await {
            Ok(Some(rec)) => match build_bot(&rec.strategy_type, rec.params, amount) {
                Some(b) => {
                    info!(bot = default.name(), "Using stored bot parameters");
                    b
                }
                None => {
                    warn!(bot = default.name(), kind = %rec.strategy_type, "Unknown stored strategy type, using defaults");
                    default
                }
            },
            Ok(None) => default,
            Err(e) => {
                warn!(bot = default.name(), error = %e, "Failed to load bot config, using defaults");
                default
            }
        };

        let record = BotConfigRecord {
            name: bot.name().to_string(),
            strategy_type: bot.strategy_type().to_string(),
            params: bot.params().clone(),
        };
        if let Err(e) = store.save_bot_config(&record).await {
            warn!(bot = bot.name(), error = %e, "Failed to persist bot config");
        }

        let since = Utc::now() - ChronoDuration::days(PERFORMANCE_LOOKBACK_DAYS);
        match store.bot_performance(bot.name(), since).await {
            Ok(perf) => info!(
                bot = bot.name(),
                trades = perf.trades,
                win_rate = format!("{:.1}%", perf.win_rate() * 100.0),
                pnl = format!("${:.2}", perf.total_pnl),
                "Bot performance (7d)"
            ),
            Err(e) => warn!(bot = bot.name(), error = %e, "Failed to load bot performance"),
        }

        bots.push(bot);
    }
    bots
}

pub struct Orchestrator {
    cfg: AppConfig,
    scanner: MarketScanner,
    strategy: StrategyEngine,
    executor: ExecutionEngine,
    monitor: RiskMonitor,
    state: Arc<SharedState>,
    store: Arc<dyn PersistenceService>,
}

impl Orchestrator {
    pub fn new(
        cfg: AppConfig,
        feed: Arc<dyn MarketFeed>,
        client: Arc<dyn TradingClient>,
        store: Arc<dyn PersistenceService>,
        bots: Vec<Box<dyn Bot>>,
    ) -> Self {
        let state = Arc::new(SharedState::new(CircuitBreaker::new(&cfg.circuit_breaker)));
        let scanner = MarketScanner::new(feed, client.clone(), cfg.filters.clone());
        let strategy = StrategyEngine::new(
            bots,
            BiasEstimator::new(cfg.learning.prior_win_prob),
            cfg.learning.min_confidence,
        );
        let executor = ExecutionEngine::new(
            client.clone(),
            state.clone(),
            cfg.execution.clone(),
            cfg.filters.order_amount,
        );
        let monitor = RiskMonitor::new(
            client,
            executor.clone(),
            state.clone(),
            store.clone(),
            cfg.stop_loss.clone(),
        );

        Self {
            cfg,
            scanner,
            strategy,
            executor,
            monitor,
            state,
            store,
        }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn monitor(&self) -> &RiskMonitor {
        &self.monitor
    }

    pub fn executor(&self) -> &ExecutionEngine {
        &self.executor
    }

    /// Reload the snapshot left by a previous run, if any.
    pub fn restore_snapshot(&self) -> Result<bool> {
        match storage::load_snapshot(&self.cfg.agent.snapshot_path)? {
            Some(snapshot) => {
                self.state.restore(snapshot);
                info!(
                    entries = self.state.entry_count(),
                    positions = self.state.position_count(),
                    "Resumed from snapshot"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_learning(&self) -> HashMap<String, FeatureTallies> {
        let mut learned = HashMap::new();
        for bot in self.strategy.bots() {
            match self.store.get_learned_bias_inputs(bot.name()).await {
                Ok(t) => {
                    learned.insert(bot.name().to_string(), t);
                }
                Err(e) => warn!(bot = bot.name(), error = %e, "Failed to load bias inputs, using prior"),
            }
        }
        learned
    }

    /// Cap check over open exposure (entries plus positions).
    fn capped(&self, category: &str) -> bool {
        let counts = self.state.category_counts();
        let total: usize = counts.values().sum();
        total >= self.cfg.agent.global_max_positions
            || counts.get(category).copied().unwrap_or(0) >= self.cfg.agent.max_active_positions_per_category
    }

    /// Scan, score and submit once.
    pub async fn run_scan_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let eligible = self.scanner.scan(now).await;
        let mut report = CycleReport {
            eligible: eligible.len(),
            ..CycleReport::default()
        };
        if eligible.is_empty() {
            return report;
        }

        if self.state.entries_suppressed(now) {
            warn!(eligible = eligible.len(), "Circuit breaker active, no new entries this cycle");
            return report;
        }

        let learned = self.load_learning().await;

        for market in &eligible {
            if self.capped(&market.market.category) {
                report.capped += 1;
                continue;
            }

            let Some(decision) = self.strategy.evaluate(market, &learned, now) else {
                continue;
            };
            report.signals += 1;
            info!(
                market = %market.market,
                bot = %decision.bot,
                signal = %decision.signal,
                bias = decision.bias,
                confidence = decision.confidence,
                "Signal accepted"
            );

            if self.executor.submit(market, &decision, now).await.is_some() {
                report.entries_placed += 1;
            }
        }

        info!(
            eligible = report.eligible,
            signals = report.signals,
            capped = report.capped,
            placed = report.entries_placed,
            open_entries = self.state.entry_count(),
            positions = self.state.position_count(),
            "Scan cycle complete"
        );
        report
    }

    pub fn write_snapshot(&self, now: DateTime<Utc>) {
        let snapshot = self.state.snapshot(now);
        if let Err(e) = storage::save_snapshot(&snapshot, &self.cfg.agent.snapshot_path) {
            warn!(error = %e, "Failed to write snapshot");
        }
    }

    /// Run all loops until `shutdown` flips to true, then clean up.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let scan = tokio::spawn(Self::scan_loop(self.clone(), shutdown.clone()));
        let monitor = tokio::spawn(Self::monitor_loop(self.clone(), shutdown.clone()));
        let snapshot = tokio::spawn(Self::snapshot_loop(self.clone(), shutdown));

        for (name, handle) in [("scan", scan), ("monitor", monitor), ("snapshot", snapshot)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Loop task aborted");
            }
        }

        self.executor.cancel_all_entries().await;
        self.write_snapshot(Utc::now());
        info!(
            positions = self.state.position_count(),
            "Loops stopped, open positions remain at the venue"
        );
    }

    /// Sleep for `period` unless shutdown arrives first. Returns false on
    /// shutdown; a dropped sender also counts as shutdown.
    async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => true,
            _ = shutdown.changed() => false,
        }
    }

    async fn scan_loop(this: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(this.cfg.agent.scan_interval_secs);
        info!(interval_secs = period.as_secs(), "Scan loop started");
        loop {
            this.run_scan_cycle(Utc::now()).await;
            if !Self::pause(&mut shutdown, period).await {
                break;
            }
        }
        info!("Scan loop stopped");
    }

    async fn monitor_loop(this: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(this.cfg.agent.monitor_interval_secs);
        info!(interval_secs = period.as_secs(), "Monitor loop started");
        loop {
            this.monitor.run_pass(Utc::now()).await;
            if !Self::pause(&mut shutdown, period).await {
                break;
            }
        }
        info!("Monitor loop stopped");
    }

    async fn snapshot_loop(this: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(this.cfg.agent.snapshot_interval_secs);
        loop {
            this.write_snapshot(Utc::now());
            if !Self::pause(&mut shutdown, period).await {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
