//! POLYARB: near-resolution maker sniping agent.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the market feed, trading client and trade store, restores the
//! last status snapshot, and runs the scan/monitor/snapshot loops until
//! Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use polyarb::config;
use polyarb::engine::orchestrator::{prepare_bots, Orchestrator};
use polyarb::platforms::paper::PaperClient;
use polyarb::platforms::polymarket::GammaFeed;
use polyarb::platforms::{MarketFeed, TradingClient};
use polyarb::storage::sqlite::SqliteStore;
use polyarb::storage::PersistenceService;

const DEFAULT_CONFIG: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    info!(
        agent_name = %cfg.agent.name,
        config = %config_path,
        order_amount = %cfg.filters.order_amount,
        window_hours = format!("{}-{}", cfg.filters.min_hours_to_resolution, cfg.filters.max_hours_to_resolution),
        l1 = %cfg.stop_loss.l1_trigger,
        l2 = %cfg.stop_loss.l2_trigger,
        "POLYARB starting up"
    );

    // -- Collaborators ---------------------------------------------------

    let feed: Arc<dyn MarketFeed> = Arc::new(GammaFeed::new(&cfg.venue)?);
    let client: Arc<dyn TradingClient> = Arc::new(PaperClient::new(&cfg.venue)?);
    let store: Arc<dyn PersistenceService> = Arc::new(SqliteStore::connect(&cfg.agent.database_url).await?);
    info!(clob = %cfg.venue.clob_url, "Paper trading against live order books");

    // -- Engine ----------------------------------------------------------

    let bots = prepare_bots(store.as_ref(), &cfg).await;
    let orchestrator = Arc::new(Orchestrator::new(cfg, feed, client, store, bots));

    if let Err(e) = orchestrator.restore_snapshot() {
        error!(error = %e, "Snapshot unreadable, starting with empty state");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Entering main loops. Press Ctrl+C to stop.");
    orchestrator.clone().run(shutdown_rx).await;

    info!(
        positions = orchestrator.state().position_count(),
        hard_stops = orchestrator.state().hard_stop_count(),
        "POLYARB shut down cleanly."
    );
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("polyarb=info"));

    let json_logging = std::env::var("POLYARB_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
