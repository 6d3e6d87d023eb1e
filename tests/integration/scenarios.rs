//! End-to-end scenarios: scan -> entry -> fill -> take-profit or stop-loss,
//! driven against the mock exchange with an in-memory trade store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use polyarb::config::AppConfig;
use polyarb::engine::orchestrator::{prepare_bots, Orchestrator};
use polyarb::platforms::{MarketFeed, RawMarket, TradingClient};
use polyarb::storage::sqlite::SqliteStore;
use polyarb::storage::{self, PersistenceService};
use polyarb::types::{HardStopEvent, OrderStatus, StopStage};

use crate::mock_exchange::{MockExchange, MockFeed};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap()
}

fn secs(n: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(n)
}

fn market(id: &str, category: &str) -> RawMarket {
    market_ending(id, category, t0() + Duration::hours(3))
}

fn market_ending(id: &str, category: &str, ends: DateTime<Utc>) -> RawMarket {
    RawMarket {
        condition_id: Some(id.to_string()),
        question: Some(format!("Will {id} finish top of the table?")),
        description: Some("Resolves YES on the official result.".into()),
        category: Some(category.to_string()),
        tags: vec![],
        end_date: Some(ends.to_rfc3339()),
        token_ids: vec![format!("{id}-yes"), format!("{id}-no")],
        one_day_price_change: Some(0.0),
        best_bid: Some(0.95),
        best_ask: Some(0.97),
    }
}

fn temp_snapshot() -> String {
    let mut p = std::env::temp_dir();
    p.push(format!("polyarb_it_{}.json", uuid::Uuid::new_v4()));
    p.to_string_lossy().to_string()
}

struct Harness {
    exchange: Arc<MockExchange>,
    feed: Arc<MockFeed>,
    store: Arc<SqliteStore>,
    orch: Arc<Orchestrator>,
    snapshot_path: String,
}

impl Harness {
    async fn new(markets: Vec<RawMarket>, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::default();
        cfg.agent.snapshot_path = temp_snapshot();
        tweak(&mut cfg);
        cfg.validate().unwrap();

        let exchange = Arc::new(MockExchange::new());
        for m in &markets {
            exchange.set_bid(&m.token_ids[0], dec!(0.95));
        }
        let feed = Arc::new(MockFeed::new(markets));
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());

        let bots = prepare_bots(store.as_ref(), &cfg).await;
        let snapshot_path = cfg.agent.snapshot_path.clone();
        let orch = Arc::new(Orchestrator::new(
            cfg,
            feed.clone() as Arc<dyn MarketFeed>,
            exchange.clone() as Arc<dyn TradingClient>,
            store.clone() as Arc<dyn PersistenceService>,
            bots,
        ));

        Self {
            exchange,
            feed,
            store,
            orch,
            snapshot_path,
        }
    }

    /// Place one entry on `token` and fill it, returning the entry order id.
    async fn open_position(&self, token: &str, at: DateTime<Utc>) -> String {
        let report = self.orch.run_scan_cycle(at).await;
        assert!(report.entries_placed >= 1, "{report:?}");
        let entry = self
            .orch
            .state()
            .entries()
            .into_iter()
            .find(|e| e.token_id == token)
            .expect("entry placed");
        self.exchange.fill(&entry.order_id);
        let pass = self.orch.monitor().run_pass(at + Duration::seconds(1)).await;
        assert_eq!(pass.fills, 1);
        entry.order_id
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = storage::delete_snapshot(&self.snapshot_path);
    }
}

#[tokio::test]
async fn test_entry_is_post_only_maker_bid() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    let report = h.orch.run_scan_cycle(t0()).await;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.entries_placed, 1);

    let buys = h.exchange.buys();
    assert_eq!(buys.len(), 1);
    assert_eq!(buys[0].1.spec.price, dec!(0.951));
    assert_eq!(buys[0].1.spec.size, dec!(52.58));

    // Same token is not entered twice.
    let again = h.orch.run_scan_cycle(t0() + Duration::minutes(1)).await;
    assert_eq!(again.entries_placed, 0);
    assert_eq!(h.exchange.buys().len(), 1);
}

#[tokio::test]
async fn test_stop_loss_sequence_forces_single_exit() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.open_position("a-yes", t0()).await;
    assert_eq!(h.exchange.sells_at(dec!(0.99)), 1);

    let monitor = h.orch.monitor();
    let state = h.orch.state();

    h.exchange.set_bid("a-yes", dec!(0.96));
    monitor.run_pass(secs(10)).await;
    assert_eq!(state.position("a-yes").unwrap().stage, StopStage::Monitoring);

    h.exchange.set_bid("a-yes", dec!(0.89));
    monitor.run_pass(secs(12)).await;
    let p = state.position("a-yes").unwrap();
    assert_eq!(p.stage, StopStage::L1Warn);
    assert!(p.take_profit_order_id.is_none(), "take-profit pulled below L1");
    let (tp_id, _) = h
        .exchange
        .posted()
        .into_iter()
        .find(|(_, o)| o.spec.price == dec!(0.99))
        .unwrap();
    assert_eq!(h.exchange.order(&tp_id).status, OrderStatus::Cancelled);

    h.exchange.set_bid("a-yes", dec!(0.84));
    monitor.run_pass(secs(14)).await;
    assert_eq!(state.position("a-yes").unwrap().stage, StopStage::L2Timing);

    let report = monitor.run_pass(secs(30)).await;
    assert_eq!(report.hard_stops, 1);
    assert!(state.position("a-yes").is_none());
    assert_eq!(h.exchange.balance("a-yes"), Decimal::ZERO);
    assert_eq!(h.exchange.sells_at(dec!(0.10)), 1);

    let snap = state.snapshot(secs(31));
    assert_eq!(
        snap.hard_stops,
        vec![HardStopEvent {
            token_id: "a-yes".into(),
            at: secs(30),
        }]
    );

    // A further pass does nothing.
    let after = monitor.run_pass(secs(40)).await;
    assert_eq!(after.hard_stops, 0);
    assert_eq!(state.hard_stop_count(), 1);

    // Logged as a loss and fed back into learning.
    let perf = h.store.bot_performance("Sniper-V1", t0() - Duration::days(1)).await.unwrap();
    assert_eq!((perf.trades, perf.wins), (1, 0));
    let tallies = h.store.get_learned_bias_inputs("Sniper-V1").await.unwrap();
    assert_eq!(tallies["price_very_high"].losses, 1);
}

#[tokio::test]
async fn test_bounce_resets_confirmation_timer() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.open_position("a-yes", t0()).await;
    let monitor = h.orch.monitor();

    h.exchange.set_bid("a-yes", dec!(0.84));
    monitor.run_pass(secs(10)).await;
    h.exchange.set_bid("a-yes", dec!(0.86));
    monitor.run_pass(secs(20)).await;
    h.exchange.set_bid("a-yes", dec!(0.84));
    monitor.run_pass(secs(22)).await;

    // 16s after the first breach but only 10s after the re-breach.
    let report = monitor.run_pass(secs(32)).await;
    assert_eq!(report.hard_stops, 0);
    assert_eq!(h.orch.state().position("a-yes").unwrap().l2_started_at, Some(secs(22)));

    let report = monitor.run_pass(secs(37)).await;
    assert_eq!(report.hard_stops, 1);
}

#[tokio::test]
async fn test_failed_exit_keeps_position_for_retry() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.open_position("a-yes", t0()).await;
    let monitor = h.orch.monitor();

    h.exchange.set_bid("a-yes", dec!(0.80));
    monitor.run_pass(secs(10)).await;

    h.exchange.reject_sells(true);
    let report = monitor.run_pass(secs(30)).await;
    assert_eq!(report.hard_stops, 0);
    let p = h.orch.state().position("a-yes").unwrap();
    assert_eq!(p.stage, StopStage::L2Timing);
    assert_eq!(p.l2_started_at, Some(secs(10)));
    assert_eq!(h.orch.state().hard_stop_count(), 0);

    // Venue back: the very next pass exits without a new confirmation wait.
    h.exchange.reject_sells(false);
    let report = monitor.run_pass(secs(31)).await;
    assert_eq!(report.hard_stops, 1);
    assert!(h.orch.state().position("a-yes").is_none());
}

#[tokio::test]
async fn test_breaker_suppresses_entries_without_extending_cooldown() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    let state = h.orch.state();

    state.record_hard_stop(HardStopEvent { token_id: "x".into(), at: t0() });
    state.record_hard_stop(HardStopEvent { token_id: "y".into(), at: t0() + Duration::hours(2) });
    let trip = t0() + Duration::hours(2);
    assert!(h.orch.monitor().run_pass(trip).await.breaker_tripped);

    h.feed.set(vec![market_ending("a", "Sports", trip + Duration::hours(3))]);
    let report = h.orch.run_scan_cycle(trip + Duration::minutes(1)).await;
    assert_eq!(report.eligible, 1);
    assert_eq!(report.entries_placed, 0);
    assert!(h.exchange.buys().is_empty());

    state.record_hard_stop(HardStopEvent { token_id: "z".into(), at: trip + Duration::hours(10) });
    h.orch.monitor().run_pass(trip + Duration::hours(10)).await;
    assert_eq!(state.snapshot(trip + Duration::hours(10)).breaker_tripped_at, Some(trip));

    assert!(state.entries_suppressed(trip + Duration::hours(23)));
    assert!(!state.entries_suppressed(trip + Duration::hours(24)));

    let later = trip + Duration::hours(24);
    h.feed.set(vec![market_ending("a", "Sports", later + Duration::hours(3))]);
    h.orch.monitor().run_pass(later).await;
    assert_eq!(h.orch.run_scan_cycle(later).await.entries_placed, 1);
}

#[tokio::test]
async fn test_duplicate_fill_places_one_take_profit() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    let entry_id = h.open_position("a-yes", t0()).await;

    // Repeated passes and a replayed fill notification.
    h.orch.monitor().run_pass(secs(5)).await;
    h.orch.monitor().run_pass(secs(6)).await;
    let fill = polyarb::types::FillEvent {
        order_id: entry_id,
        token_id: "a-yes".into(),
        price: dec!(0.951),
        size: dec!(52.58),
    };
    assert_eq!(h.orch.executor().on_fill(&fill).await.unwrap(), None);

    assert_eq!(h.exchange.sells_at(dec!(0.99)), 1);
}

#[tokio::test]
async fn test_take_profit_fill_resolves_win() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.open_position("a-yes", t0()).await;

    let tp_id = h.orch.state().position("a-yes").unwrap().take_profit_order_id.unwrap();
    h.exchange.fill(&tp_id);
    let report = h.orch.monitor().run_pass(secs(10)).await;
    assert_eq!(report.take_profits, 1);
    assert_eq!(h.orch.state().position_count(), 0);

    let perf = h.store.bot_performance("Sniper-V1", t0() - Duration::days(1)).await.unwrap();
    assert_eq!((perf.trades, perf.wins), (1, 1));
    // (0.99 - 0.951) × 52.58
    assert_eq!(perf.total_pnl, dec!(2.05062));
}

#[tokio::test]
async fn test_resolved_market_closes_by_last_bid() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.open_position("a-yes", t0()).await;
    h.orch.monitor().run_pass(secs(5)).await;

    h.exchange.remove_book("a-yes");
    h.exchange.set_balance("a-yes", Decimal::ZERO);
    let report = h.orch.monitor().run_pass(secs(10)).await;
    assert_eq!(report.resolved_externally, 1);

    let perf = h.store.bot_performance("Sniper-V1", t0() - Duration::days(1)).await.unwrap();
    assert_eq!(perf.wins, 1);
}

#[tokio::test]
async fn test_unfilled_entry_times_out() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.orch.run_scan_cycle(t0()).await;
    let (order_id, _) = h.exchange.buys().remove(0);

    let early = h.orch.monitor().run_pass(t0() + Duration::minutes(14)).await;
    assert_eq!(early.expired, 0);

    // First attempt fails at the venue; the entry is kept and retried.
    h.exchange.fail_cancels(true);
    let failed = h.orch.monitor().run_pass(t0() + Duration::minutes(15)).await;
    assert_eq!(failed.expired, 0);
    assert_eq!(h.orch.state().entry_count(), 1);

    h.exchange.fail_cancels(false);
    let report = h.orch.monitor().run_pass(t0() + Duration::minutes(16)).await;
    assert_eq!(report.expired, 1);
    assert_eq!(h.orch.state().entry_count(), 0);
    assert_eq!(h.exchange.order(&order_id).status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_category_and_global_caps() {
    let markets = vec![
        market("s1", "Sports"),
        market("s2", "Sports"),
        market("c1", "Crypto"),
        market("p1", "Politics"),
    ];
    let h = Harness::new(markets, |cfg| {
        cfg.agent.max_active_positions_per_category = 1;
        cfg.agent.global_max_positions = 2;
    })
    .await;

    let report = h.orch.run_scan_cycle(t0()).await;
    assert_eq!(report.entries_placed, 2);
    assert_eq!(report.capped, 2);
    let tokens: Vec<String> = h.exchange.buys().into_iter().map(|(_, o)| o.spec.token_id).collect();
    assert_eq!(tokens, vec!["s1-yes", "c1-yes"]);
}

#[tokio::test]
async fn test_excluded_opinion_category_never_scanned_in() {
    let mut opinion = market("op", "Opinion");
    opinion.tags = vec!["Opinion".into()];
    let h = Harness::new(vec![opinion, market("ok", "Sports")], |cfg| {
        cfg.filters.excluded_categories = vec!["Opinion".into()];
    })
    .await;

    let report = h.orch.run_scan_cycle(t0()).await;
    assert_eq!(report.eligible, 1);
    let tokens: Vec<String> = h.exchange.buys().into_iter().map(|(_, o)| o.spec.token_id).collect();
    assert_eq!(tokens, vec!["ok-yes"]);
}

#[tokio::test]
async fn test_snapshot_restores_monitoring_after_restart() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.open_position("a-yes", t0()).await;
    h.orch.write_snapshot(secs(2));

    let restarted = Orchestrator::new(
        {
            let mut cfg = AppConfig::default();
            cfg.agent.snapshot_path = h.snapshot_path.clone();
            cfg
        },
        h.feed.clone() as Arc<dyn MarketFeed>,
        h.exchange.clone() as Arc<dyn TradingClient>,
        h.store.clone() as Arc<dyn PersistenceService>,
        prepare_bots(h.store.as_ref(), &AppConfig::default()).await,
    );
    assert!(restarted.restore_snapshot().unwrap());
    assert_eq!(restarted.state().position_count(), 1);

    // The restored take-profit claim blocks a second placement.
    restarted.monitor().run_pass(secs(5)).await;
    assert_eq!(h.exchange.sells_at(dec!(0.99)), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_outstanding_entries() {
    // The loops run on the wall clock.
    let ends = Utc::now() + Duration::hours(3);
    let markets = vec![market_ending("a", "Sports", ends), market_ending("b", "Crypto", ends)];
    let h = Harness::new(markets, |cfg| {
        cfg.agent.scan_interval_secs = 3600;
        cfg.agent.monitor_interval_secs = 3600;
        cfg.agent.snapshot_interval_secs = 3600;
    })
    .await;

    let (tx, rx) = tokio::sync::watch::channel(false);
    let orch = h.orch.clone();
    let run = tokio::spawn(async move { orch.run(rx).await });

    // Let the first scan place both entries.
    for _ in 0..50 {
        if h.orch.state().entry_count() == 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(h.orch.state().entry_count(), 2);

    tx.send(true).unwrap();
    run.await.unwrap();

    assert_eq!(h.orch.state().entry_count(), 0);
    for (id, _) in h.exchange.buys() {
        assert_eq!(h.exchange.order(&id).status, OrderStatus::Cancelled);
    }
    assert!(storage::load_snapshot(&h.snapshot_path).unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshot_writes_interleave_with_monitor_passes() {
    let h = Harness::new(vec![market("a", "Sports"), market("b", "Crypto")], |_| {}).await;
    h.open_position("a-yes", t0()).await;
    h.orch.run_scan_cycle(secs(2)).await;
    assert_eq!(h.orch.state().entry_count(), 1);

    let orch = h.orch.clone();
    let writer = tokio::spawn(async move {
        for i in 0..50 {
            orch.write_snapshot(secs(3 + i));
            tokio::task::yield_now().await;
        }
    });

    let passes = async {
        for i in 0..50 {
            h.orch.monitor().run_pass(secs(3 + i)).await;
            assert_eq!(h.orch.run_scan_cycle(secs(3 + i)).await.entries_placed, 0);
        }
    };

    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        passes.await;
        writer.await.unwrap();
    })
    .await
    .expect("snapshot and monitor loops made progress");

    let snap = storage::load_snapshot(&h.snapshot_path).unwrap().unwrap();
    assert_eq!(snap.active_positions.len(), 1);
    assert_eq!(snap.active_entry_orders.len(), 1);
}

#[tokio::test]
async fn test_tripping_hard_stop_blocks_next_scan() {
    let h = Harness::new(vec![market("a", "Sports")], |_| {}).await;
    h.orch.state().record_hard_stop(HardStopEvent {
        token_id: "earlier".into(),
        at: t0(),
    });
    h.open_position("a-yes", t0()).await;
    assert!(!h.orch.state().entries_suppressed(secs(1)));

    h.exchange.set_bid("a-yes", dec!(0.84));
    h.orch.monitor().run_pass(secs(10)).await;
    let report = h.orch.monitor().run_pass(secs(25)).await;
    assert_eq!(report.hard_stops, 1);

    // No monitor pass in between: the scan must already see the trip.
    h.feed.set(vec![market("c", "Crypto")]);
    h.exchange.set_bid("c-yes", dec!(0.95));
    let cycle = h.orch.run_scan_cycle(secs(26)).await;
    assert_eq!(cycle.eligible, 1);
    assert_eq!(cycle.entries_placed, 0);
    assert!(h.exchange.buys().iter().all(|(_, o)| o.spec.token_id == "a-yes"));
}
