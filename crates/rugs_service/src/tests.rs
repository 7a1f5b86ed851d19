//! Pipeline scenarios driven end-to-end through the router against an
//! in-memory store sink: a full normal game, trade replay idempotency,
//! warn-only schema failures, and slow-consumer eviction under load.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use core_types::{
    ConnectionEvent, GamePhase, GameTick, GameUpdate, GodCandle, LiveState, OhlcIndex,
    PhaseTransition, PrngStatus, PrngTrackingRecord, QualityFlags, RawFrame, SideBetRecord,
    SnapshotDoc, StoreSink, TradeRecord, ValidationSummary,
};
use game_tracker::GameTracker;
use parking_lot::Mutex;
use schema_registry::SchemaRegistry;
use storage_mongo::{StoreCounters, StorePool};
use stream_hub::StreamHub;

use crate::metrics::ServiceMetrics;
use crate::router::Pipeline;

#[derive(Debug, Default, Clone)]
struct MemGame {
    phase: Option<GamePhase>,
    start_time: Option<chrono::DateTime<Utc>>,
    end_time: Option<chrono::DateTime<Utc>>,
    rug_tick: Option<i64>,
    end_price: Option<f64>,
    peak_multiplier: Option<f64>,
    total_ticks: Option<i64>,
    has_god_candle: Option<bool>,
    server_seed: Option<String>,
    server_seed_hash: Option<String>,
    quality: Option<QualityFlags>,
    transitions: Vec<PhaseTransition>,
}

#[derive(Default)]
struct MemStore {
    snapshots: Mutex<Vec<SnapshotDoc>>,
    trades: Mutex<HashMap<String, (TradeRecord, ValidationSummary)>>,
    side_bets: Mutex<Vec<SideBetRecord>>,
    events: Mutex<Vec<(String, serde_json::Value)>>,
    connection_events: Mutex<Vec<ConnectionEvent>>,
    games: Mutex<HashMap<String, MemGame>>,
    ticks: Mutex<HashMap<(String, i64), f64>>,
    ohlc: Mutex<HashMap<(String, i64), OhlcIndex>>,
    god_candles: Mutex<HashMap<(String, i64), GodCandle>>,
    prng: Mutex<HashMap<String, PrngTrackingRecord>>,
    live: Mutex<Option<LiveState>>,
}

#[async_trait]
impl StoreSink for MemStore {
    async fn insert_snapshot(&self, snap: SnapshotDoc) -> anyhow::Result<()> {
        self.snapshots.lock().push(snap);
        Ok(())
    }

    async fn upsert_trade(
        &self,
        trade: TradeRecord,
        validation: ValidationSummary,
    ) -> anyhow::Result<bool> {
        let mut trades = self.trades.lock();
        if trades.contains_key(&trade.event_id) {
            return Ok(false);
        }
        trades.insert(trade.event_id.clone(), (trade, validation));
        Ok(true)
    }

    async fn insert_side_bet(
        &self,
        bet: SideBetRecord,
        _validation: ValidationSummary,
    ) -> anyhow::Result<()> {
        self.side_bets.lock().push(bet);
        Ok(())
    }

    async fn archive_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        _validation: Option<ValidationSummary>,
    ) -> anyhow::Result<()> {
        self.events.lock().push((event_type.to_string(), payload));
        Ok(())
    }

    async fn insert_connection_event(&self, event: ConnectionEvent) -> anyhow::Result<()> {
        self.connection_events.lock().push(event);
        Ok(())
    }

    async fn upsert_game(&self, game_id: &str, update: GameUpdate) -> anyhow::Result<()> {
        let mut games = self.games.lock();
        let game = games.entry(game_id.to_string()).or_default();
        if update.phase.is_some() {
            game.phase = update.phase;
        }
        if update.start_time.is_some() {
            game.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            game.end_time = update.end_time;
        }
        if update.rug_tick.is_some() {
            game.rug_tick = update.rug_tick;
        }
        if update.end_price.is_some() {
            game.end_price = update.end_price;
        }
        if update.peak_multiplier.is_some() {
            game.peak_multiplier = update.peak_multiplier;
        }
        if update.total_ticks.is_some() {
            game.total_ticks = update.total_ticks;
        }
        if update.has_god_candle.is_some() {
            game.has_god_candle = update.has_god_candle;
        }
        // Write-once, like the unique-seed guard in the real store.
        if game.server_seed.is_none() {
            game.server_seed = update.server_seed.clone();
        }
        if update.server_seed_hash.is_some() {
            game.server_seed_hash = update.server_seed_hash.clone();
        }
        if update.quality.is_some() {
            game.quality = update.quality.clone();
        }
        if let Some(t) = update.phase_transition {
            game.transitions.push(t);
        }
        Ok(())
    }

    async fn upsert_tick(&self, tick: GameTick) -> anyhow::Result<()> {
        self.ticks
            .lock()
            .insert((tick.game_id.clone(), tick.tick), tick.price);
        Ok(())
    }

    async fn upsert_ohlc(&self, ohlc: OhlcIndex) -> anyhow::Result<()> {
        self.ohlc
            .lock()
            .insert((ohlc.game_id.clone(), ohlc.index), ohlc);
        Ok(())
    }

    async fn insert_god_candle(&self, candle: GodCandle) -> anyhow::Result<()> {
        self.god_candles
            .lock()
            .entry((candle.game_id.clone(), candle.tick_index))
            .or_insert(candle);
        Ok(())
    }

    async fn upsert_prng(&self, record: PrngTrackingRecord) -> anyhow::Result<()> {
        self.prng.lock().insert(record.game_id.clone(), record);
        Ok(())
    }

    async fn set_live_state(&self, state: LiveState) -> anyhow::Result<()> {
        *self.live.lock() = Some(state);
        Ok(())
    }
}

struct Harness {
    store: Arc<MemStore>,
    counters: Arc<StoreCounters>,
    hub: Arc<StreamHub>,
    metrics: Arc<ServiceMetrics>,
    pool: Arc<StorePool>,
    pipeline: Pipeline,
}

fn schema_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../schemas")
}

fn harness(buffer_depth: usize) -> Harness {
    let store = Arc::new(MemStore::default());
    let counters = Arc::new(StoreCounters::default());
    let hub = Arc::new(StreamHub::new(buffer_depth));
    let metrics = Arc::new(ServiceMetrics::default());
    let registry = Arc::new(SchemaRegistry::load(&schema_dir()).expect("schemas"));
    let pool = Arc::new(StorePool::spawn(
        store.clone() as Arc<dyn StoreSink>,
        counters.clone(),
        2,
        1_024,
    ));
    let pipeline = Pipeline {
        registry,
        hub: hub.clone(),
        pool: pool.clone(),
        metrics: metrics.clone(),
        tracker: GameTracker::new(),
    };
    Harness {
        store,
        counters,
        hub,
        metrics,
        pool,
        pipeline,
    }
}

impl Harness {
    async fn dispatch(&mut self, event: &str, payload: serde_json::Value) {
        self.pipeline
            .dispatch(RawFrame {
                event: event.to_string(),
                payload,
                received_at: Utc::now(),
            })
            .await;
    }

    /// Drops the pipeline and drains the store pool so every submitted
    /// job has been applied before assertions run.
    async fn drain(self) -> (Arc<MemStore>, Arc<StoreCounters>, Arc<StreamHub>) {
        let Harness {
            store,
            counters,
            hub,
            pool,
            pipeline,
            ..
        } = self;
        drop(pipeline);
        Arc::try_unwrap(pool)
            .ok()
            .expect("pool uniquely owned after pipeline drop")
            .shutdown(Duration::from_secs(5))
            .await;
        (store, counters, hub)
    }
}

fn game_state(game_id: &str, tick: i64, price: f64, rugged: bool) -> serde_json::Value {
    serde_json::json!({
        "gameId": game_id,
        "active": true,
        "rugged": rugged,
        "price": price,
        "tickCount": tick,
        "cooldownTimer": 0,
        "allowPreRoundBuys": false,
        "provablyFair": {"serverSeedHash": "hash-G1", "version": "v3"}
    })
}

fn cooldown_with_history(prices: Vec<f64>, peak: f64) -> serde_json::Value {
    serde_json::json!({
        "gameId": "G2",
        "active": false,
        "rugged": false,
        "price": 1.0,
        "tickCount": 0,
        "cooldownTimer": 15000,
        "gameHistory": [{
            "id": "G1",
            "prices": prices,
            "peakMultiplier": peak,
            "rugged": true,
            "provablyFair": {
                "serverSeed": "seed-G1",
                "serverSeedHash": "hash-G1",
                "version": "v3"
            }
        }]
    })
}

#[tokio::test]
async fn normal_game_end_to_end() {
    let mut h = harness(256);

    let mut prices = Vec::new();
    for tick in 0..33i64 {
        let rugged = tick == 32;
        let price = if rugged {
            0.020000000000000018
        } else {
            1.0 + tick as f64 * 0.01
        };
        prices.push(price);
        h.dispatch("gameStateUpdate", game_state("G1", tick, price, rugged))
            .await;
    }
    // Authoritative history carries one more entry than the last tick.
    let mut history_prices = vec![1.0];
    history_prices.extend(prices.iter().skip(1).copied());
    history_prices.push(0.020000000000000018);
    h.dispatch(
        "gameStateUpdate",
        cooldown_with_history(history_prices, 1.31),
    )
    .await;

    let (store, _counters, _hub) = h.drain().await;

    let ticks = store.ticks.lock();
    assert_eq!(ticks.len(), 33);
    assert_eq!(ticks[&("G1".to_string(), 32)], 0.020000000000000018);

    let ohlc = store.ohlc.lock();
    let indices: std::collections::HashSet<i64> =
        ohlc.keys().map(|(_, index)| *index).collect();
    assert_eq!(indices.len(), 7); // ceil(33 / 5)

    let games = store.games.lock();
    let game = games.get("G1").expect("game G1");
    assert_eq!(game.phase, Some(GamePhase::Completed));
    assert_eq!(game.rug_tick, Some(32));
    assert_eq!(game.total_ticks, Some(33));
    assert_eq!(game.end_price, Some(0.020000000000000018));
    assert_eq!(game.server_seed.as_deref(), Some("seed-G1"));
    assert_eq!(game.has_god_candle, Some(false));
    assert!(game.quality.as_ref().is_some_and(|q| !q.large_gap));

    let prng = store.prng.lock();
    let record = prng.get("G1").expect("prng record");
    assert_eq!(record.status, PrngStatus::Complete);
    assert_eq!(record.server_seed.as_deref(), Some("seed-G1"));

    let live = store.live.lock();
    assert_eq!(
        live.as_ref().and_then(|l| l.phase),
        Some(GamePhase::Cooldown)
    );

    assert_eq!(store.snapshots.lock().len(), 34);
}

#[tokio::test]
async fn trade_replay_is_idempotent() {
    let mut h = harness(64);
    let trade = serde_json::json!({
        "id": "T1",
        "gameId": "G1",
        "playerId": "P1",
        "type": "buy",
        "tickIndex": 5,
        "amount": 1.5,
        "qty": 3.0,
        "coin": "sol"
    });
    for _ in 0..3 {
        h.dispatch("standard/newTrade", trade.clone()).await;
    }

    let metrics = h.metrics.clone();
    let (store, counters, _hub) = h.drain().await;

    assert_eq!(store.trades.lock().len(), 1);
    assert_eq!(counters.trades_inserted(), 1);
    assert_eq!(metrics.messages_processed(), 3);
}

#[tokio::test]
async fn schema_failure_is_warn_only() {
    let mut h = harness(64);
    let registry = h.pipeline.registry.clone();
    h.dispatch(
        "gameStateUpdate",
        serde_json::json!({
            "gameId": "G1",
            "active": true,
            "rugged": false,
            "price": null,
            "tickCount": 4
        }),
    )
    .await;

    let (store, _counters, _hub) = h.drain().await;

    let snapshots = store.snapshots.lock();
    assert_eq!(snapshots.len(), 1);
    let snap = &snapshots[0];
    assert!(!snap.validation.ok);
    assert_eq!(snap.validation.schema.as_deref(), Some("gameStateUpdate"));
    assert!(snap.validation.error.is_some());

    let counters = registry.counters();
    assert_eq!(counters.per_event["gameStateUpdate"].fail, 1);
    assert_eq!(counters.total, 1);
}

#[tokio::test]
async fn side_bet_event_name_is_preserved() {
    let mut h = harness(64);
    h.dispatch(
        "standard/sideBetPlaced",
        serde_json::json!({
            "gameId": "G1", "playerId": "P1", "betAmount": 0.5, "startTick": 10
        }),
    )
    .await;
    h.dispatch(
        "standard/sideBetResult",
        serde_json::json!({
            "gameId": "G1", "playerId": "P1", "won": false, "pnl": -0.5
        }),
    )
    .await;

    let (store, _counters, _hub) = h.drain().await;
    let bets = store.side_bets.lock();
    assert_eq!(bets.len(), 2);
    assert_eq!(bets[0].event, "standard/sideBetPlaced");
    assert_eq!(bets[1].event, "standard/sideBetResult");
}

#[tokio::test]
async fn ancillary_events_land_in_the_archive() {
    let mut h = harness(64);
    h.dispatch("rugPool", serde_json::json!({"pool": 12.5})).await;
    h.dispatch("leaderboard", serde_json::json!([{"playerId": "P1"}]))
        .await;

    let (store, _counters, _hub) = h.drain().await;
    let events = store.events.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].0, "rugPool");
    assert_eq!(events[1].0, "leaderboard");
}

#[tokio::test]
async fn subscriber_sees_frames_in_dispatch_order() {
    let mut h = harness(64);
    let (_id, mut rx) = h.hub.subscribe();
    let hello = rx.recv().await.expect("hello");
    assert!(hello.contains("\"type\":\"hello\""));

    for tick in 0..3i64 {
        h.dispatch("gameStateUpdate", game_state("G1", tick, 1.0, false))
            .await;
    }

    for tick in 0..3i64 {
        let frame = rx.recv().await.expect("frame");
        let v: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(v["type"], "game_state_update");
        assert_eq!(v["tick"], tick);
        assert_eq!(v["schema"], "v1");
    }

    let _ = h.drain().await;
}

#[tokio::test]
async fn rug_frame_follows_the_final_snapshot() {
    let mut h = harness(64);
    let (_id, mut rx) = h.hub.subscribe();
    let _ = rx.recv().await.expect("hello");

    h.dispatch("gameStateUpdate", game_state("G1", 0, 1.0, false))
        .await;
    h.dispatch(
        "gameStateUpdate",
        game_state("G1", 1, 0.020000000000000018, true),
    )
    .await;

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let frame = rx.recv().await.expect("frame");
        let v: serde_json::Value = serde_json::from_str(&frame).expect("json");
        kinds.push(v["type"].as_str().unwrap_or("").to_string());
        if kinds.last().map(String::as_str) == Some("rug") {
            assert_eq!(v["gameId"], "G1");
            assert_eq!(v["tick"], 1);
            assert_eq!(v["endPrice"], 0.020000000000000018);
        }
    }
    assert_eq!(kinds, vec!["game_state_update", "game_state_update", "rug"]);

    let _ = h.drain().await;
}

#[tokio::test]
async fn slow_subscriber_is_evicted_under_load() {
    let mut h = harness(8);
    let (_id, _rx) = h.hub.subscribe(); // never drained
    for tick in 0..20i64 {
        h.dispatch("gameStateUpdate", game_state("G1", tick, 1.0, false))
            .await;
    }

    let (_store, _counters, hub) = h.drain().await;
    assert_eq!(hub.subscriber_count(), 0);
    assert!(hub.slow_client_drops() >= 1);
}

#[tokio::test]
async fn malformed_trade_is_archived_not_lost() {
    let mut h = harness(64);
    // No id field at all: unusable as an idempotent trade.
    h.dispatch("standard/newTrade", serde_json::json!({"gameId": "G1"}))
        .await;

    let metrics = h.metrics.clone();
    let (store, _counters, _hub) = h.drain().await;
    assert!(store.trades.lock().is_empty());
    assert_eq!(store.events.lock().len(), 1);
    assert_eq!(metrics.error_counters()["trade_parse"], 1);
}
