//! Mongo-backed persistence. Owns the collection layout, the startup
//! index set (including TTLs), idempotent upsert paths, and the reads
//! behind the REST surface. Every store call runs under a deadline so a
//! wedged primary cannot stall the pipeline.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use core_types::{
    ConnectionEvent, GameTick, GameUpdate, GodCandle, LiveState, OhlcIndex, PrngStatus,
    PrngTrackingRecord, SideBetRecord, SnapshotDoc, StoreSink, TradeRecord, ValidationSummary,
    VerificationReport,
};
use futures::TryStreamExt;
use mongodb::options::{ClientOptions, FindOneOptions, FindOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, Database, IndexModel};

mod json;
mod pool;

pub use json::doc_to_json;
pub use pool::{StoreCounters, StoreJob, StorePool};

/// Per-call deadline for every store operation.
pub const STORE_DEADLINE: Duration = Duration::from_secs(5);

const SNAPSHOT_TTL_DAYS: u64 = 10;
const EVENT_TTL_DAYS: u64 = 30;

pub mod collections {
    pub const SNAPSHOTS: &str = "game_state_snapshots";
    pub const TRADES: &str = "trades";
    pub const GAMES: &str = "games";
    pub const EVENTS: &str = "events";
    pub const CONNECTION_EVENTS: &str = "connection_events";
    pub const PRNG_TRACKING: &str = "prng_tracking";
    pub const GOD_CANDLES: &str = "god_candles";
    pub const GAME_TICKS: &str = "game_ticks";
    pub const GAME_INDICES: &str = "game_indices";
    pub const SIDE_BETS: &str = "side_bets";
    pub const META: &str = "meta";
    pub const STATUS_CHECKS: &str = "status_checks";
}

#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub url: String,
    pub db_name: String,
    /// TTL for `game_ticks` / `game_indices`; 0 keeps them forever.
    pub tick_ttl_days: u64,
}

/// Everything the verifier needs to re-simulate one completed game.
#[derive(Debug, Clone)]
pub struct VerificationSource {
    pub game_id: String,
    pub server_seed: Option<String>,
    pub version: Option<String>,
    pub prices: Vec<f64>,
    pub peak_multiplier: Option<f64>,
}

#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Connects and verifies the deployment answers a ping. Fails fast:
    /// a service that cannot reach its store must not come up.
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.url)
            .await
            .context("parse MONGO_URL")?;
        options.connect_timeout = Some(STORE_DEADLINE);
        options.server_selection_timeout = Some(STORE_DEADLINE);
        let client = Client::with_options(options).context("build mongo client")?;
        let db = client.database(&config.db_name);

        let store = Self { db };
        store.ping().await.context("initial store ping")?;
        tracing::info!(db = %config.db_name, "store connected");
        Ok(store)
    }

    /// Round-trip time of a `ping` command, in milliseconds.
    pub async fn ping(&self) -> Result<f64> {
        let started = std::time::Instant::now();
        deadline(self.db.run_command(doc! {"ping": 1}, None)).await?;
        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }

    /// Creates the full index set. TTL settings on existing indexes are
    /// altered in place via `collMod` where the server supports it;
    /// otherwise the index is dropped and recreated.
    pub async fn ensure_indexes(&self, config: &MongoConfig) -> Result<()> {
        use collections as c;

        self.index(c::SNAPSHOTS, doc! {"gameId": 1, "tickCount": -1}, false, None)
            .await?;
        self.ttl_index(c::SNAPSHOTS, "createdAt", SNAPSHOT_TTL_DAYS)
            .await?;

        self.unique_with_fallback(c::TRADES, doc! {"eventId": 1}).await?;
        self.index(c::TRADES, doc! {"gameId": 1, "tickIndex": 1}, false, None)
            .await?;

        self.index(c::GAMES, doc! {"id": 1}, true, None).await?;
        for keys in [
            doc! {"phase": 1},
            doc! {"hasGodCandle": 1},
            doc! {"prngVerified": 1},
            doc! {"startTime": -1},
            doc! {"endTime": -1},
            doc! {"rugTick": 1},
            doc! {"endPrice": 1},
            doc! {"peakMultiplier": -1},
            doc! {"totalTicks": 1},
        ] {
            self.index(c::GAMES, keys, false, None).await?;
        }

        self.index(c::EVENTS, doc! {"type": 1, "createdAt": -1}, false, None)
            .await?;
        self.ttl_index(c::EVENTS, "createdAt", EVENT_TTL_DAYS).await?;

        self.index(
            c::CONNECTION_EVENTS,
            doc! {"eventType": 1, "createdAt": -1},
            false,
            None,
        )
        .await?;
        self.ttl_index(c::CONNECTION_EVENTS, "createdAt", EVENT_TTL_DAYS)
            .await?;

        self.index(c::PRNG_TRACKING, doc! {"gameId": 1}, true, None)
            .await?;

        self.index(c::GOD_CANDLES, doc! {"gameId": 1, "tickIndex": 1}, true, None)
            .await?;
        self.index(c::GOD_CANDLES, doc! {"createdAt": -1}, false, None)
            .await?;
        self.index(c::GOD_CANDLES, doc! {"underCap": 1}, false, None)
            .await?;

        self.index(c::GAME_TICKS, doc! {"gameId": 1, "tick": 1}, true, None)
            .await?;
        self.index(c::GAME_INDICES, doc! {"gameId": 1, "index": 1}, true, None)
            .await?;
        if config.tick_ttl_days > 0 {
            self.ttl_index(c::GAME_TICKS, "createdAt", config.tick_ttl_days)
                .await?;
            self.ttl_index(c::GAME_INDICES, "createdAt", config.tick_ttl_days)
                .await?;
        }

        self.index(c::SIDE_BETS, doc! {"gameId": 1, "createdAt": -1}, false, None)
            .await?;
        self.index(c::SIDE_BETS, doc! {"gameId": 1, "startTick": 1}, false, None)
            .await?;

        self.index(c::META, doc! {"key": 1}, true, None).await?;
        self.index(c::STATUS_CHECKS, doc! {"timestamp": -1}, false, None)
            .await?;

        tracing::info!("store indexes ensured");
        Ok(())
    }

    async fn index(
        &self,
        collection: &str,
        keys: Document,
        unique: bool,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut options = IndexOptions::builder().build();
        options.unique = unique.then_some(true);
        options.expire_after = ttl;
        let model = IndexModel::builder().keys(keys).options(options).build();
        deadline(self.coll(collection).create_index(model, None))
            .await
            .with_context(|| format!("create index on {collection}"))?;
        Ok(())
    }

    /// TTL index on `field`. If an index with the same key already
    /// exists with a different expiry, alter it with `collMod`; when
    /// that is rejected, drop and recreate.
    async fn ttl_index(&self, collection: &str, field: &str, days: u64) -> Result<()> {
        let secs = days * 24 * 60 * 60;
        let created = self
            .index(collection, doc! {field: 1}, false, Some(Duration::from_secs(secs)))
            .await;
        let Err(err) = created else {
            return Ok(());
        };

        let index_name = format!("{field}_1");
        let altered = deadline(self.db.run_command(
            doc! {
                "collMod": collection,
                "index": {"name": &index_name, "expireAfterSeconds": secs as i64},
            },
            None,
        ))
        .await;
        if altered.is_ok() {
            tracing::info!(collection, index = %index_name, "ttl altered via collMod");
            return Ok(());
        }

        tracing::warn!(?err, collection, index = %index_name, "recreating ttl index");
        let _ = deadline(self.coll(collection).drop_index(&index_name, None)).await;
        self.index(collection, doc! {field: 1}, false, Some(Duration::from_secs(secs)))
            .await
    }

    /// Unique index with a documented fallback: if pre-existing
    /// duplicates make the unique build fail, keep a plain index so the
    /// lookups stay fast.
    async fn unique_with_fallback(&self, collection: &str, keys: Document) -> Result<()> {
        if self.index(collection, keys.clone(), true, None).await.is_ok() {
            return Ok(());
        }
        tracing::warn!(collection, "unique index failed; falling back to non-unique");
        self.index(collection, keys, false, None).await
    }

    fn coll(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(name)
    }

    fn upsert() -> UpdateOptions {
        UpdateOptions::builder().upsert(true).build()
    }

    // ---- reads behind the REST surface ----

    pub async fn live_state(&self) -> Result<Option<serde_json::Value>> {
        let found = deadline(
            self.coll(collections::META)
                .find_one(doc! {"key": "live_state"}, None),
        )
        .await?;
        Ok(found.map(|mut d| {
            d.remove("_id");
            d.remove("key");
            doc_to_json(d)
        }))
    }

    pub async fn recent_snapshots(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let options = FindOptions::builder()
            .sort(doc! {"createdAt": -1})
            .limit(limit)
            .projection(doc! {"payload": 0})
            .build();
        self.find_mapped(collections::SNAPSHOTS, doc! {}, options).await
    }

    pub async fn recent_games(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let options = FindOptions::builder()
            .sort(doc! {"lastSeenAt": -1})
            .limit(limit)
            .build();
        self.find_mapped(collections::GAMES, doc! {}, options).await
    }

    pub async fn game(&self, game_id: &str) -> Result<Option<serde_json::Value>> {
        let found = deadline(self.coll(collections::GAMES).find_one(doc! {"id": game_id}, None))
            .await?;
        Ok(found.map(strip_id))
    }

    pub async fn current_game(&self) -> Result<Option<serde_json::Value>> {
        let options = FindOneOptions::builder()
            .sort(doc! {"lastSeenAt": -1})
            .build();
        let found = deadline(self.coll(collections::GAMES).find_one(doc! {}, options)).await?;
        Ok(found.map(strip_id))
    }

    pub async fn game_quality(&self, game_id: &str) -> Result<Option<serde_json::Value>> {
        let options = FindOneOptions::builder()
            .projection(doc! {"id": 1, "quality": 1})
            .build();
        let found = deadline(
            self.coll(collections::GAMES)
                .find_one(doc! {"id": game_id}, options),
        )
        .await?;
        Ok(found.map(strip_id))
    }

    pub async fn game_verification(&self, game_id: &str) -> Result<Option<serde_json::Value>> {
        let found = deadline(
            self.coll(collections::PRNG_TRACKING)
                .find_one(doc! {"gameId": game_id}, None),
        )
        .await?;
        Ok(found.map(strip_id))
    }

    pub async fn ohlc(&self, game_id: &str, limit: i64) -> Result<Vec<serde_json::Value>> {
        let options = FindOptions::builder()
            .sort(doc! {"index": 1})
            .limit(limit)
            .build();
        self.find_mapped(collections::GAME_INDICES, doc! {"gameId": game_id}, options)
            .await
    }

    pub async fn god_candles(&self, game_id: Option<&str>) -> Result<Vec<serde_json::Value>> {
        let filter = match game_id {
            Some(id) => doc! {"gameId": id},
            None => doc! {},
        };
        let options = FindOptions::builder()
            .sort(doc! {"createdAt": -1})
            .limit(200)
            .build();
        self.find_mapped(collections::GOD_CANDLES, filter, options).await
    }

    pub async fn prng_tracking(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let options = FindOptions::builder()
            .sort(doc! {"updatedAt": -1})
            .limit(limit)
            .build();
        self.find_mapped(collections::PRNG_TRACKING, doc! {}, options).await
    }

    pub async fn insert_status_check(&self, client_name: &str) -> Result<serde_json::Value> {
        let id = core_types::new_id();
        let now = bson::DateTime::now();
        deadline(self.coll(collections::STATUS_CHECKS).insert_one(
            doc! {"_id": &id, "clientName": client_name, "timestamp": now},
            None,
        ))
        .await?;
        Ok(serde_json::json!({
            "id": id,
            "clientName": client_name,
            "timestamp": now.try_to_rfc3339_string().unwrap_or_default(),
        }))
    }

    pub async fn status_checks(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let options = FindOptions::builder()
            .sort(doc! {"timestamp": -1})
            .limit(limit)
            .build();
        self.find_mapped(collections::STATUS_CHECKS, doc! {}, options).await
    }

    async fn find_mapped(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<serde_json::Value>> {
        let cursor = deadline(self.coll(collection).find(filter, options)).await?;
        let docs: Vec<Document> = deadline(cursor.try_collect()).await?;
        Ok(docs.into_iter().map(strip_id).collect())
    }

    // ---- verifier support ----

    /// Loads the authoritative material for one game. `None` when the
    /// game is unknown.
    pub async fn verification_source(&self, game_id: &str) -> Result<Option<VerificationSource>> {
        let Some(game) = deadline(
            self.coll(collections::GAMES)
                .find_one(doc! {"id": game_id}, None),
        )
        .await?
        else {
            return Ok(None);
        };

        let history = game.get_document("historyEntry").ok();
        let prices = history
            .and_then(|h| h.get_array("prices").ok())
            .map(|arr| {
                arr.iter()
                    .filter_map(|b| match b {
                        Bson::Double(v) => Some(*v),
                        Bson::Int32(v) => Some(*v as f64),
                        Bson::Int64(v) => Some(*v as f64),
                        _ => None,
                    })
                    .collect::<Vec<f64>>()
            })
            .unwrap_or_default();
        let peak_multiplier = history
            .and_then(|h| h.get_f64("peakMultiplier").ok())
            .or_else(|| game.get_f64("peakMultiplier").ok());

        Ok(Some(VerificationSource {
            game_id: game_id.to_string(),
            server_seed: game.get_str("serverSeed").ok().map(str::to_string),
            version: game.get_str("version").ok().map(str::to_string),
            prices,
            peak_multiplier,
        }))
    }

    /// Persists a verification outcome on both the game row and the
    /// tracking row. Idempotent: same report, same resulting documents.
    pub async fn record_verification(
        &self,
        game_id: &str,
        status: PrngStatus,
        report: Option<&VerificationReport>,
    ) -> Result<()> {
        let report_bson = report
            .map(|r| bson::to_bson(r).context("encode verification report"))
            .transpose()?;

        let mut game_set = doc! {"lastSeenAt": bson::DateTime::now()};
        if let Some(r) = report {
            game_set.insert("prngVerified", r.prng_verified);
        }
        if let Some(ref b) = report_bson {
            game_set.insert("prngVerificationData", b.clone());
        }
        deadline(self.coll(collections::GAMES).update_one(
            doc! {"id": game_id},
            doc! {"$set": game_set},
            Self::upsert(),
        ))
        .await?;

        let mut tracking_set = doc! {
            "gameId": game_id,
            "status": status.as_str(),
            "updatedAt": bson::DateTime::now(),
        };
        if let Some(b) = report_bson {
            tracking_set.insert("verification", b);
        }
        deadline(self.coll(collections::PRNG_TRACKING).update_one(
            doc! {"gameId": game_id},
            doc! {"$set": tracking_set},
            Self::upsert(),
        ))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreSink for MongoStore {
    async fn insert_snapshot(&self, snap: SnapshotDoc) -> Result<()> {
        let mut doc = to_document(&snap)?;
        doc.insert("_id", core_types::new_id());
        doc.insert("createdAt", bson::DateTime::now());
        deadline(self.coll(collections::SNAPSHOTS).insert_one(doc, None)).await?;
        Ok(())
    }

    async fn upsert_trade(
        &self,
        trade: TradeRecord,
        validation: ValidationSummary,
    ) -> Result<bool> {
        let mut insert = doc! {
            "_id": core_types::new_id(),
            "eventId": &trade.event_id,
            "createdAt": bson::DateTime::now(),
            "validation": to_document(&validation)?,
        };
        maybe(&mut insert, "gameId", trade.game_id.as_deref());
        maybe(&mut insert, "playerId", trade.player_id.as_deref());
        if let Some(side) = trade.trade_type {
            insert.insert("type", side.to_string());
        }
        if let Some(tick) = trade.tick_index {
            insert.insert("tickIndex", tick);
        }
        // Exact decimals persist as canonical strings.
        maybe(&mut insert, "amount", trade.amount.map(|d| d.to_string()).as_deref());
        maybe(&mut insert, "qty", trade.qty.map(|d| d.to_string()).as_deref());
        maybe(&mut insert, "price", trade.price.map(|d| d.to_string()).as_deref());
        maybe(&mut insert, "coin", trade.coin.as_deref());

        let result = deadline(self.coll(collections::TRADES).update_one(
            doc! {"eventId": &trade.event_id},
            doc! {"$setOnInsert": insert},
            Self::upsert(),
        ))
        .await?;
        Ok(result.upserted_id.is_some())
    }

    async fn insert_side_bet(
        &self,
        bet: SideBetRecord,
        validation: ValidationSummary,
    ) -> Result<()> {
        let mut doc = doc! {
            "_id": core_types::new_id(),
            "event": &bet.event,
            "createdAt": bson::DateTime::now(),
            "validation": to_document(&validation)?,
        };
        maybe(&mut doc, "gameId", bet.game_id.as_deref());
        maybe(&mut doc, "playerId", bet.player_id.as_deref());
        if let Some(v) = bet.start_tick {
            doc.insert("startTick", v);
        }
        if let Some(v) = bet.end_tick {
            doc.insert("endTick", v);
        }
        maybe(&mut doc, "betAmount", bet.bet_amount.map(|d| d.to_string()).as_deref());
        if let Some(v) = bet.target_multiplier {
            doc.insert("targetMultiplier", v);
        }
        if let Some(v) = bet.payout_ratio {
            doc.insert("payoutRatio", v);
        }
        if let Some(v) = bet.won {
            doc.insert("won", v);
        }
        maybe(&mut doc, "pnl", bet.pnl.map(|d| d.to_string()).as_deref());

        deadline(self.coll(collections::SIDE_BETS).insert_one(doc, None)).await?;
        Ok(())
    }

    async fn archive_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        validation: Option<ValidationSummary>,
    ) -> Result<()> {
        let mut doc = doc! {
            "_id": core_types::new_id(),
            "type": event_type,
            "payload": json_to_bson(payload),
            "createdAt": bson::DateTime::now(),
        };
        if let Some(v) = validation {
            doc.insert("validation", to_document(&v)?);
        }
        deadline(self.coll(collections::EVENTS).insert_one(doc, None)).await?;
        Ok(())
    }

    async fn insert_connection_event(&self, event: ConnectionEvent) -> Result<()> {
        let mut doc = to_document(&event)?;
        doc.insert("_id", core_types::new_id());
        doc.insert("createdAt", bson::DateTime::now());
        deadline(self.coll(collections::CONNECTION_EVENTS).insert_one(doc, None)).await?;
        Ok(())
    }

    async fn upsert_game(&self, game_id: &str, update: GameUpdate) -> Result<()> {
        // The revealed seed is immutable: it only lands on documents
        // that do not carry one yet.
        if let Some(seed) = update.server_seed.as_deref() {
            deadline(self.coll(collections::GAMES).update_one(
                doc! {"id": game_id, "serverSeed": {"$exists": false}},
                doc! {"$set": {"serverSeed": seed}},
                None,
            ))
            .await?;
        }

        let mut set = doc! {"id": game_id, "lastSeenAt": bson::DateTime::now()};
        if let Some(phase) = update.phase {
            set.insert("phase", phase.as_str());
        }
        maybe(&mut set, "version", update.version.as_deref());
        maybe(&mut set, "serverSeedHash", update.server_seed_hash.as_deref());
        if let Some(t) = update.start_time {
            set.insert("startTime", bson::DateTime::from_chrono(t));
        }
        if let Some(t) = update.end_time {
            set.insert("endTime", bson::DateTime::from_chrono(t));
        }
        if let Some(v) = update.rug_tick {
            set.insert("rugTick", v);
        }
        if let Some(v) = update.end_price {
            set.insert("endPrice", v);
        }
        if let Some(v) = update.peak_multiplier {
            set.insert("peakMultiplier", v);
        }
        if let Some(v) = update.total_ticks {
            set.insert("totalTicks", v);
        }
        if let Some(v) = update.has_god_candle {
            set.insert("hasGodCandle", v);
        }
        if let Some(v) = update.prng_verified {
            set.insert("prngVerified", v);
        }
        if let Some(ref q) = update.quality {
            set.insert("quality", to_document(q)?);
        }
        if let Some(ref h) = update.history_entry {
            set.insert("historyEntry", json_to_bson(h.clone()));
        }

        let mut change = doc! {"$set": set};
        if let Some(ref transition) = update.phase_transition {
            change.insert("$push", doc! {"history": to_document(transition)?});
        }

        deadline(self.coll(collections::GAMES).update_one(
            doc! {"id": game_id},
            change,
            Self::upsert(),
        ))
        .await?;
        Ok(())
    }

    async fn upsert_tick(&self, tick: GameTick) -> Result<()> {
        deadline(self.coll(collections::GAME_TICKS).update_one(
            doc! {"gameId": &tick.game_id, "tick": tick.tick},
            doc! {
                "$set": {"price": tick.price},
                "$setOnInsert": {"_id": core_types::new_id(), "createdAt": bson::DateTime::now()},
            },
            Self::upsert(),
        ))
        .await?;
        Ok(())
    }

    async fn upsert_ohlc(&self, ohlc: OhlcIndex) -> Result<()> {
        deadline(self.coll(collections::GAME_INDICES).update_one(
            doc! {"gameId": &ohlc.game_id, "index": ohlc.index},
            doc! {
                "$set": {
                    "open": ohlc.open,
                    "high": ohlc.high,
                    "low": ohlc.low,
                    "close": ohlc.close,
                    "startTick": ohlc.start_tick,
                    "endTick": ohlc.end_tick,
                },
                "$setOnInsert": {"_id": core_types::new_id(), "createdAt": bson::DateTime::now()},
            },
            Self::upsert(),
        ))
        .await?;
        Ok(())
    }

    async fn insert_god_candle(&self, candle: GodCandle) -> Result<()> {
        deadline(self.coll(collections::GOD_CANDLES).update_one(
            doc! {"gameId": &candle.game_id, "tickIndex": candle.tick_index},
            doc! {"$setOnInsert": {
                "_id": core_types::new_id(),
                "gameId": &candle.game_id,
                "tickIndex": candle.tick_index,
                "fromPrice": candle.from_price,
                "toPrice": candle.to_price,
                "ratio": candle.ratio,
                "version": &candle.version,
                "underCap": candle.under_cap,
                "createdAt": bson::DateTime::now(),
            }},
            Self::upsert(),
        ))
        .await?;
        Ok(())
    }

    async fn upsert_prng(&self, record: PrngTrackingRecord) -> Result<()> {
        let mut set = doc! {
            "gameId": &record.game_id,
            "status": record.status.as_str(),
            "updatedAt": bson::DateTime::now(),
        };
        maybe(&mut set, "serverSeedHash", record.server_seed_hash.as_deref());
        maybe(&mut set, "serverSeed", record.server_seed.as_deref());
        if let Some(ref v) = record.verification {
            set.insert("verification", to_document(v)?);
        }
        deadline(self.coll(collections::PRNG_TRACKING).update_one(
            doc! {"gameId": &record.game_id},
            doc! {"$set": set},
            Self::upsert(),
        ))
        .await?;
        Ok(())
    }

    async fn set_live_state(&self, state: LiveState) -> Result<()> {
        let mut set = to_document(&state)?;
        set.insert("key", "live_state");
        deadline(self.coll(collections::META).update_one(
            doc! {"key": "live_state"},
            doc! {"$set": set},
            Self::upsert(),
        ))
        .await?;
        Ok(())
    }
}

async fn deadline<T, F>(fut: F) -> Result<T>
where
    F: std::future::Future<Output = mongodb::error::Result<T>>,
{
    match tokio::time::timeout(STORE_DEADLINE, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(core_types::ServiceError::Store(e.to_string()).into()),
        Err(_) => Err(core_types::ServiceError::Store(format!(
            "call exceeded {STORE_DEADLINE:?}"
        ))
        .into()),
    }
}

fn to_document<T: serde::Serialize>(value: &T) -> Result<Document> {
    match bson::to_bson(value).context("encode document")? {
        Bson::Document(d) => Ok(d),
        other => Err(anyhow!("expected document, got {:?}", other.element_type())),
    }
}

fn json_to_bson(value: serde_json::Value) -> Bson {
    bson::to_bson(&value).unwrap_or(Bson::Null)
}

fn maybe(doc: &mut Document, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        doc.insert(key, v);
    }
}

fn strip_id(mut doc: Document) -> serde_json::Value {
    if let Ok(id) = doc.get_str("_id").map(str::to_string) {
        doc.remove("_id");
        if !doc.contains_key("id") {
            doc.insert("id", id);
        }
    } else {
        doc.remove("_id");
    }
    doc_to_json(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_id_promotes_uuid_string() {
        let doc = doc! {"_id": "abc-123", "price": 1.5};
        let v = strip_id(doc);
        assert_eq!(v["id"], "abc-123");
        assert!(v.get("_id").is_none());
    }

    #[test]
    fn strip_id_keeps_existing_id() {
        let doc = doc! {"_id": "raw", "id": "game-1"};
        let v = strip_id(doc);
        assert_eq!(v["id"], "game-1");
    }

    #[test]
    fn to_document_encodes_validation() {
        let v = ValidationSummary::failed("gameStateUpdate", "price: null".to_string());
        let doc = to_document(&v).expect("doc");
        assert_eq!(doc.get_bool("ok").expect("ok"), false);
        assert_eq!(doc.get_str("schema").expect("schema"), "gameStateUpdate");
    }
}
