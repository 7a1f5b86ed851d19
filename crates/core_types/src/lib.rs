use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod outbound;
pub mod wire;

/// Lifecycle phase of a single game round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GamePhase {
    Waiting,
    Cooldown,
    PreRound,
    Active,
    Rug,
    Completed,
}

impl GamePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Cooldown => "COOLDOWN",
            Self::PreRound => "PRE_ROUND",
            Self::Active => "ACTIVE",
            Self::Rug => "RUG",
            Self::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for GamePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw frame off the upstream socket: event name, payload, receive time.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub event: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

/// Inbound event families the router dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    GameStateUpdate,
    NewTrade,
    SideBetPlaced,
    SideBetUpdate,
    GameStatePlayerUpdate,
    PlayerUpdate,
    Other,
}

/// Fixed event-name classification table. Anything unknown lands in the
/// raw event archive only.
pub fn classify_event(name: &str) -> InboundKind {
    match name {
        "gameStateUpdate" => InboundKind::GameStateUpdate,
        "standard/newTrade" => InboundKind::NewTrade,
        "standard/sideBetPlaced" => InboundKind::SideBetPlaced,
        "sideBet" | "standard/sideBetResult" => InboundKind::SideBetUpdate,
        "gameStatePlayerUpdate" => InboundKind::GameStatePlayerUpdate,
        "playerUpdate" => InboundKind::PlayerUpdate,
        _ => InboundKind::Other,
    }
}

/// Fixed event-name to schema-key mapping.
pub fn schema_key_for(name: &str) -> Option<&'static str> {
    match classify_event(name) {
        InboundKind::GameStateUpdate => Some("gameStateUpdate"),
        InboundKind::NewTrade => Some("newTrade"),
        InboundKind::SideBetPlaced => Some("currentSideBet"),
        InboundKind::SideBetUpdate => Some("newSideBet"),
        InboundKind::GameStatePlayerUpdate => Some("gameStatePlayerUpdate"),
        InboundKind::PlayerUpdate => Some("playerUpdate"),
        InboundKind::Other => None,
    }
}

/// Result of validating one payload against its canonical schema.
/// Warn-only: a failed validation tags the record, it never drops it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationSummary {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationSummary {
    pub fn ok(schema: &str) -> Self {
        Self {
            ok: true,
            schema: Some(schema.to_string()),
            error: None,
        }
    }

    pub fn failed(schema: &str, error: String) -> Self {
        Self {
            ok: false,
            schema: Some(schema.to_string()),
            error: Some(error),
        }
    }

    pub fn unmapped() -> Self {
        Self {
            ok: true,
            schema: None,
            error: None,
        }
    }
}

/// Provably-fair block carried on snapshots and history entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvablyFair {
    #[serde(default)]
    pub server_seed_hash: Option<String>,
    #[serde(default)]
    pub server_seed: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// One `gameStateUpdate` payload, leniently parsed. Upstream mixes number
/// and string encodings for numerics, so every numeric goes through the
/// tolerant deserializers in [`wire`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    #[serde(default, alias = "id")]
    pub game_id: Option<String>,
    #[serde(default, deserialize_with = "wire::de_opt_bool")]
    pub active: Option<bool>,
    #[serde(default, deserialize_with = "wire::de_opt_bool")]
    pub rugged: Option<bool>,
    #[serde(default, deserialize_with = "wire::de_opt_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "wire::de_opt_i64")]
    pub tick_count: Option<i64>,
    #[serde(default, deserialize_with = "wire::de_opt_i64")]
    pub cooldown_timer: Option<i64>,
    #[serde(default, deserialize_with = "wire::de_opt_bool")]
    pub allow_pre_round_buys: Option<bool>,
    #[serde(default)]
    pub provably_fair: Option<ProvablyFair>,
    #[serde(default)]
    pub game_history: Option<Vec<GameHistoryEntry>>,
}

impl GameSnapshot {
    /// Parses a raw payload; unknown fields are ignored, missing fields
    /// default to `None` so a malformed snapshot still flows warn-only.
    pub fn parse(payload: &serde_json::Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.active.unwrap_or(false)
    }

    pub fn is_rugged(&self) -> bool {
        self.rugged.unwrap_or(false)
    }
}

/// Authoritative record of a finished game as delivered in `gameHistory`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameHistoryEntry {
    #[serde(default, alias = "gameId")]
    pub id: Option<String>,
    #[serde(default)]
    pub prices: Vec<f64>,
    #[serde(default, deserialize_with = "wire::de_opt_f64")]
    pub peak_multiplier: Option<f64>,
    #[serde(default)]
    pub provably_fair: Option<ProvablyFair>,
    #[serde(default, deserialize_with = "wire::de_opt_bool")]
    pub rugged: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        })
    }
}

/// A persisted trade. `event_id` is the caller-provided idempotency key:
/// replaying the same inbound trade can never create a second document.
/// Monetary fields are exact decimals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    #[serde(rename = "eventId", alias = "id")]
    pub event_id: String,
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default, rename = "type")]
    pub trade_type: Option<TradeSide>,
    #[serde(default, deserialize_with = "wire::de_opt_i64")]
    pub tick_index: Option<i64>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub qty: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub coin: Option<String>,
}

/// A side bet placement or resolution. `event` preserves the inbound
/// event name verbatim so downstream consumers can tell the two apart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideBetRecord {
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default, deserialize_with = "wire::de_opt_i64")]
    pub start_tick: Option<i64>,
    #[serde(default, deserialize_with = "wire::de_opt_i64")]
    pub end_tick: Option<i64>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub bet_amount: Option<Decimal>,
    #[serde(default, deserialize_with = "wire::de_opt_f64")]
    pub target_multiplier: Option<f64>,
    #[serde(default, deserialize_with = "wire::de_opt_f64")]
    pub payout_ratio: Option<f64>,
    #[serde(default, deserialize_with = "wire::de_opt_bool")]
    pub won: Option<bool>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub pnl: Option<Decimal>,
    #[serde(default, skip_deserializing)]
    pub event: String,
}

/// A detected 10x single-tick jump. `under_cap` records whether the jump
/// started under the price-100 guard the generator applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GodCandle {
    pub game_id: String,
    pub tick_index: i64,
    pub from_price: f64,
    pub to_price: f64,
    pub ratio: f64,
    pub version: String,
    pub under_cap: bool,
}

/// Source of truth for per-tick prices; unique on `(game_id, tick)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameTick {
    pub game_id: String,
    pub tick: i64,
    pub price: f64,
}

/// Five-tick OHLC aggregate; index `i` covers ticks `[5i, 5i+4]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OhlcIndex {
    pub game_id: String,
    pub index: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub start_tick: i64,
    pub end_tick: i64,
}

/// Data-quality flags maintained per game while ticks stream in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualityFlags {
    pub duplicate_or_out_of_order: bool,
    pub large_gap: bool,
    pub price_non_positive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrngStatus {
    Tracking,
    Complete,
    AwaitingSeed,
    MissingExpected,
    Verified,
    Failed,
}

impl PrngStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tracking => "TRACKING",
            Self::Complete => "COMPLETE",
            Self::AwaitingSeed => "AWAITING_SEED",
            Self::MissingExpected => "MISSING_EXPECTED",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
        }
    }
}

/// Comparison report produced by the offline re-simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub prng_verified: bool,
    pub peak_match: bool,
    pub ticks_match: bool,
    pub array_match: bool,
    pub full_verification: bool,
    pub expected_total_ticks: i64,
    pub actual_total_ticks: i64,
    pub expected_peak: f64,
    pub actual_peak: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_divergence_tick: Option<i64>,
    pub max_abs_diff: f64,
    pub checked_at: DateTime<Utc>,
}

/// Per-game verification tracking row; unique on `game_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrngTrackingRecord {
    pub game_id: String,
    pub status: PrngStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
}

/// The singleton authoritative live snapshot served by `GET /api/live`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<GamePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rugged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_timer: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provably_fair: Option<ProvablyFair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One phase transition in a game's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseTransition {
    pub from: GamePhase,
    pub to: GamePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick: Option<i64>,
    pub at: DateTime<Utc>,
}

/// Partial update applied to a game document. Only `Some` fields are
/// written; `server_seed` is write-once at the store layer.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<GamePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rug_tick: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ticks: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_god_candle: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prng_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityFlags>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_entry: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_transition: Option<PhaseTransition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionEventKind {
    Connected,
    Disconnected,
    Error,
    MaxReconnectsReached,
}

/// Upstream session lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    pub event_type: ConnectionEventKind,
    pub metadata: serde_json::Value,
    pub timestamp_ms: i64,
}

/// A snapshot document as persisted (payload kept alongside the parsed
/// projection so the archive stays replayable).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rugged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_timer: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<GamePhase>,
    pub validation: ValidationSummary,
    pub payload: serde_json::Value,
}

/// Write seam between the pipeline and the document store. The Mongo
/// store implements it for production; tests drive the pipeline against
/// an in-memory fake.
#[async_trait]
pub trait StoreSink: Send + Sync {
    async fn insert_snapshot(&self, snap: SnapshotDoc) -> Result<()>;
    /// Returns `true` when the trade was newly inserted (not a replay).
    async fn upsert_trade(&self, trade: TradeRecord, validation: ValidationSummary)
        -> Result<bool>;
    async fn insert_side_bet(&self, bet: SideBetRecord, validation: ValidationSummary)
        -> Result<()>;
    async fn archive_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        validation: Option<ValidationSummary>,
    ) -> Result<()>;
    async fn insert_connection_event(&self, event: ConnectionEvent) -> Result<()>;
    async fn upsert_game(&self, game_id: &str, update: GameUpdate) -> Result<()>;
    async fn upsert_tick(&self, tick: GameTick) -> Result<()>;
    async fn upsert_ohlc(&self, ohlc: OhlcIndex) -> Result<()>;
    async fn insert_god_candle(&self, candle: GodCandle) -> Result<()>;
    async fn upsert_prng(&self, record: PrngTrackingRecord) -> Result<()>;
    async fn set_live_state(&self, state: LiveState) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("upstream transport: {0}")]
    Transport(String),
    #[error("store unavailable: {0}")]
    Store(String),
    #[error("tracking identity violation: {0}")]
    Identity(String),
    #[error("verification precondition: {0}")]
    Verification(String),
    #[error("configuration: {0}")]
    Config(String),
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_classification_table() {
        assert_eq!(schema_key_for("gameStateUpdate"), Some("gameStateUpdate"));
        assert_eq!(schema_key_for("standard/newTrade"), Some("newTrade"));
        assert_eq!(
            schema_key_for("standard/sideBetPlaced"),
            Some("currentSideBet")
        );
        assert_eq!(schema_key_for("sideBet"), Some("newSideBet"));
        assert_eq!(schema_key_for("standard/sideBetResult"), Some("newSideBet"));
        assert_eq!(schema_key_for("playerUpdate"), Some("playerUpdate"));
        assert_eq!(schema_key_for("rugPool"), None);
        assert_eq!(classify_event("leaderboard"), InboundKind::Other);
    }

    #[test]
    fn snapshot_parses_lenient_numerics() {
        let payload = serde_json::json!({
            "gameId": "g-1",
            "active": true,
            "rugged": false,
            "price": "1.25",
            "tickCount": "17",
            "cooldownTimer": 0,
            "allowPreRoundBuys": false,
            "provablyFair": {"serverSeedHash": "abc", "version": "v3"}
        });
        let snap = GameSnapshot::parse(&payload);
        assert_eq!(snap.game_id.as_deref(), Some("g-1"));
        assert_eq!(snap.price, Some(1.25));
        assert_eq!(snap.tick_count, Some(17));
        assert!(snap.is_active());
        let pf = snap.provably_fair.expect("provably fair");
        assert_eq!(pf.server_seed_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn snapshot_with_null_price_still_parses() {
        let payload = serde_json::json!({"gameId": "g-2", "price": null, "tickCount": 3});
        let snap = GameSnapshot::parse(&payload);
        assert_eq!(snap.price, None);
        assert_eq!(snap.tick_count, Some(3));
    }

    #[test]
    fn trade_accepts_id_alias_for_event_id() {
        let raw = serde_json::json!({
            "id": "T1",
            "gameId": "g-1",
            "playerId": "p-1",
            "type": "buy",
            "tickIndex": 5,
            "amount": 1.5,
            "qty": 3.0,
            "coin": "sol"
        });
        let trade: TradeRecord = serde_json::from_value(raw).expect("trade");
        assert_eq!(trade.event_id, "T1");
        assert_eq!(trade.trade_type, Some(TradeSide::Buy));
        assert_eq!(trade.amount.map(|d| d.to_string()), Some("1.5".to_string()));
    }

    #[test]
    fn phase_serializes_screaming_snake() {
        let v = serde_json::to_value(GamePhase::PreRound).expect("phase");
        assert_eq!(v, serde_json::json!("PRE_ROUND"));
        let back: GamePhase = serde_json::from_value(v).expect("back");
        assert_eq!(back, GamePhase::PreRound);
    }

    #[test]
    fn history_entry_accepts_game_id_alias() {
        let raw = serde_json::json!({
            "gameId": "g-9",
            "prices": [1.0, 1.1],
            "peakMultiplier": 1.1,
            "provablyFair": {"serverSeed": "s", "serverSeedHash": "h"}
        });
        let entry: GameHistoryEntry = serde_json::from_value(raw).expect("entry");
        assert_eq!(entry.id.as_deref(), Some("g-9"));
        assert_eq!(entry.prices.len(), 2);
    }
}
