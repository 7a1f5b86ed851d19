//! REST surface under `/api`, plus the Prometheus render at `/metrics`
//! and the downstream stream upgrade at `/api/ws/stream`. Read-only
//! except for the verification trigger and the status-check probe.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use stream_hub::StreamHub;

use crate::state::AppState;
use crate::verify::evaluate_verification;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .nest("/api", api_routes())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .route("/metrics", get(api_metrics))
        .route("/connection", get(connection))
        .route("/live", get(live))
        .route("/snapshots", get(snapshots))
        .route("/games", get(games))
        .route("/games/current", get(current_game))
        .route("/games/:id", get(game))
        .route("/games/:id/quality", get(game_quality))
        .route("/games/:id/verification", get(game_verification))
        .route("/ohlc", get(ohlc))
        .route("/god-candles", get(god_candles))
        .route("/prng/tracking", get(prng_tracking))
        .route("/prng/verify/:id", post(prng_verify))
        .route("/schemas", get(schemas))
        .route("/status", post(create_status).get(list_status))
        .route("/ws/stream", get(ws_stream))
}

/// Store failures surface as 500 with a terse body; details go to the
/// log, and the pipeline keeps running regardless.
struct ApiError {
    status: StatusCode,
    err: anyhow::Error,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            tracing::error!(err = %self.err, "api request failed");
        }
        (
            self.status,
            Json(serde_json::json!({"error": self.err.to_string()})),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OhlcQuery {
    #[serde(rename = "gameId")]
    game_id: String,
    window: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GameIdQuery {
    #[serde(rename = "gameId")]
    game_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusCheckBody {
    #[serde(rename = "clientName")]
    client_name: String,
}

fn clamp(limit: Option<i64>, default: i64, max: i64) -> i64 {
    limit.unwrap_or(default).clamp(1, max)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({"message": "Hello World"}))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "time": Utc::now().to_rfc3339()}))
}

async fn readiness(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ping = state.store.ping().await;
    let db_ok = ping.is_ok();
    Json(serde_json::json!({
        "dbOk": db_ok,
        "upstreamConnected": state.feed_status.is_connected(),
        "time": Utc::now().to_rfc3339(),
        "dbPingMs": ping.ok(),
    }))
}

async fn api_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let (rate_1m, rate_5m) = state.metrics.rates();
    let db_ping_ms = state.store.ping().await.ok();
    let feed = state.feed_status.snapshot();
    Json(serde_json::json!({
        "serviceUptimeSec": state.metrics.uptime_secs(),
        "currentSocketConnected": feed.connected,
        "socketId": feed.socket_id,
        "lastEventAt": feed.last_event_at.map(|t| t.to_rfc3339()),
        "totalMessagesProcessed": state.metrics.messages_processed(),
        "totalTrades": state.store_counters.trades_inserted(),
        "totalGamesTracked": state.metrics.games_tracked(),
        "messagesPerSecond1m": rate_1m,
        "messagesPerSecond5m": rate_5m,
        "wsSubscribers": state.hub.subscriber_count(),
        "wsSlowClientDrops": state.hub.slow_client_drops(),
        "upstreamDropped": state.metrics.upstream_dropped(),
        "storeJobsDropped": state.store_counters.jobs_dropped(),
        "storeErrors": state.store_counters.store_errors(),
        "dbPingMs": db_ping_ms,
        "errorCounters": state.metrics.error_counters(),
        "schemaValidation": state.registry.counters(),
    }))
}

async fn connection(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.feed_status.snapshot()).unwrap_or_default())
}

async fn live(State(state): State<AppState>) -> ApiResult {
    let live = state.store.live_state().await?;
    Ok(Json(live.unwrap_or_else(|| serde_json::json!({}))))
}

async fn snapshots(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let items = state
        .store
        .recent_snapshots(clamp(q.limit, 50, 200))
        .await?;
    Ok(Json(serde_json::json!({"items": items})))
}

async fn games(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let items = state.store.recent_games(clamp(q.limit, 50, 200)).await?;
    Ok(Json(serde_json::json!({"items": items})))
}

async fn current_game(State(state): State<AppState>) -> ApiResult {
    match state.store.current_game().await? {
        Some(game) => Ok(Json(game)),
        None => Err(not_found("no games tracked yet")),
    }
}

async fn game(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.store.game(&id).await? {
        Some(game) => Ok(Json(game)),
        None => Err(not_found("game not found")),
    }
}

async fn game_quality(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.store.game_quality(&id).await? {
        Some(quality) => Ok(Json(quality)),
        None => Err(not_found("game not found")),
    }
}

async fn game_verification(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.store.game_verification(&id).await? {
        Some(verification) => Ok(Json(verification)),
        None => Err(not_found("no verification record")),
    }
}

async fn ohlc(State(state): State<AppState>, Query(q): Query<OhlcQuery>) -> ApiResult {
    let window = q.window.unwrap_or(game_tracker::OHLC_WINDOW);
    if window != game_tracker::OHLC_WINDOW {
        return Err(bad_request("only the 5-tick window is materialized"));
    }
    let items = state
        .store
        .ohlc(&q.game_id, clamp(q.limit, 200, 1_000))
        .await?;
    Ok(Json(serde_json::json!({
        "gameId": q.game_id,
        "window": window,
        "items": items,
    })))
}

async fn god_candles(State(state): State<AppState>, Query(q): Query<GameIdQuery>) -> ApiResult {
    let items = state.store.god_candles(q.game_id.as_deref()).await?;
    Ok(Json(serde_json::json!({"items": items})))
}

async fn prng_tracking(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let items = state.store.prng_tracking(clamp(q.limit, 50, 200)).await?;
    Ok(Json(serde_json::json!({"items": items})))
}

/// The only mutating endpoint: re-runs the deterministic verification
/// for one game and persists the outcome on both the game row and its
/// tracking row. Idempotent for a fixed seed and trajectory.
async fn prng_verify(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let _permit = state
        .verify_limit
        .acquire()
        .await
        .map_err(|_| ApiError::from(anyhow::anyhow!("verifier pool closed")))?;

    let Some(source) = state.store.verification_source(&id).await? else {
        return Err(not_found("game not found"));
    };

    let (status, report) = evaluate_verification(&source);
    state
        .store
        .record_verification(&id, status, report.as_ref())
        .await?;
    tracing::info!(game_id = %id, status = status.as_str(), "verification recorded");

    Ok(Json(serde_json::json!({
        "gameId": id,
        "status": status,
        "verification": report,
    })))
}

async fn schemas(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"schemas": state.registry.list()}))
}

async fn create_status(
    State(state): State<AppState>,
    Json(body): Json<StatusCheckBody>,
) -> ApiResult {
    let created = state.store.insert_status_check(&body.client_name).await?;
    Ok(Json(created))
}

async fn list_status(State(state): State<AppState>) -> ApiResult {
    let items = state.store.status_checks(100).await?;
    Ok(Json(serde_json::json!({"items": items})))
}

async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

async fn ws_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| run_stream_connection(socket, hub))
}

/// Writer loop for one subscriber. Inbound application data is ignored
/// by contract; only close (or a dead socket) ends the session. A
/// `None` from the hub receiver means the subscriber was evicted as a
/// slow consumer.
async fn run_stream_connection(socket: WebSocket, hub: Arc<StreamHub>) {
    let (id, mut frames) = hub.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {} // subscribers do not send application data
            },
        }
    }

    hub.unsubscribe(id);
}

fn not_found(msg: &str) -> ApiError {
    ApiError {
        status: StatusCode::NOT_FOUND,
        err: anyhow::anyhow!("{msg}"),
    }
}

fn bad_request(msg: &str) -> ApiError {
    ApiError {
        status: StatusCode::BAD_REQUEST,
        err: anyhow::anyhow!("{msg}"),
    }
}
