//! Read-only upstream consumer. Maintains exactly one socket.io (EIO4
//! over websocket) session against the game feed, republishing every
//! inbound event onto a bounded ring. The upstream blocks clients that
//! send application frames, so the only writes on the wire are the
//! protocol handshake and ping replies.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use core_types::{ConnectionEvent, ConnectionEventKind, RawFrame, ServiceError, StoreSink};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

mod protocol;

pub use protocol::{socket_io_ws_url, PacketKind};

/// WebSocket connection timeout.
const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Read timeout; the upstream pings every ~25s, so a minute of silence
/// means the session is dead.
const WS_READ_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_UPSTREAM_URL: &str = "https://backend.rugs.fun?frontend-version=1.0";
pub const DEFAULT_FRAME_CAPACITY: usize = 16_384;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub upstream_url: String,
    /// First reconnect delay.
    pub backoff_floor: Duration,
    /// Reconnect delay cap.
    pub backoff_cap: Duration,
    /// 0 = retry forever.
    pub max_reconnects: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5),
            max_reconnects: 0,
        }
    }
}

/// Bounded ring the feed publishes raw frames onto. Backed by a
/// broadcast channel: when a consumer falls behind, the oldest frames
/// are overwritten and the consumer learns how many it lost.
#[derive(Clone)]
pub struct FrameBus {
    tx: broadcast::Sender<RawFrame>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn publish(&self, frame: RawFrame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RawFrame> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Shared session state read by `/api/connection` and `/api/readiness`.
#[derive(Default)]
pub struct FeedStatus {
    connected: AtomicBool,
    connected_at_ms: AtomicI64,
    last_event_at_ms: AtomicI64,
    reconnect_attempts: AtomicU64,
    socket_id: parking_lot::RwLock<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_connected_ms: Option<i64>,
    pub reconnect_attempts: u64,
}

impl FeedStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn socket_id(&self) -> Option<String> {
        self.socket_id.read().clone()
    }

    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_event_at_ms.load(Ordering::Relaxed);
        if ms == 0 {
            None
        } else {
            DateTime::<Utc>::from_timestamp_millis(ms)
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let connected_at = self.connected_at_ms.load(Ordering::Relaxed);
        let since = if self.is_connected() && connected_at > 0 {
            Some(Utc::now().timestamp_millis() - connected_at)
        } else {
            None
        };
        ConnectionSnapshot {
            connected: self.is_connected(),
            socket_id: self.socket_id(),
            last_event_at: self.last_event_at(),
            since_connected_ms: since,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    fn mark_connected(&self, socket_id: Option<String>) {
        self.connected.store(true, Ordering::Relaxed);
        self.connected_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        *self.socket_id.write() = socket_id;
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_at_ms.store(0, Ordering::Relaxed);
    }

    fn mark_event(&self) {
        self.last_event_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

pub struct RugsFeed {
    config: FeedConfig,
    status: Arc<FeedStatus>,
    bus: FrameBus,
    store: Arc<dyn StoreSink>,
}

impl RugsFeed {
    pub fn new(
        config: FeedConfig,
        status: Arc<FeedStatus>,
        bus: FrameBus,
        store: Arc<dyn StoreSink>,
    ) -> Self {
        Self {
            config,
            status,
            bus,
            store,
        }
    }

    /// Supervisor loop: one session at a time, jittered exponential
    /// backoff between attempts, stop on shutdown or attempt cap.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut delay = self.config.backoff_floor;
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut connected_once = false;
            match self.run_session(&mut shutdown, &mut connected_once).await {
                Ok(()) => {
                    // Clean close (shutdown requested mid-session).
                    self.status.mark_disconnected();
                    return;
                }
                Err(err) => {
                    attempts = attempts.saturating_add(1);
                    self.status
                        .reconnect_attempts
                        .fetch_add(1, Ordering::Relaxed);
                    self.status.mark_disconnected();
                    tracing::warn!(?err, attempt = attempts, "upstream session ended");
                    self.log_connection(
                        ConnectionEventKind::Error,
                        serde_json::json!({"attempt": attempts, "error": err.to_string()}),
                    )
                    .await;

                    if self.config.max_reconnects > 0 && attempts >= self.config.max_reconnects {
                        tracing::error!(attempts, "max reconnect attempts reached; feed stopped");
                        self.log_connection(
                            ConnectionEventKind::MaxReconnectsReached,
                            serde_json::json!({"attempts": attempts}),
                        )
                        .await;
                        return;
                    }
                }
            }

            if connected_once {
                delay = self.config.backoff_floor;
            }
            let wait = jittered(delay);
            delay = (delay * 2).min(self.config.backoff_cap);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One full session: connect, EIO4 handshake, then the read loop.
    /// Returns `Ok(())` only for a shutdown-initiated close.
    async fn run_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        connected_once: &mut bool,
    ) -> Result<()> {
        let ws_url = socket_io_ws_url(&self.config.upstream_url)?;
        tracing::info!(url = %ws_url, "connecting upstream (read-only)");

        let (mut ws, _) = timeout(WS_CONNECT_TIMEOUT, connect_async(&ws_url))
            .await
            .context("connect upstream timeout")?
            .context("connect upstream")?;

        let mut socket_id: Option<String> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = ws.close(None).await;
                        self.log_connection(
                            ConnectionEventKind::Disconnected,
                            serde_json::json!({"reason": "shutdown"}),
                        )
                        .await;
                        return Ok(());
                    }
                }
                msg = timeout(WS_READ_TIMEOUT, ws.next()) => {
                    let msg = match msg {
                        Ok(m) => m,
                        Err(_) => {
                            self.log_connection(
                                ConnectionEventKind::Disconnected,
                                serde_json::json!({"reason": "read timeout"}),
                            )
                            .await;
                            return Err(ServiceError::Transport("read timeout".to_string()).into());
                        }
                    };
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        None => {
                            self.log_connection(
                                ConnectionEventKind::Disconnected,
                                serde_json::json!({"reason": "stream ended"}),
                            )
                            .await;
                            return Err(ServiceError::Transport("stream ended".to_string()).into());
                        }
                        Some(Err(e)) => {
                            self.log_connection(
                                ConnectionEventKind::Disconnected,
                                serde_json::json!({"reason": e.to_string()}),
                            )
                            .await;
                            return Err(ServiceError::Transport(format!("read error: {e}")).into());
                        }
                    };

                    let text = match msg {
                        Message::Text(t) => t.to_string(),
                        Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                        Message::Ping(v) => {
                            let _ = ws.send(Message::Pong(v)).await;
                            continue;
                        }
                        Message::Pong(_) => continue,
                        Message::Close(frame) => {
                            self.log_connection(
                                ConnectionEventKind::Disconnected,
                                serde_json::json!({
                                    "reason": frame
                                        .map(|f| f.reason.to_string())
                                        .unwrap_or_else(|| "close".to_string())
                                }),
                            )
                            .await;
                            return Err(ServiceError::Transport("closed by upstream".to_string()).into());
                        }
                        Message::Frame(_) => continue,
                    };

                    match protocol::parse_packet(&text) {
                        PacketKind::Open(handshake) => {
                            socket_id = handshake
                                .get("sid")
                                .and_then(|v| v.as_str())
                                .map(str::to_string);
                            // Join the default namespace; part of the
                            // transport handshake, not an app message.
                            ws.send(Message::Text("40".to_string().into()))
                                .await
                                .context("send namespace connect")?;
                        }
                        PacketKind::ConnectAck(ack) => {
                            let sid = ack
                                .get("sid")
                                .and_then(|v| v.as_str())
                                .map(str::to_string)
                                .or(socket_id.clone());
                            self.status.mark_connected(sid.clone());
                            *connected_once = true;
                            tracing::info!(socket_id = sid.as_deref().unwrap_or(""), "upstream connected");
                            self.log_connection(
                                ConnectionEventKind::Connected,
                                serde_json::json!({"socketId": sid}),
                            )
                            .await;
                        }
                        PacketKind::Ping => {
                            ws.send(Message::Text("3".to_string().into()))
                                .await
                                .context("send protocol pong")?;
                        }
                        PacketKind::Event { name, payload } => {
                            self.status.mark_event();
                            self.bus.publish(RawFrame {
                                event: name,
                                payload,
                                received_at: Utc::now(),
                            });
                        }
                        PacketKind::Disconnect => {
                            self.log_connection(
                                ConnectionEventKind::Disconnected,
                                serde_json::json!({"reason": "server disconnect"}),
                            )
                            .await;
                            return Err(ServiceError::Transport("server disconnect".to_string()).into());
                        }
                        PacketKind::Other => {}
                    }
                }
            }
        }
    }

    async fn log_connection(&self, kind: ConnectionEventKind, metadata: serde_json::Value) {
        let event = ConnectionEvent {
            socket_id: self.status.socket_id(),
            event_type: kind,
            metadata,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        if let Err(err) = self.store.insert_connection_event(event).await {
            tracing::warn!(?err, "connection event write failed");
        }
    }
}

fn jittered(base: Duration) -> Duration {
    use rand::Rng;
    let jitter_ms = rand::rng().random_range(0..=300);
    base + Duration::from_millis(jitter_ms)
}
