//! The router task: drains the raw-frame ring in arrival order and runs
//! each frame through validate → normalize → persist → track →
//! broadcast. A single task keeps per-game snapshot processing ordered;
//! store latency stays off this path because writes leave as pool jobs.

use std::sync::Arc;

use core_types::outbound::{encode, GameStateFrame, SideBetFrame, TradeFrame, SCHEMA_VERSION};
use core_types::{
    classify_event, schema_key_for, GameSnapshot, InboundKind, PrngStatus, RawFrame,
    SideBetRecord, SnapshotDoc, TradeRecord, ValidationSummary,
};
use game_tracker::{GameTracker, TrackerEffect};
use schema_registry::SchemaRegistry;
use storage_mongo::{StoreJob, StorePool};
use stream_hub::StreamHub;
use tokio::sync::{broadcast, watch};

use crate::metrics::ServiceMetrics;

pub struct Pipeline {
    pub registry: Arc<SchemaRegistry>,
    pub hub: Arc<StreamHub>,
    pub pool: Arc<StorePool>,
    pub metrics: Arc<ServiceMetrics>,
    pub tracker: GameTracker,
}

impl Pipeline {
    pub async fn run(
        mut self,
        mut frames: broadcast::Receiver<RawFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("router stopping");
                        return;
                    }
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => self.dispatch(frame).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.metrics.record_upstream_dropped(n);
                        tracing::warn!(dropped = n, "raw frame ring overflow; oldest dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("frame ring closed; router stopping");
                        return;
                    }
                },
            }
        }
    }

    /// One frame through the whole pipeline. Validation is warn-only
    /// everywhere: outcomes tag records and move counters, nothing is
    /// dropped on a schema failure.
    pub async fn dispatch(&mut self, frame: RawFrame) {
        self.metrics.record_message();

        let validation = match schema_key_for(&frame.event) {
            Some(key) => self.registry.validate(key, &frame.payload),
            None => ValidationSummary::unmapped(),
        };
        if !validation.ok {
            tracing::warn!(
                event = %frame.event,
                error = validation.error.as_deref().unwrap_or(""),
                "schema validation failed; continuing warn-only"
            );
        }

        match classify_event(&frame.event) {
            InboundKind::GameStateUpdate => self.on_game_state(frame, validation).await,
            InboundKind::NewTrade => self.on_trade(frame, validation).await,
            InboundKind::SideBetPlaced | InboundKind::SideBetUpdate => {
                self.on_side_bet(frame, validation).await
            }
            InboundKind::GameStatePlayerUpdate | InboundKind::PlayerUpdate => {
                self.archive(frame, Some(validation)).await
            }
            InboundKind::Other => self.archive(frame, None).await,
        }
    }

    async fn on_game_state(&mut self, frame: RawFrame, validation: ValidationSummary) {
        let snap = GameSnapshot::parse(&frame.payload);
        let effects = self.tracker.on_snapshot(&snap);
        self.metrics.set_games_tracked(self.tracker.games_tracked());

        self.pool
            .submit(StoreJob::Snapshot(SnapshotDoc {
                game_id: snap.game_id.clone(),
                tick_count: snap.tick_count,
                active: snap.active,
                rugged: snap.rugged,
                price: snap.price,
                cooldown_timer: snap.cooldown_timer,
                phase: Some(self.tracker.phase()),
                validation: validation.clone(),
                payload: frame.payload.clone(),
            }))
            .await;

        self.hub.publish(&encode(&GameStateFrame {
            schema: SCHEMA_VERSION,
            kind: "game_state_update",
            game_id: snap.game_id.clone(),
            tick: snap.tick_count,
            price: snap.price,
            phase: Some(self.tracker.phase()),
            validation,
            ts: frame.received_at,
        }));

        self.apply_effects(effects).await;
    }

    async fn on_trade(&mut self, frame: RawFrame, validation: ValidationSummary) {
        let trade: Result<TradeRecord, _> = serde_json::from_value(frame.payload.clone());
        match trade {
            Ok(trade) => {
                let outbound = TradeFrame {
                    schema: SCHEMA_VERSION,
                    kind: "trade",
                    game_id: trade.game_id.clone(),
                    player_id: trade.player_id.clone(),
                    trade_type: trade.trade_type.map(|t| t.to_string()),
                    tick_index: trade.tick_index,
                    amount: trade.amount,
                    qty: trade.qty,
                    price: trade.price,
                    validation: validation.clone(),
                    ts: frame.received_at,
                };
                self.pool
                    .submit(StoreJob::Trade { trade, validation })
                    .await;
                self.hub.publish(&encode(&outbound));
            }
            Err(err) => {
                // No usable idempotency key; keep the raw payload.
                self.metrics.record_error("trade_parse");
                tracing::warn!(?err, "trade payload without event id; archived raw");
                self.archive(frame, Some(validation)).await;
            }
        }
    }

    async fn on_side_bet(&mut self, frame: RawFrame, validation: ValidationSummary) {
        let mut bet: SideBetRecord =
            serde_json::from_value(frame.payload.clone()).unwrap_or_default();
        bet.event = frame.event.clone();

        let outbound = SideBetFrame {
            schema: SCHEMA_VERSION,
            kind: "side_bet",
            event: frame.event.clone(),
            game_id: bet.game_id.clone(),
            player_id: bet.player_id.clone(),
            validation: validation.clone(),
            ts: frame.received_at,
        };
        self.pool.submit(StoreJob::SideBet { bet, validation }).await;
        self.hub.publish(&encode(&outbound));
    }

    async fn archive(&mut self, frame: RawFrame, validation: Option<ValidationSummary>) {
        self.pool
            .submit(StoreJob::ArchiveEvent {
                event_type: frame.event,
                payload: frame.payload,
                validation,
            })
            .await;
    }

    async fn apply_effects(&mut self, effects: Vec<TrackerEffect>) {
        for effect in effects {
            match effect {
                TrackerEffect::UpsertGame { game_id, update } => {
                    self.pool.submit(StoreJob::Game { game_id, update }).await;
                }
                TrackerEffect::UpsertTick(tick) => {
                    self.pool.submit(StoreJob::Tick(tick)).await;
                }
                TrackerEffect::UpsertOhlc(ohlc) => {
                    self.pool.submit(StoreJob::Ohlc(ohlc)).await;
                }
                TrackerEffect::InsertGodCandle(candle) => {
                    self.pool.submit(StoreJob::GodCandle(candle)).await;
                }
                TrackerEffect::UpsertPrng(record) => {
                    if record.status == PrngStatus::MissingExpected {
                        self.metrics.record_error("identity");
                    }
                    self.pool.submit(StoreJob::Prng(record)).await;
                }
                TrackerEffect::SetLiveState(state) => {
                    self.pool.submit(StoreJob::LiveState(state)).await;
                }
                TrackerEffect::BroadcastGodCandle(frame) => {
                    self.hub.publish(&encode(&frame));
                }
                TrackerEffect::BroadcastRug(frame) => {
                    self.hub.publish(&encode(&frame));
                }
            }
        }
    }
}
