//! Persistence worker pool. Keeps store latency off the hot path: the
//! router enqueues typed jobs, workers drain them against the sink.
//! Two lanes with different loss policies:
//!
//! - critical lane (games, prng_tracking, live_state): one serial
//!   worker, preserves per-game write order, never drops; the router
//!   waits for queue space instead.
//! - bulk lane: a small pool; under pressure only the raw event archive
//!   is shed, and every shed job is counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use core_types::{
    ConnectionEvent, GameTick, GameUpdate, GodCandle, LiveState, OhlcIndex, PrngTrackingRecord,
    SideBetRecord, SnapshotDoc, StoreSink, TradeRecord, ValidationSummary,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

pub const DEFAULT_QUEUE_CAPACITY: usize = 4_096;
pub const DEFAULT_BULK_WORKERS: usize = 4;

#[derive(Debug, Clone)]
pub enum StoreJob {
    Snapshot(SnapshotDoc),
    Trade {
        trade: TradeRecord,
        validation: ValidationSummary,
    },
    SideBet {
        bet: SideBetRecord,
        validation: ValidationSummary,
    },
    ArchiveEvent {
        event_type: String,
        payload: serde_json::Value,
        validation: Option<ValidationSummary>,
    },
    ConnectionEvent(ConnectionEvent),
    Game {
        game_id: String,
        update: GameUpdate,
    },
    Tick(GameTick),
    Ohlc(OhlcIndex),
    GodCandle(GodCandle),
    Prng(PrngTrackingRecord),
    LiveState(LiveState),
}

impl StoreJob {
    /// Critical jobs carry lifecycle truth and are never dropped.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Game { .. } | Self::Prng(_) | Self::LiveState(_)
        )
    }

    /// The archive is the first thing shed under pressure.
    pub fn is_sheddable(&self) -> bool {
        matches!(self, Self::ArchiveEvent { .. })
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "snapshot",
            Self::Trade { .. } => "trade",
            Self::SideBet { .. } => "side_bet",
            Self::ArchiveEvent { .. } => "archive_event",
            Self::ConnectionEvent(_) => "connection_event",
            Self::Game { .. } => "game",
            Self::Tick(_) => "tick",
            Self::Ohlc(_) => "ohlc",
            Self::GodCandle(_) => "god_candle",
            Self::Prng(_) => "prng",
            Self::LiveState(_) => "live_state",
        }
    }
}

/// Counters surfaced through `/api/metrics`.
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub trades_inserted: AtomicU64,
    pub jobs_dropped: AtomicU64,
    pub store_errors: AtomicU64,
}

impl StoreCounters {
    pub fn trades_inserted(&self) -> u64 {
        self.trades_inserted.load(Ordering::Relaxed)
    }

    pub fn jobs_dropped(&self) -> u64 {
        self.jobs_dropped.load(Ordering::Relaxed)
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }
}

pub struct StorePool {
    critical_tx: mpsc::Sender<StoreJob>,
    bulk_tx: mpsc::Sender<StoreJob>,
    counters: Arc<StoreCounters>,
    workers: Vec<JoinHandle<()>>,
}

impl StorePool {
    pub fn spawn(
        sink: Arc<dyn StoreSink>,
        counters: Arc<StoreCounters>,
        bulk_workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let capacity = queue_capacity.max(16);
        let (critical_tx, mut critical_rx) = mpsc::channel::<StoreJob>(capacity);
        let (bulk_tx, bulk_rx) = mpsc::channel::<StoreJob>(capacity);

        let mut workers = Vec::new();

        // Serial worker: per-game order for lifecycle writes.
        {
            let sink = sink.clone();
            let counters = counters.clone();
            workers.push(tokio::spawn(async move {
                while let Some(job) = critical_rx.recv().await {
                    apply(&*sink, &counters, job).await;
                }
            }));
        }

        let bulk_rx = Arc::new(Mutex::new(bulk_rx));
        for _ in 0..bulk_workers.max(1) {
            let sink = sink.clone();
            let counters = counters.clone();
            let bulk_rx = bulk_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = bulk_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else { break };
                    apply(&*sink, &counters, job).await;
                }
            }));
        }

        Self {
            critical_tx,
            bulk_tx,
            counters,
            workers,
        }
    }

    /// Enqueues one job under the lane's loss policy. Critical jobs wait
    /// for space; sheddable jobs are dropped (and counted) when the
    /// bulk queue is full; everything else waits.
    pub async fn submit(&self, job: StoreJob) {
        if job.is_critical() {
            if self.critical_tx.send(job).await.is_err() {
                tracing::error!("critical store lane closed");
            }
            return;
        }

        match self.bulk_tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                if job.is_sheddable() {
                    self.counters.jobs_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("rugs_store_jobs_dropped_total").increment(1);
                    tracing::warn!(kind = job.kind(), "store queue full; job shed");
                } else if self.bulk_tx.send(job).await.is_err() {
                    tracing::error!("bulk store lane closed");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("bulk store lane closed");
            }
        }
    }

    /// Closes the lanes and waits for the workers to drain, up to
    /// `deadline`.
    pub async fn shutdown(self, deadline: Duration) {
        let Self {
            critical_tx,
            bulk_tx,
            workers,
            ..
        } = self;
        drop(critical_tx);
        drop(bulk_tx);
        let join_all = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            tracing::warn!("store pool drain exceeded deadline");
        }
    }
}

async fn apply(sink: &dyn StoreSink, counters: &StoreCounters, job: StoreJob) {
    let kind = job.kind();
    let result = match job {
        StoreJob::Snapshot(snap) => sink.insert_snapshot(snap).await,
        StoreJob::Trade { trade, validation } => {
            match sink.upsert_trade(trade, validation).await {
                Ok(inserted) => {
                    if inserted {
                        counters.trades_inserted.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("rugs_trades_total").increment(1);
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        StoreJob::SideBet { bet, validation } => sink.insert_side_bet(bet, validation).await,
        StoreJob::ArchiveEvent {
            event_type,
            payload,
            validation,
        } => sink.archive_event(&event_type, payload, validation).await,
        StoreJob::ConnectionEvent(event) => sink.insert_connection_event(event).await,
        StoreJob::Game { game_id, update } => sink.upsert_game(&game_id, update).await,
        StoreJob::Tick(tick) => sink.upsert_tick(tick).await,
        StoreJob::Ohlc(ohlc) => sink.upsert_ohlc(ohlc).await,
        StoreJob::GodCandle(candle) => sink.insert_god_candle(candle).await,
        StoreJob::Prng(record) => sink.upsert_prng(record).await,
        StoreJob::LiveState(state) => sink.set_live_state(state).await,
    };

    if let Err(err) = result {
        counters.store_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(?err, kind, "store write failed");
    }
}
