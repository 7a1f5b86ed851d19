//! Downstream fan-out hub. Each subscriber owns a bounded queue; a
//! publish never waits on a slow reader. A subscriber whose queue is full
//! at publish time is evicted and its channel closed, which protects the
//! pipeline's throughput for everyone else.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use core_types::outbound::{encode, HeartbeatFrame, HelloFrame};
use dashmap::DashMap;
use tokio::sync::mpsc;

pub const DEFAULT_BUFFER_DEPTH: usize = 64;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

struct Subscriber {
    tx: mpsc::Sender<String>,
}

pub struct StreamHub {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
    slow_drops: AtomicU64,
    buffer_depth: usize,
}

impl StreamHub {
    pub fn new(buffer_depth: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            slow_drops: AtomicU64::new(0),
            buffer_depth: buffer_depth.max(2),
        }
    }

    /// Registers a subscriber and queues the `hello` frame as its first
    /// message. The receiver closing (client gone) is cleaned up lazily
    /// on the next publish.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.buffer_depth);
        let _ = tx.try_send(encode(&HelloFrame::now()));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, Subscriber { tx });
        tracing::debug!(subscriber = id, "stream subscriber joined");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            tracing::debug!(subscriber = id, "stream subscriber left");
        }
    }

    /// Fans one encoded frame out to every subscriber. Returns the number
    /// of queues the frame reached. Full queue ⇒ slow consumer ⇒ evict.
    pub fn publish(&self, frame: &str) -> usize {
        let mut delivered = 0usize;
        let mut slow = Vec::new();
        let mut gone = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().tx.try_send(frame.to_string()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => slow.push(*entry.key()),
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*entry.key()),
            }
        }

        for id in slow {
            self.subscribers.remove(&id);
            self.slow_drops.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rugs_ws_slow_client_drops_total").increment(1);
            tracing::warn!(subscriber = id, "evicted slow stream subscriber");
        }
        for id in gone {
            self.subscribers.remove(&id);
        }

        delivered
    }

    /// Queues a heartbeat for every subscriber; a queue too full to take
    /// a heartbeat gets the same slow-consumer treatment as data frames.
    pub fn send_heartbeats(&self) {
        self.publish(&encode(&HeartbeatFrame::now()));
    }

    /// Drops every subscriber sender; connection tasks observe the
    /// closed channel, flush what is queued, and close their sockets.
    pub fn close_all(&self) {
        self.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn slow_client_drops(&self) -> u64 {
        self.slow_drops.load(Ordering::Relaxed)
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_DEPTH)
    }
}
