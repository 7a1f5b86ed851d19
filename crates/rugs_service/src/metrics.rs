//! Operational counters behind `GET /api/metrics`. All counters are
//! atomic and monotonic for the lifetime of the session; initialized at
//! startup and never reset.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;

/// Per-second buckets backing the 1m / 5m message rates.
#[derive(Debug, Default)]
struct RateWindow {
    buckets: VecDeque<(i64, u64)>,
}

impl RateWindow {
    const RETENTION_SECS: i64 = 300;

    fn record(&mut self, now_sec: i64) {
        match self.buckets.back_mut() {
            Some((sec, count)) if *sec == now_sec => *count += 1,
            _ => self.buckets.push_back((now_sec, 1)),
        }
        while self
            .buckets
            .front()
            .map(|(sec, _)| now_sec - *sec >= Self::RETENTION_SECS)
            .unwrap_or(false)
        {
            self.buckets.pop_front();
        }
    }

    fn rate(&self, now_sec: i64, window_secs: i64) -> f64 {
        let total: u64 = self
            .buckets
            .iter()
            .filter(|(sec, _)| now_sec - *sec < window_secs)
            .map(|(_, count)| *count)
            .sum();
        total as f64 / window_secs as f64
    }
}

pub struct ServiceMetrics {
    started: Instant,
    messages_processed: AtomicU64,
    games_tracked: AtomicU64,
    upstream_dropped: AtomicU64,
    rate: Mutex<RateWindow>,
    error_counters: Mutex<HashMap<String, u64>>,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            messages_processed: AtomicU64::new(0),
            games_tracked: AtomicU64::new(0),
            upstream_dropped: AtomicU64::new(0),
            rate: Mutex::new(RateWindow::default()),
            error_counters: Mutex::new(HashMap::new()),
        }
    }
}

impl ServiceMetrics {
    pub fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rugs_events_total").increment(1);
        self.rate.lock().record(Utc::now().timestamp());
    }

    pub fn record_upstream_dropped(&self, n: u64) {
        self.upstream_dropped.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("rugs_upstream_dropped_total").increment(n);
    }

    pub fn record_error(&self, kind: &str) {
        *self
            .error_counters
            .lock()
            .entry(kind.to_string())
            .or_insert(0) += 1;
    }

    pub fn set_games_tracked(&self, n: u64) {
        self.games_tracked.store(n, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    pub fn games_tracked(&self) -> u64 {
        self.games_tracked.load(Ordering::Relaxed)
    }

    pub fn upstream_dropped(&self) -> u64 {
        self.upstream_dropped.load(Ordering::Relaxed)
    }

    pub fn rates(&self) -> (f64, f64) {
        let now = Utc::now().timestamp();
        let window = self.rate.lock();
        (window.rate(now, 60), window.rate(now, 300))
    }

    pub fn error_counters(&self) -> HashMap<String, u64> {
        self.error_counters.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let m = ServiceMetrics::default();
        m.record_message();
        m.record_message();
        m.record_upstream_dropped(3);
        assert_eq!(m.messages_processed(), 2);
        assert_eq!(m.upstream_dropped(), 3);
    }

    #[test]
    fn rate_windows_count_recent_messages() {
        let mut window = RateWindow::default();
        let now = 1_000_000i64;
        for _ in 0..120 {
            window.record(now);
        }
        for _ in 0..30 {
            window.record(now - 90);
        }
        // The 1m window only sees the current-second burst; the 5m
        // window also sees the 90s-old one.
        assert!((window.rate(now, 60) - 2.0).abs() < 1e-9);
        assert!((window.rate(now, 300) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn old_buckets_are_evicted() {
        let mut window = RateWindow::default();
        window.record(0);
        window.record(1_000);
        assert_eq!(window.buckets.len(), 1);
    }

    #[test]
    fn error_counters_accumulate_by_kind() {
        let m = ServiceMetrics::default();
        m.record_error("identity");
        m.record_error("identity");
        m.record_error("store");
        let counters = m.error_counters();
        assert_eq!(counters["identity"], 2);
        assert_eq!(counters["store"], 1);
    }
}
