//! Server-wide proxy metrics.
//!
//! Counters are lock-free atomics; forward latencies keep a bounded rolling
//! window for percentile calculation. Collection is server-wide, not
//! per-keyspace, and cheap enough to leave on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Rolling window of forwarded-request latencies retained for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

pub struct Metrics {
    connections: AtomicU64,
    frames: AtomicU64,
    intercepted: AtomicU64,
    forwarded: AtomicU64,
    overloaded: AtomicU64,
    protocol_errors: AtomicU64,
    forward_latencies_ms: Mutex<VecDeque<u64>>,
    started_at: Instant,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub frames: u64,
    pub intercepted: u64,
    pub forwarded: u64,
    pub overloaded: u64,
    pub protocol_errors: u64,
    pub forward_p50_ms: u64,
    pub forward_p95_ms: u64,
    pub forward_p99_ms: u64,
    pub uptime_secs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            connections: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            intercepted: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            overloaded: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            forward_latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            started_at: Instant::now(),
        }
    }

    pub fn record_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A request answered by the proxy itself, backend untouched.
    pub fn record_intercepted(&self) {
        self.intercepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, latency_ms: u64) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        let mut window = self.forward_latencies_ms.lock().unwrap();
        if window.len() >= LATENCY_WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(latency_ms);
    }

    pub fn record_overloaded(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let window = self.forward_latencies_ms.lock().unwrap();
        let mut sorted: Vec<u64> = window.iter().copied().collect();
        sorted.sort_unstable();

        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            intercepted: self.intercepted.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            forward_p50_ms: percentile(&sorted, 50),
            forward_p95_ms: percentile(&sorted, 95),
            forward_p99_ms: percentile(&sorted, 99),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[index]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod metrics_tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_connection();
        metrics.record_frame();
        metrics.record_frame();
        metrics.record_intercepted();
        metrics.record_overloaded();
        metrics.record_protocol_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections, 1);
        assert_eq!(snap.frames, 2);
        assert_eq!(snap.intercepted, 1);
        assert_eq!(snap.overloaded, 1);
        assert_eq!(snap.protocol_errors, 1);
        assert_eq!(snap.forwarded, 0);
    }

    #[test]
    fn test_forward_percentiles() {
        let metrics = Metrics::new();
        for ms in 1..=100 {
            metrics.record_forwarded(ms);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.forwarded, 100);
        assert_eq!(snap.forward_p50_ms, 51);
        assert_eq!(snap.forward_p95_ms, 96);
        assert_eq!(snap.forward_p99_ms, 100);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = Metrics::new();
        for _ in 0..(LATENCY_WINDOW_SIZE + 500) {
            metrics.record_forwarded(1);
        }
        let window = metrics.forward_latencies_ms.lock().unwrap();
        assert_eq!(window.len(), LATENCY_WINDOW_SIZE);
    }

    #[test]
    fn test_empty_percentiles_are_zero() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.forward_p50_ms, 0);
        assert_eq!(snap.forward_p99_ms, 0);
    }
}
