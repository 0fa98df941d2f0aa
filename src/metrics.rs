use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

/// Process-wide relay counters. Cheap to bump from any task; snapshots
/// feed `/api/metrics`.
#[derive(Debug)]
pub struct RelayMetrics {
    pub sessions_started_total: AtomicU64,
    pub sessions_active: AtomicU64,
    pub packets_forwarded_total: AtomicU64,
    pub packets_dropped_total: AtomicU64,
    pub bytes_out_total: AtomicU64,
    pub output_connects_total: AtomicU64,
    pub output_errors_total: AtomicU64,
    start_time: Instant,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub sessions_started_total: u64,
    pub sessions_active: u64,
    pub packets_forwarded_total: u64,
    pub packets_dropped_total: u64,
    pub bytes_out_total: u64,
    pub output_connects_total: u64,
    pub output_errors_total: u64,
}

impl RelayMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions_started_total: AtomicU64::new(0),
            sessions_active: AtomicU64::new(0),
            packets_forwarded_total: AtomicU64::new(0),
            packets_dropped_total: AtomicU64::new(0),
            bytes_out_total: AtomicU64::new(0),
            output_connects_total: AtomicU64::new(0),
            output_errors_total: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn session_started(&self) {
        self.sessions_started_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_finished(&self) {
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn forwarded(&self, count: u64) {
        self.packets_forwarded_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn dropped(&self, count: u64) {
        self.packets_dropped_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn wrote_bytes(&self, count: u64) {
        self.bytes_out_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn output_connected(&self) {
        self.output_connects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn output_error(&self) {
        self.output_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            sessions_started_total: self.sessions_started_total.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            packets_forwarded_total: self.packets_forwarded_total.load(Ordering::Relaxed),
            packets_dropped_total: self.packets_dropped_total.load(Ordering::Relaxed),
            bytes_out_total: self.bytes_out_total.load(Ordering::Relaxed),
            output_connects_total: self.output_connects_total.load(Ordering::Relaxed),
            output_errors_total: self.output_errors_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_roll_up_into_snapshot() {
        let metrics = RelayMetrics::new();
        metrics.session_started();
        metrics.forwarded(10);
        metrics.dropped(2);
        metrics.wrote_bytes(1024);
        metrics.output_connected();
        metrics.output_error();
        metrics.session_finished();

        let snap = metrics.snapshot();
        assert_eq!(snap.sessions_started_total, 1);
        assert_eq!(snap.sessions_active, 0);
        assert_eq!(snap.packets_forwarded_total, 10);
        assert_eq!(snap.packets_dropped_total, 2);
        assert_eq!(snap.bytes_out_total, 1024);
        assert_eq!(snap.output_connects_total, 1);
        assert_eq!(snap.output_errors_total, 1);
    }

    #[test]
    fn active_count_does_not_underflow() {
        let metrics = RelayMetrics::new();
        metrics.session_finished();
        assert_eq!(metrics.snapshot().sessions_active, 0);
    }
}
