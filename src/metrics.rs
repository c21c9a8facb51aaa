//! Engine Metrics
//!
//! Lifetime counters for the resource manager. Counters are atomics so any
//! component may bump them without coordination; `snapshot` produces a plain
//! serializable struct.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Engine lifetime counters
#[derive(Debug, Default)]
pub struct Metrics {
    requested: AtomicU64,
    download_began: AtomicU64,
    download_completed: AtomicU64,
    priority_increased: AtomicU64,
    priority_decreased: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    bytes_transferred: AtomicU64,
    download_speed_bytes: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_requested(&self, count: u64) {
        self.requested.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_download_began(&self) {
        self.download_began.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_download_completed(&self) {
        self.download_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_priority_increased(&self, count: u64) {
        self.priority_increased.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_priority_decreased(&self, count: u64) {
        self.priority_decreased.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Last observed aggregate transfer speed in bytes/sec.
    pub fn set_download_speed_bytes(&self, speed: u64) {
        self.download_speed_bytes.store(speed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requested: self.requested.load(Ordering::Relaxed),
            download_began: self.download_began.load(Ordering::Relaxed),
            download_completed: self.download_completed.load(Ordering::Relaxed),
            priority_increased: self.priority_increased.load(Ordering::Relaxed),
            priority_decreased: self.priority_decreased.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            download_speed_bytes: self.download_speed_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the engine counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requested: u64,
    pub download_began: u64,
    pub download_completed: u64,
    pub priority_increased: u64,
    pub priority_decreased: u64,
    pub failed: u64,
    pub retried: u64,
    pub bytes_transferred: u64,
    pub download_speed_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.add_requested(3);
        metrics.incr_download_began();
        metrics.incr_download_began();
        metrics.incr_download_completed();
        metrics.incr_retried();
        metrics.incr_failed();
        metrics.add_bytes_transferred(1024);

        let snap = metrics.snapshot();
        assert_eq!(snap.requested, 3);
        assert_eq!(snap.download_began, 2);
        assert_eq!(snap.download_completed, 1);
        assert_eq!(snap.retried, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.bytes_transferred, 1024);
    }

    #[test]
    fn test_speed_is_last_write_wins() {
        let metrics = Metrics::new();
        metrics.set_download_speed_bytes(100);
        metrics.set_download_speed_bytes(250);
        assert_eq!(metrics.snapshot().download_speed_bytes, 250);
    }
}
