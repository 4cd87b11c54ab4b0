//! Transfer counters
//!
//! Process-wide atomics, read by the agent and published to the
//! coordinator through shared state.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Global metrics instance - lock-free atomics for counters
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub batches_received: AtomicU64,
    pub copy_invocations: AtomicU64,
    pub files_transferred: AtomicU64,
    pub files_failed: AtomicU64,
    pub files_unchanged: AtomicU64,
    pub files_retried: AtomicU64,
    pub files_exhausted: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    // Cumulative microseconds spent inside the copy tool
    pub copy_time_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            batches_received: AtomicU64::new(0),
            copy_invocations: AtomicU64::new(0),
            files_transferred: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            files_unchanged: AtomicU64::new(0),
            files_retried: AtomicU64::new(0),
            files_exhausted: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            copy_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_batches_received(&self) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_copy_invocations(&self) {
        self.copy_invocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_files_transferred(&self) {
        self.files_transferred.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_files_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_files_unchanged(&self) {
        self.files_unchanged.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_files_retried(&self, n: u64) {
        self.files_retried.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_files_exhausted(&self, n: u64) {
        self.files_exhausted.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, sent: u64, received: u64) {
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_copy_time(&self, start: Instant) {
        let elapsed_us = start.elapsed().as_micros() as u64;
        self.copy_time_us.fetch_add(elapsed_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_received: self.batches_received.load(Ordering::Relaxed),
            copy_invocations: self.copy_invocations.load(Ordering::Relaxed),
            files_transferred: self.files_transferred.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            files_unchanged: self.files_unchanged.load(Ordering::Relaxed),
            files_retried: self.files_retried.load(Ordering::Relaxed),
            files_exhausted: self.files_exhausted.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            copy_time_us: self.copy_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub batches_received: u64,
    pub copy_invocations: u64,
    pub files_transferred: u64,
    pub files_failed: u64,
    pub files_unchanged: u64,
    pub files_retried: u64,
    pub files_exhausted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub copy_time_us: u64,
}

impl MetricsSnapshot {
    /// Average time per copy invocation in milliseconds
    pub fn avg_copy_ms(&self) -> f64 {
        if self.copy_invocations == 0 {
            return 0.0;
        }
        self.copy_time_us as f64 / self.copy_invocations as f64 / 1000.0
    }
}
