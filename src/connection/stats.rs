use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::stats::Ema;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total_requests: u64,
    /// Requests that ended with a status below 400.
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retry_attempts: u64,
    /// Requests currently in flight, retries included.
    pub active_connections: usize,
    pub average_latency: Duration,
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) total: AtomicU64,
    pub(super) successful: AtomicU64,
    pub(super) failed: AtomicU64,
    pub(super) retries: AtomicU64,
    pub(super) active: AtomicUsize,
    pub(super) latency: Ema,
}

impl Counters {
    pub(super) fn finish(&self, success: bool, latency: Duration) {
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    pub(super) fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successful.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            retry_attempts: self.retries.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
            average_latency: self.latency.get(),
        }
    }
}

/// Counts a request as active for as long as it lives.
pub(super) struct ActiveRequest<'a>(&'a AtomicUsize);

impl<'a> ActiveRequest<'a> {
    pub(super) fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active)
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
