use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::stats::Ema;

/// Point-in-time view of a [`WorkQueue`](super::WorkQueue).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub name: String,
    /// Jobs accepted by `submit`.
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Retry attempts scheduled, not distinct jobs.
    pub retried_jobs: u64,
    pub cancelled_jobs: u64,
    pub active_workers: usize,
    pub queued_jobs: usize,
    /// Jobs sleeping before their next attempt.
    pub backing_off: usize,
    pub average_exec_time: Duration,
    pub average_wait_time: Duration,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} submitted, {} completed, {} failed, {} retries, {} cancelled, {} queued, {} active (exec {:?}, wait {:?})",
            self.name,
            self.total_jobs,
            self.completed_jobs,
            self.failed_jobs,
            self.retried_jobs,
            self.cancelled_jobs,
            self.queued_jobs,
            self.active_workers,
            self.average_exec_time,
            self.average_wait_time,
        )
    }
}

/// Backlog per lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueLengths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueLengths {
    #[must_use]
    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) total: AtomicU64,
    pub(super) completed: AtomicU64,
    pub(super) failed: AtomicU64,
    pub(super) retried: AtomicU64,
    pub(super) cancelled: AtomicU64,
    pub(super) active: AtomicUsize,
    pub(super) backing_off: AtomicUsize,
    pub(super) exec_time: Ema,
    pub(super) wait_time: Ema,
}

impl Counters {
    pub(super) fn snapshot(&self, name: &str, lengths: QueueLengths) -> QueueStats {
        QueueStats {
            name: name.to_string(),
            total_jobs: self.total.load(Ordering::Relaxed),
            completed_jobs: self.completed.load(Ordering::Relaxed),
            failed_jobs: self.failed.load(Ordering::Relaxed),
            retried_jobs: self.retried.load(Ordering::Relaxed),
            cancelled_jobs: self.cancelled.load(Ordering::Relaxed),
            active_workers: self.active.load(Ordering::Relaxed),
            queued_jobs: lengths.total(),
            backing_off: self.backing_off.load(Ordering::Relaxed),
            average_exec_time: self.exec_time.get(),
            average_wait_time: self.wait_time.get(),
        }
    }
}

/// Decrements a gauge when dropped.
pub(super) struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    pub(super) fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
