//! Worker loop, attempt execution and retry scheduling.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use rand::Rng;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::job::{Job, JobResult};
use super::stats::GaugeGuard;
use super::{Queued, Shared};
use crate::bus::{Event, TASK_COMPLETED, TASK_FAILED};
use crate::error::{ContextError, SharedError, SubmitError};

/// Timing of the attempt that ended a job.
struct Attempt {
    started_at: DateTime<Utc>,
    duration: Duration,
}

impl Attempt {
    fn none() -> Self {
        Self {
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }
}

/// A job sleeping before its next attempt. If the retry task goes away
/// without re-queueing the job, the job is reported as cancelled.
struct PendingRetry {
    shared: Arc<Shared>,
    job: Option<Job>,
}

impl Drop for PendingRetry {
    fn drop(&mut self) {
        if let Some(job) = self.job.take() {
            self.shared.finish_cancelled(job, Attempt::none());
        }
    }
}

impl Shared {
    pub(super) async fn run_worker(self: Arc<Self>, worker: usize) {
        trace!(queue = %self.config.name, worker, "worker started");
        while let Some(queued) = self.next_job().await {
            self.process(queued).await;
        }
        trace!(queue = %self.config.name, worker, "worker stopped");
    }

    /// Report a job that was still waiting in its lane when the queue stopped.
    pub(super) fn cancel_queued(&self, job: Job) {
        self.finish_cancelled(job, Attempt::none());
    }

    async fn next_job(&self) -> Option<Queued> {
        loop {
            let notified = self.available.notified();
            if let Some(queued) = self.lanes.lock().pop() {
                return Some(queued);
            }
            if self.stopping.err().is_some() {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.stopping.done() => {}
            }
        }
    }

    async fn process(self: &Arc<Self>, queued: Queued) {
        let Queued { mut job, enqueued_at } = queued;
        self.counters.wait_time.record(enqueued_at.elapsed());
        let _active = GaugeGuard::enter(&self.counters.active);

        let ctx = self.root.with_timeout(self.config.job_timeout());
        let started_at = Utc::now();
        let started = Instant::now();
        let work = job.start_attempt(ctx.clone());
        let outcome = ctx.run(AssertUnwindSafe(work).catch_unwind()).await;
        let attempt = Attempt {
            started_at,
            duration: started.elapsed(),
        };
        self.counters.exec_time.record(attempt.duration);

        let error = match outcome {
            Ok(Ok(Ok(()))) => {
                self.finish_success(job, attempt);
                return;
            }
            Ok(Ok(Err(err))) => err,
            Ok(Err(_)) => anyhow!("job panicked"),
            Err(ContextError::DeadlineExceeded) => {
                anyhow!("job timed out after {:?}", self.config.job_timeout())
            }
            Err(ContextError::Canceled) => {
                self.finish_cancelled(job, attempt);
                return;
            }
        };

        if job.attempt() < self.max_attempts(&job) {
            self.schedule_retry(job, &error);
        } else {
            self.finish_failure(job, SharedError::new(error), attempt);
        }
    }

    fn max_attempts(&self, job: &Job) -> u32 {
        if !self.config.enable_retry {
            return 1;
        }
        job.max_attempts()
            .unwrap_or_else(|| self.config.default_max_attempts())
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        let base = self.config.retry_delay(retry);
        let jitter = self.config.retry_jitter_factor;
        if jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor.max(0.0))
    }

    fn schedule_retry(self: &Arc<Self>, job: Job, error: &anyhow::Error) {
        let delay = self.retry_delay(job.attempt());
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        debug!(
            queue = %self.config.name,
            job_id = %job.id(),
            attempt = job.attempt(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "job failed, retrying"
        );

        let shared = self.clone();
        let mut pending = PendingRetry {
            shared: self.clone(),
            job: Some(job),
        };
        self.tracker.spawn(async move {
            let _backoff = GaugeGuard::enter(&shared.counters.backing_off);
            if shared.stopping.sleep(delay).await.is_err() {
                return;
            }
            if let Some(job) = pending.job.take() {
                shared.requeue(job);
            }
        });
    }

    fn requeue(&self, job: Job) {
        match self.enqueue(job, false) {
            Ok(()) => {}
            Err((job, SubmitError::QueueFull { lane })) => {
                let error = anyhow!("retry rejected: {lane} priority lane is full");
                self.finish_failure(job, SharedError::new(error), Attempt::none());
            }
            Err((job, _)) => self.finish_cancelled(job, Attempt::none()),
        }
    }

    fn finish_success(&self, job: Job, attempt: Attempt) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        let retried = job.attempt() > 1;
        trace!(queue = %self.config.name, job_id = %job.id(), retried, "job completed");
        self.publish(Event::new(
            TASK_COMPLETED,
            self.config.name.clone(),
            json!({
                "job_id": job.id(),
                "priority": job.priority().as_str(),
                "attempts": job.attempt(),
                "duration_ms": attempt.duration.as_millis() as u64,
                "retried": retried,
            }),
        ));
        self.emit(job, None, attempt, false);
    }

    fn finish_failure(&self, job: Job, error: SharedError, attempt: Attempt) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.config.name, job_id = %job.id(), attempts = job.attempt(), error = %error, "job failed");
        self.publish_failure(&job, &error, &attempt, false);
        self.emit(job, Some(error), attempt, false);
    }

    fn finish_cancelled(&self, job: Job, attempt: Attempt) {
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        let error = SharedError::new(anyhow!("job cancelled: queue stopped"));
        debug!(queue = %self.config.name, job_id = %job.id(), "job cancelled");
        self.publish_failure(&job, &error, &attempt, true);
        self.emit(job, Some(error), attempt, true);
    }

    fn publish_failure(&self, job: &Job, error: &SharedError, attempt: &Attempt, cancelled: bool) {
        self.publish(Event::new(
            TASK_FAILED,
            self.config.name.clone(),
            json!({
                "job_id": job.id(),
                "priority": job.priority().as_str(),
                "attempts": job.attempt(),
                "duration_ms": attempt.duration.as_millis() as u64,
                "retried": job.attempt() > 1,
                "cancelled": cancelled,
                "error": error.to_string(),
            }),
        ));
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish_async(event) {
                trace!(queue = %self.config.name, error = %err, "job event not published");
            }
        }
    }

    fn emit(&self, job: Job, error: Option<SharedError>, attempt: Attempt, cancelled: bool) {
        let result = JobResult {
            retried: job.attempt() > 1,
            job,
            error,
            duration: attempt.duration,
            cancelled,
            started_at: attempt.started_at,
            finished_at: Utc::now(),
        };
        if let Some(tx) = self.results_tx.lock().as_ref() {
            let _ = tx.send(result);
        }
    }
}
