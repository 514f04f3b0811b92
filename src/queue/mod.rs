//! Priority work queue with bounded lanes, worker tasks and retries.
//!
//! Three lanes (high, normal, low) are drained in strict priority order,
//! FIFO within a lane. A failed attempt is retried after an exponential,
//! jittered backoff until the job's attempt budget runs out. Every accepted
//! job produces exactly one [`JobResult`] on the stream handed out by
//! [`WorkQueue::results`].

mod job;
mod stats;
mod worker;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::debug;

pub use job::{Job, JobFuture, JobResult, JobWork, Priority};
pub use stats::{QueueLengths, QueueStats};

use crate::bus::EventBus;
use crate::config::WorkQueueConfig;
use crate::context::Context;
use crate::error::{QueueError, Result, SubmitError};
use stats::Counters;

struct Queued {
    job: Job,
    enqueued_at: Instant,
}

struct Lanes {
    lanes: [VecDeque<Queued>; 3],
    capacity: [usize; 3],
    closed: bool,
}

impl Lanes {
    fn new(config: &WorkQueueConfig) -> Self {
        Self {
            lanes: Default::default(),
            capacity: [config.high_capacity, config.normal_capacity, config.low_capacity],
            closed: false,
        }
    }

    fn pop(&mut self) -> Option<Queued> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn drain(&mut self) -> Vec<Queued> {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect()
    }

    fn lengths(&self) -> QueueLengths {
        QueueLengths {
            high: self.lanes[Priority::High.index()].len(),
            normal: self.lanes[Priority::Normal.index()].len(),
            low: self.lanes[Priority::Low.index()].len(),
        }
    }
}

struct Shared {
    config: WorkQueueConfig,
    lanes: Mutex<Lanes>,
    available: Notify,
    /// Cancelled when `stop` begins: wakes idle workers and ends backoffs.
    stopping: Context,
    /// Parent of every attempt's context; cancelled when a stop runs out of time.
    root: Context,
    results_tx: Mutex<Option<mpsc::UnboundedSender<JobResult>>>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<JobResult>>>,
    bus: Option<Arc<EventBus>>,
    counters: Counters,
    tracker: TaskTracker,
}

impl Shared {
    /// Push `job` onto its lane. Fresh submissions count towards
    /// `total_jobs`; re-queued retries do not.
    fn enqueue(&self, job: Job, fresh: bool) -> std::result::Result<(), (Job, SubmitError)> {
        let priority = job.priority();
        {
            let mut lanes = self.lanes.lock();
            if lanes.closed {
                return Err((job, SubmitError::QueueStopped));
            }
            let lane = priority.index();
            if lanes.lanes[lane].len() >= lanes.capacity[lane] {
                return Err((
                    job,
                    SubmitError::QueueFull {
                        lane: priority.as_str(),
                    },
                ));
            }
            lanes.lanes[lane].push_back(Queued {
                job,
                enqueued_at: Instant::now(),
            });
            if fresh {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.available.notify_one();
        Ok(())
    }
}

/// Priority work queue backed by a fixed set of worker tasks.
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Validate `config` and start its workers. Must be called inside a
    /// tokio runtime.
    ///
    /// With a bus attached, every terminal result is also published as a
    /// [`TASK_COMPLETED`](crate::bus::TASK_COMPLETED) or
    /// [`TASK_FAILED`](crate::bus::TASK_FAILED) event.
    pub fn new(config: WorkQueueConfig, bus: Option<Arc<EventBus>>) -> Result<Self> {
        config.validate()?;
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            lanes: Mutex::new(Lanes::new(&config)),
            config,
            available: Notify::new(),
            stopping: Context::background(),
            root: Context::background(),
            results_tx: Mutex::new(Some(results_tx)),
            results_rx: Mutex::new(Some(results_rx)),
            bus,
            counters: Counters::default(),
            tracker: TaskTracker::new(),
        });

        for worker in 0..shared.config.workers {
            shared.tracker.spawn(shared.clone().run_worker(worker));
        }
        debug!(queue = %shared.config.name, workers = shared.config.workers, "work queue started");
        Ok(Self { shared })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Queue `job` on its priority lane.
    ///
    /// # Errors
    ///
    /// [`SubmitError::QueueStopped`] once [`stop`](Self::stop) has begun,
    /// [`SubmitError::QueueFull`] when the job's lane is at capacity.
    pub fn submit(&self, job: Job) -> Result<()> {
        self.shared
            .enqueue(job, true)
            .map_err(|(job, err)| {
                debug!(queue = %self.shared.config.name, job_id = %job.id(), error = %err, "job rejected");
                err.into()
            })
    }

    /// The stream of terminal job results. It ends once the queue has
    /// stopped and every result has been delivered.
    ///
    /// # Errors
    ///
    /// [`QueueError::ResultsTaken`] on every call after the first.
    pub fn results(&self) -> Result<mpsc::UnboundedReceiver<JobResult>> {
        self.shared
            .results_rx
            .lock()
            .take()
            .ok_or_else(|| QueueError::ResultsTaken.into())
    }

    /// Refuse new jobs, cancel queued and backing-off ones, and give running
    /// attempts up to `timeout` to finish before cancelling them too.
    ///
    /// All worker and retry tasks have exited when this returns.
    ///
    /// # Errors
    ///
    /// [`QueueError::StopTimeout`] when running attempts had to be cancelled.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let shared = &self.shared;
        let drained = {
            let mut lanes = shared.lanes.lock();
            if lanes.closed {
                None
            } else {
                lanes.closed = true;
                Some(lanes.drain())
            }
        };
        let Some(drained) = drained else {
            shared.tracker.wait().await;
            return Ok(());
        };

        shared.stopping.cancel();
        let cancelled = drained.len();
        for queued in drained {
            shared.cancel_queued(queued.job);
        }
        shared.tracker.close();

        let graceful = tokio::time::timeout(timeout, shared.tracker.wait())
            .await
            .is_ok();
        if !graceful {
            shared.root.cancel();
            shared.tracker.wait().await;
        }
        shared.results_tx.lock().take();

        debug!(
            queue = %shared.config.name,
            cancelled_queued = cancelled,
            graceful,
            "work queue stopped"
        );
        if graceful {
            Ok(())
        } else {
            Err(QueueError::StopTimeout {
                timeout_ms: timeout.as_millis(),
            }
            .into())
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.lanes.lock().closed
    }

    #[must_use]
    pub fn queue_lengths(&self) -> QueueLengths {
        self.shared.lanes.lock().lengths()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let lengths = self.queue_lengths();
        self.shared
            .counters
            .snapshot(&self.shared.config.name, lengths)
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shared.stopping.cancel();
        self.shared.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use crate::bus::{handler_fn, TASK_COMPLETED, TASK_FAILED};
    use crate::config::EventBusConfig;

    fn config(workers: usize) -> WorkQueueConfig {
        WorkQueueConfig {
            workers,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            retry_jitter_factor: 0.0,
            ..WorkQueueConfig::named("test")
        }
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<JobResult>, n: usize) -> Vec<JobResult> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(rx.recv().await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_runs_jobs_and_reports_each_once() {
        let queue = WorkQueue::new(config(3), None).unwrap();
        let mut results = queue.results().unwrap();
        for i in 0..5 {
            queue
                .submit(Job::new(format!("job-{i}"), Priority::Normal, |_ctx| async { Ok(()) }))
                .unwrap();
        }

        let done = collect(&mut results, 5).await;
        assert!(done.iter().all(JobResult::is_success));
        assert!(done.iter().all(|result| !result.retried));

        queue.stop(Duration::from_secs(1)).await.unwrap();
        assert!(results.recv().await.is_none());
        let stats = queue.stats();
        assert_eq!(stats.total_jobs, 5);
        assert_eq!(stats.completed_jobs, 5);
        assert_eq!(stats.active_workers, 0);
    }

    #[tokio::test]
    async fn test_strict_priority_then_fifo() {
        let queue = WorkQueue::new(config(1), None).unwrap();
        let mut results = queue.results().unwrap();
        // Workers cannot run before the first await on this runtime.
        for (id, priority) in [
            ("low-1", Priority::Low),
            ("normal-1", Priority::Normal),
            ("high-1", Priority::High),
            ("normal-2", Priority::Normal),
            ("high-2", Priority::High),
        ] {
            queue
                .submit(Job::new(id, priority, |_ctx| async { Ok(()) }))
                .unwrap();
        }
        assert_eq!(
            queue.queue_lengths(),
            QueueLengths {
                high: 2,
                normal: 2,
                low: 1
            }
        );

        let order: Vec<String> = collect(&mut results, 5)
            .await
            .into_iter()
            .map(|result| result.job.id().to_string())
            .collect();
        assert_eq!(order, vec!["high-1", "high-2", "normal-1", "normal-2", "low-1"]);
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_until_success_marks_retried() {
        let queue = WorkQueue::new(config(2), None).unwrap();
        let mut results = queue.results().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let job_calls = calls.clone();
        queue
            .submit(Job::new("flaky", Priority::High, move |_ctx| {
                let calls = job_calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient");
                    }
                    Ok(())
                }
            }))
            .unwrap();

        let result = results.recv().await.unwrap();
        assert!(result.is_success());
        assert!(result.retried);
        assert_eq!(result.job.attempt(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().retried_jobs, 2);
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_once() {
        let queue = WorkQueue::new(config(1), None).unwrap();
        let mut results = queue.results().unwrap();
        queue
            .submit(
                Job::new("broken", Priority::Low, |_ctx| async {
                    Err::<(), _>(anyhow::anyhow!("always"))
                })
                .with_max_retries(1),
            )
            .unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.error.as_ref().unwrap().to_string(), "always");
        assert_eq!(result.job.attempt(), 2);
        assert!(!result.cancelled);

        queue.stop(Duration::from_secs(1)).await.unwrap();
        assert!(results.recv().await.is_none());
        assert_eq!(queue.stats().failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_retry_disabled_runs_once() {
        let queue = WorkQueue::new(
            WorkQueueConfig {
                enable_retry: false,
                ..config(1)
            },
            None,
        )
        .unwrap();
        let mut results = queue.results().unwrap();
        queue
            .submit(Job::new("once", Priority::Normal, |_ctx| async {
                Err::<(), _>(anyhow::anyhow!("no"))
            }))
            .unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.job.attempt(), 1);
        assert_eq!(queue.stats().retried_jobs, 0);
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_reports_failure() {
        let queue = WorkQueue::new(
            WorkQueueConfig {
                enable_retry: false,
                ..config(1)
            },
            None,
        )
        .unwrap();
        let mut results = queue.results().unwrap();
        queue
            .submit(Job::new("panics", Priority::Normal, |_ctx| async {
                if true {
                    panic!("boom");
                }
                Ok(())
            }))
            .unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.error.unwrap().to_string(), "job panicked");
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_job_timeout_applies_per_attempt() {
        let queue = WorkQueue::new(
            WorkQueueConfig {
                enable_retry: false,
                job_timeout_secs: 1,
                ..config(1)
            },
            None,
        )
        .unwrap();
        let mut results = queue.results().unwrap();
        queue
            .submit(Job::new("slow", Priority::Normal, |ctx: Context| async move {
                ctx.sleep(Duration::from_secs(30)).await?;
                Ok(())
            }))
            .unwrap();
        let result = results.recv().await.unwrap();
        assert!(result.error.unwrap().to_string().contains("timed out"));
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_lane_rejects() {
        let queue = WorkQueue::new(
            WorkQueueConfig {
                high_capacity: 1,
                ..config(1)
            },
            None,
        )
        .unwrap();
        queue
            .submit(Job::new("a", Priority::High, |_ctx| async { Ok(()) }))
            .unwrap();
        let err = queue
            .submit(Job::new("b", Priority::High, |_ctx| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Submit(SubmitError::QueueFull { lane: "high" })
        ));
        // Other lanes are unaffected.
        queue
            .submit(Job::new("c", Priority::Low, |_ctx| async { Ok(()) }))
            .unwrap();
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_and_rejects_new_jobs() {
        let queue = WorkQueue::new(config(1), None).unwrap();
        let mut results = queue.results().unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));
        queue
            .submit(Job::new("running", Priority::High, move |_ctx| {
                let started_tx = started_tx.clone();
                async move {
                    if let Some(tx) = started_tx.lock().take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                }
            }))
            .unwrap();
        for i in 0..2 {
            queue
                .submit(Job::new(format!("queued-{i}"), Priority::Low, |_ctx| async { Ok(()) }))
                .unwrap();
        }
        started_rx.await.unwrap();

        queue.stop(Duration::from_secs(1)).await.unwrap();
        let err = queue
            .submit(Job::new("late", Priority::High, |_ctx| async { Ok(()) }))
            .unwrap_err();
        assert!(matches!(err, crate::Error::Submit(SubmitError::QueueStopped)));

        let mut done = Vec::new();
        while let Some(result) = results.recv().await {
            done.push(result);
        }
        assert_eq!(done.len(), 3);
        let cancelled = done.iter().filter(|result| result.cancelled).count();
        assert_eq!(cancelled, 2);
        assert!(done
            .iter()
            .any(|result| result.job.id() == "running" && result.is_success()));
        assert_eq!(queue.stats().cancelled_jobs, 2);
    }

    #[tokio::test]
    async fn test_stop_timeout_cancels_running_jobs() {
        let queue = WorkQueue::new(config(1), None).unwrap();
        let mut results = queue.results().unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let started_tx = Arc::new(Mutex::new(Some(started_tx)));
        queue
            .submit(Job::new("stuck", Priority::Normal, move |_ctx| {
                let started_tx = started_tx.clone();
                async move {
                    if let Some(tx) = started_tx.lock().take() {
                        let _ = tx.send(());
                    }
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            }))
            .unwrap();
        started_rx.await.unwrap();

        let err = queue.stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, crate::Error::Queue(QueueError::StopTimeout { .. })));
        let result = results.recv().await.unwrap();
        assert!(result.cancelled);
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_cancels_backing_off_jobs() {
        let queue = WorkQueue::new(
            WorkQueueConfig {
                retry_base_delay_ms: 60_000,
                retry_max_delay_ms: 60_000,
                ..config(1)
            },
            None,
        )
        .unwrap();
        let mut results = queue.results().unwrap();
        queue
            .submit(Job::new("retrying", Priority::Normal, |_ctx| async {
                Err::<(), _>(anyhow::anyhow!("later"))
            }))
            .unwrap();
        while queue.stats().backing_off == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        queue.stop(Duration::from_secs(1)).await.unwrap();
        let result = results.recv().await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.job.attempt(), 1);
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_results_can_only_be_taken_once() {
        let queue = WorkQueue::new(config(1), None).unwrap();
        assert!(queue.results().is_ok());
        assert!(matches!(
            queue.results().unwrap_err(),
            crate::Error::Queue(QueueError::ResultsTaken)
        ));
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_publishes_job_events() {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()).unwrap());
        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        for (event_type, counter) in [(TASK_COMPLETED, completed.clone()), (TASK_FAILED, failed.clone())] {
            bus.subscribe(
                event_type,
                handler_fn(move |_ctx, _event| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(())
                    }
                }),
            )
            .unwrap();
        }

        let queue = WorkQueue::new(
            WorkQueueConfig {
                enable_retry: false,
                ..config(2)
            },
            Some(bus.clone()),
        )
        .unwrap();
        let mut results = queue.results().unwrap();
        queue
            .submit(Job::new("ok", Priority::Normal, |_ctx| async { Ok(()) }))
            .unwrap();
        queue
            .submit(Job::new("bad", Priority::Normal, |_ctx| async {
                Err::<(), _>(anyhow::anyhow!("bad"))
            }))
            .unwrap();
        collect(&mut results, 2).await;
        queue.stop(Duration::from_secs(1)).await.unwrap();

        assert!(bus.close().await);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}
