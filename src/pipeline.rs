//! Bulk processing built from a work queue, the event bus and async I/O.
//!
//! [`BulkRunner`] submits one job per item to a fresh [`WorkQueue`] and
//! waits for every job's terminal result. Progress is observed through the
//! queue's `task.completed` / `task.failed` events; the report itself is
//! built from the results stream, which never drops an outcome.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::aio::AsyncIo;
use crate::bus::{handler_fn, Event, EventBus, FILE_PROCESSED, TASK_COMPLETED, TASK_FAILED};
use crate::config::WorkQueueConfig;
use crate::context::Context;
use crate::error::{Error, QueueError, Result};
use crate::queue::{Job, JobResult, WorkQueue};

/// Jobs finished so far out of those submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of one [`BulkRunner::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkReport {
    pub succeeded: usize,
    /// Jobs that failed, were rejected at submission, or were cancelled.
    pub failed: usize,
    /// Jobs that needed more than one attempt, whatever their outcome.
    pub retried: usize,
    pub cancelled: usize,
    pub failures: Vec<BulkFailure>,
    pub elapsed: Duration,
}

impl BulkReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, result: &JobResult) {
        if result.retried {
            self.retried += 1;
        }
        match &result.error {
            None => self.succeeded += 1,
            Some(error) => {
                self.failed += 1;
                if result.cancelled {
                    self.cancelled += 1;
                }
                self.failures.push(BulkFailure {
                    id: result.job.id().to_string(),
                    error: error.to_string(),
                });
            }
        }
    }
}

impl fmt::Display for BulkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed ({} cancelled), {} retried in {:.2?}",
            self.succeeded, self.failed, self.cancelled, self.retried, self.elapsed
        )
    }
}

/// Runs a set of jobs to completion on a dedicated work queue.
pub struct BulkRunner {
    queue_config: WorkQueueConfig,
    bus: Arc<EventBus>,
    io: AsyncIo,
    stop_timeout: Duration,
    progress: Option<ProgressFn>,
}

impl BulkRunner {
    pub fn new(queue_config: WorkQueueConfig, bus: Arc<EventBus>, io: AsyncIo) -> Self {
        Self {
            queue_config,
            bus,
            io,
            stop_timeout: Duration::from_secs(5),
            progress: None,
        }
    }

    /// How long running jobs get to finish once the run is cancelled.
    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Called after every finished job.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn io(&self) -> &AsyncIo {
        &self.io
    }

    /// Run `jobs` and wait for all of them. Cancelling `ctx` stops the
    /// queue; jobs that did not finish are reported as cancelled.
    pub async fn run(&self, ctx: &Context, jobs: Vec<Job>) -> Result<BulkReport> {
        let started = Instant::now();
        let queue = WorkQueue::new(self.queue_config.clone(), Some(self.bus.clone()))?;
        let mut results = queue.results()?;
        let subscriptions = self.track_progress(queue.name(), jobs.len())?;

        let mut report = BulkReport::default();
        let mut accepted = 0;
        for job in jobs {
            let id = job.id().to_string();
            match queue.submit(job) {
                Ok(()) => accepted += 1,
                Err(err) => {
                    debug!(job_id = %id, error = %err, "job not submitted");
                    report.failed += 1;
                    report.failures.push(BulkFailure {
                        id,
                        error: err.to_string(),
                    });
                }
            }
        }

        let mut received = 0;
        while received < accepted {
            tokio::select! {
                result = results.recv() => match result {
                    Some(result) => {
                        received += 1;
                        report.record(&result);
                    }
                    None => break,
                },
                _ = ctx.done() => {
                    debug!(pending = accepted - received, "bulk run cancelled");
                    break;
                }
            }
        }

        match queue.stop(self.stop_timeout).await {
            Ok(()) => {}
            Err(Error::Queue(QueueError::StopTimeout { timeout_ms })) => {
                debug!(timeout_ms = timeout_ms as u64, "running jobs cancelled at shutdown");
            }
            Err(err) => return Err(err),
        }
        while let Some(result) = results.recv().await {
            report.record(&result);
        }

        for id in subscriptions {
            self.bus.unsubscribe(id);
        }
        report.elapsed = started.elapsed();
        debug!(
            succeeded = report.succeeded,
            failed = report.failed,
            retried = report.retried,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "bulk run finished"
        );
        Ok(report)
    }

    fn track_progress(&self, queue_name: &str, total: usize) -> Result<Vec<crate::bus::SubscriptionId>> {
        let Some(progress) = self.progress.clone() else {
            return Ok(Vec::new());
        };
        let done = Arc::new(AtomicUsize::new(0));
        let source = queue_name.to_string();
        let mut ids = Vec::with_capacity(2);
        for event_type in [TASK_COMPLETED, TASK_FAILED] {
            let done = done.clone();
            let progress = progress.clone();
            let source = source.clone();
            let handler = handler_fn(move |_ctx, event: Event| {
                let done = done.clone();
                let progress = progress.clone();
                let ours = event.source == source;
                async move {
                    if ours {
                        let done = done.fetch_add(1, Ordering::Relaxed) + 1;
                        progress(Progress { done, total });
                    }
                    Ok::<_, anyhow::Error>(())
                }
            });
            ids.push(self.bus.subscribe(event_type, handler)?);
        }
        Ok(ids)
    }

    /// Read each file, pass its bytes through `transform` and write the
    /// output next to it with `suffix` appended to the file name.
    ///
    /// A [`FILE_PROCESSED`] event is published for every file written.
    pub async fn process_files<F>(
        &self,
        ctx: &Context,
        paths: Vec<PathBuf>,
        suffix: &str,
        transform: F,
    ) -> Result<BulkReport>
    where
        F: Fn(&Path, Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        let transform = Arc::new(transform);
        let suffix: Arc<str> = Arc::from(suffix);
        let jobs = paths
            .into_iter()
            .map(|path| {
                let io = self.io.clone();
                let bus = self.bus.clone();
                let transform = transform.clone();
                let suffix = suffix.clone();
                let source = self.queue_config.name.clone();
                Job::file_processing(path, move |ctx, path| {
                    let io = io.clone();
                    let bus = bus.clone();
                    let transform = transform.clone();
                    let output = output_path(&path, &suffix);
                    let source = source.clone();
                    async move {
                        let data = io.read_file(&ctx, &path).await?;
                        let processed = transform(&path, data)?;
                        let size = processed.len();
                        io.write_file(&ctx, &output, processed).await?;
                        let event = Event::new(
                            FILE_PROCESSED,
                            source,
                            json!({
                                "file": path.display().to_string(),
                                "processed_file": output.display().to_string(),
                                "size": size,
                            }),
                        );
                        if let Err(err) = bus.publish_async(event) {
                            debug!(error = %err, "file event not published");
                        }
                        Ok::<_, anyhow::Error>(())
                    }
                })
            })
            .collect();
        self.run(ctx, jobs).await
    }
}

/// `path` with `suffix` appended to its file name.
pub fn output_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
