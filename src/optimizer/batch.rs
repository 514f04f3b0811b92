//! Size- and time-triggered request batching.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::config::BatchConfig;
use crate::context::Context;
use crate::error::{ExecutionError, Result, SubmitError};

/// One logical request inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub id: String,
    pub payload: Value,
}

impl BatchRequest {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Result for one request of a flushed batch, matched back by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub id: String,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl BatchResponse {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Turn a per-item error into an [`ExecutionError::BatchItem`].
    pub fn into_result(self) -> Result<Option<Value>> {
        match self.error {
            Some(message) => Err(ExecutionError::BatchItem {
                id: self.id,
                message,
            }
            .into()),
            None => Ok(self.data),
        }
    }
}

pub type BatchFuture = BoxFuture<'static, Vec<BatchResponse>>;

/// Executes one whole batch. Called exactly once per flush.
pub type BatchFn = Arc<dyn Fn(Context, Vec<BatchRequest>) -> BatchFuture + Send + Sync>;

/// Box an async closure into a [`BatchFn`].
pub fn batch_fn<F, Fut>(f: F) -> BatchFn
where
    F: Fn(Context, Vec<BatchRequest>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<BatchResponse>> + Send + 'static,
{
    Arc::new(move |ctx, requests| Box::pin(f(ctx, requests)))
}

type Delivery = std::result::Result<BatchResponse, ExecutionError>;

/// Handle for one submitted request.
pub struct BatchTicket {
    id: String,
    rx: oneshot::Receiver<Delivery>,
}

impl BatchTicket {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for this request's response.
    ///
    /// Giving up early only drops this waiter; the batch still runs.
    pub async fn wait(self, ctx: &Context) -> Result<BatchResponse> {
        match ctx.run(self.rx).await? {
            Ok(delivery) => Ok(delivery?),
            Err(_) => Err(ExecutionError::Abandoned.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Size,
    Timer,
    Manual,
}

struct PendingBatch {
    generation: u64,
    batch_fn: BatchFn,
    items: Vec<(BatchRequest, oneshot::Sender<Delivery>)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    pub batches_flushed: u64,
    pub requests_batched: u64,
    pub size_flushes: u64,
    pub timer_flushes: u64,
    pub manual_flushes: u64,
    pub pending_batches: usize,
    pub average_batch_size: f64,
}

#[derive(Default)]
struct BatchCounters {
    batches_flushed: AtomicU64,
    requests_batched: AtomicU64,
    size_flushes: AtomicU64,
    timer_flushes: AtomicU64,
    manual_flushes: AtomicU64,
}

struct Inner {
    config: BatchConfig,
    pending: Mutex<HashMap<String, PendingBatch>>,
    next_generation: AtomicU64,
    permits: Arc<Semaphore>,
    stopped: AtomicBool,
    shutdown: Context,
    counters: BatchCounters,
    tracker: TaskTracker,
}

/// Accumulates requests per batch key and flushes them through the
/// batch function on size or time.
///
/// The batch function attached to a batch is the one passed by the
/// submission that opened it.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Inner>,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                permits,
                stopped: AtomicBool::new(false),
                shutdown: Context::background(),
                counters: BatchCounters::default(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Add `request` to the open batch for `batch_key`, opening one if needed.
    pub fn submit(
        &self,
        batch_key: &str,
        request: BatchRequest,
        batch_fn: BatchFn,
    ) -> Result<BatchTicket> {
        let (tx, rx) = oneshot::channel();
        let ticket = BatchTicket {
            id: request.id.clone(),
            rx,
        };

        let mut arm_timer = None;
        let full = {
            let mut pending = self.inner.pending.lock();
            // Checked under the lock `stop` drains with, so no item can land
            // after the final flush.
            if self.inner.stopped.load(Ordering::Acquire) {
                return Err(SubmitError::BatcherStopped.into());
            }
            let batch = pending.entry(batch_key.to_string()).or_insert_with(|| {
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                arm_timer = Some(generation);
                PendingBatch {
                    generation,
                    batch_fn,
                    items: Vec::new(),
                }
            });
            batch.items.push((request, tx));

            if batch.items.len() >= self.inner.config.max_batch_size {
                pending.remove(batch_key)
            } else {
                None
            }
        };

        if let Some(batch) = full {
            self.spawn_flush(batch_key.to_string(), batch, FlushReason::Size);
        } else if let Some(generation) = arm_timer {
            self.arm_timer(batch_key.to_string(), generation);
        }

        Ok(ticket)
    }

    fn arm_timer(&self, batch_key: String, generation: u64) {
        let processor = self.clone();
        let interval = self.inner.config.flush_interval();
        self.inner.tracker.spawn(async move {
            if processor.inner.shutdown.sleep(interval).await.is_err() {
                return;
            }
            let due = {
                let mut pending = processor.inner.pending.lock();
                let current = pending.get(&batch_key).map(|batch| batch.generation) == Some(generation);
                if current {
                    pending.remove(&batch_key)
                } else {
                    None
                }
            };
            if let Some(batch) = due {
                processor.spawn_flush(batch_key, batch, FlushReason::Timer);
            }
        });
    }

    fn spawn_flush(&self, batch_key: String, batch: PendingBatch, reason: FlushReason) {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
                return;
            };

            let counter = match reason {
                FlushReason::Size => &inner.counters.size_flushes,
                FlushReason::Timer => &inner.counters.timer_flushes,
                FlushReason::Manual => &inner.counters.manual_flushes,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            inner.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
            inner
                .counters
                .requests_batched
                .fetch_add(batch.items.len() as u64, Ordering::Relaxed);

            let (requests, waiters): (Vec<_>, Vec<_>) = batch.items.into_iter().unzip();
            debug!(
                batch_key = %batch_key,
                size = requests.len(),
                reason = ?reason,
                "flushing batch"
            );

            let responses = (batch.batch_fn)(Context::background(), requests.clone()).await;
            let by_id: HashMap<String, BatchResponse> = responses
                .into_iter()
                .map(|response| (response.id.clone(), response))
                .collect();

            for (request, waiter) in requests.into_iter().zip(waiters) {
                let delivery = match by_id.get(&request.id) {
                    Some(response) => Ok(response.clone()),
                    None => Err(ExecutionError::MissingBatchResponse {
                        id: request.id.clone(),
                    }),
                };
                if waiter.send(delivery).is_err() {
                    trace!(id = %request.id, "batch waiter left before delivery");
                }
            }
        });
    }

    /// Flush every open batch now.
    pub fn flush_all(&self) {
        let drained: Vec<(String, PendingBatch)> = self.inner.pending.lock().drain().collect();
        for (batch_key, batch) in drained {
            self.spawn_flush(batch_key, batch, FlushReason::Manual);
        }
    }

    /// Reject new submissions, flush what is open and wait for running
    /// flushes to finish.
    pub async fn stop(&self) {
        let drained: Vec<(String, PendingBatch)> = {
            let mut pending = self.inner.pending.lock();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            pending.drain().collect()
        };
        for (batch_key, batch) in drained {
            self.spawn_flush(batch_key, batch, FlushReason::Manual);
        }
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> BatchStats {
        let counters = &self.inner.counters;
        let batches_flushed = counters.batches_flushed.load(Ordering::Relaxed);
        let requests_batched = counters.requests_batched.load(Ordering::Relaxed);
        BatchStats {
            batches_flushed,
            requests_batched,
            size_flushes: counters.size_flushes.load(Ordering::Relaxed),
            timer_flushes: counters.timer_flushes.load(Ordering::Relaxed),
            manual_flushes: counters.manual_flushes.load(Ordering::Relaxed),
            pending_batches: self.inner.pending.lock().len(),
            average_batch_size: if batches_flushed == 0 {
                0.0
            } else {
                requests_batched as f64 / batches_flushed as f64
            },
        }
    }
}
