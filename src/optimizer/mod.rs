//! Request optimizer: deduplication, batching and adaptive rate limiting
//! behind a single entry point.
//!
//! [`OptimizationManager`] owns one set of components per upstream
//! service, created lazily on first use. A call goes through, in order:
//!
//! 1. deduplication: identical in-flight or recently completed calls are
//!    shared,
//! 2. rate limiting: performed once per real execution, inside the shared
//!    work,
//! 3. the caller's work itself.
//!
//! Batching is a separate entry point ([`OptimizationManager::execute_batch`])
//! because it changes the shape of the call: many logical requests become
//! one upstream request.

mod batch;
mod dedup;
mod flight;
mod rate_limit;
mod repository;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use tracing::{debug, trace};

pub use batch::{batch_fn, BatchFn, BatchFuture, BatchProcessor, BatchRequest, BatchResponse, BatchStats, BatchTicket};
pub use dedup::{DedupOutcome, DedupSource, DedupStats, RequestDeduplicator};
pub use flight::Flight;
pub use rate_limit::{
    RateLimitHeaders, RateLimitStatus, RateLimitWindow, RateLimiter, RateLimiterRegistry,
    RateLimiterStats, WaitOutcome,
};
pub use repository::RepositoryBatcher;

use crate::config::OptimizerConfig;
use crate::context::Context;
use crate::error::{Error, Result, SharedError};

/// One logical call to an upstream service.
#[derive(Debug, Clone)]
pub struct OptimizedRequest {
    pub service: String,
    pub operation: String,
    pub key: String,
    pub context: Context,
}

impl OptimizedRequest {
    pub fn new(
        service: impl Into<String>,
        operation: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            key: key.into(),
            context: Context::background(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Deduplication key, unique within the service.
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.service, self.operation, self.key)
    }
}

/// Result of [`OptimizationManager::execute`].
#[derive(Debug, Clone)]
pub struct OptimizedResponse<T> {
    pub data: T,
    pub was_deduplicated: bool,
    pub was_batched: bool,
    pub was_rate_limited: bool,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
struct Executed<T> {
    data: T,
    rate_limited: bool,
}

/// Components serving a single upstream service.
struct ServiceOptimizers {
    dedup: RequestDeduplicator,
    batcher: BatchProcessor,
}

#[derive(Default)]
struct ManagerCounters {
    total_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    batched_requests: AtomicU64,
    rate_limited_requests: AtomicU64,
    direct_requests: AtomicU64,
    errors: AtomicU64,
}

/// Aggregate counters across every service.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OptimizerStats {
    pub total_requests: u64,
    pub deduplicated_requests: u64,
    pub batched_requests: u64,
    pub rate_limited_requests: u64,
    pub direct_requests: u64,
    pub errors: u64,
    /// Percentage of logical requests that did not need an upstream call
    /// of their own.
    pub efficiency_gain: f64,
}

impl fmt::Display for OptimizerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} deduplicated={} batched={} rate_limited={} direct={} errors={} efficiency={:.1}%",
            self.total_requests,
            self.deduplicated_requests,
            self.batched_requests,
            self.rate_limited_requests,
            self.direct_requests,
            self.errors,
            self.efficiency_gain
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceStats {
    pub service: String,
    pub dedup: DedupStats,
    pub batch: BatchStats,
    pub rate_limit: Option<(RateLimitStatus, RateLimiterStats)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailedStats {
    pub overall: OptimizerStats,
    pub services: Vec<ServiceStats>,
}

impl fmt::Display for DetailedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.overall)?;
        for service in &self.services {
            write!(
                f,
                "  {}: executions={} dedup_hits={} batches={} avg_batch={:.1}",
                service.service,
                service.dedup.executions,
                service.dedup.deduplicated_calls,
                service.batch.batches_flushed,
                service.batch.average_batch_size
            )?;
            if let Some((status, stats)) = &service.rate_limit {
                write!(
                    f,
                    " quota={}/{} throttled={}",
                    status.remaining, status.limit, stats.throttled_requests
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Entry point combining deduplication, batching and rate limiting.
pub struct OptimizationManager {
    config: OptimizerConfig,
    enabled: AtomicBool,
    services: DashMap<String, Arc<ServiceOptimizers>>,
    limiters: RateLimiterRegistry,
    counters: ManagerCounters,
}

impl OptimizationManager {
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        let limiters = RateLimiterRegistry::from_config(&config);
        Ok(Self {
            config,
            enabled: AtomicBool::new(true),
            services: DashMap::new(),
            limiters,
            counters: ManagerCounters::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Route every subsequent call straight to its work function.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn service(&self, service: &str) -> Arc<ServiceOptimizers> {
        if let Some(existing) = self.services.get(service) {
            return existing.clone();
        }
        self.services
            .entry(service.to_string())
            .or_insert_with(|| {
                debug!(service, "creating service optimizers");
                Arc::new(ServiceOptimizers {
                    dedup: RequestDeduplicator::new(
                        self.config.deduplication_ttl(),
                        self.config.max_dedup_entries,
                    ),
                    batcher: BatchProcessor::new(self.config.batch.clone()),
                })
            })
            .clone()
    }

    fn limiter(&self, service: &str) -> Option<Arc<RateLimiter>> {
        self.config
            .enable_rate_limit
            .then(|| self.limiters.get(service))
    }

    /// Run `f` for `request`, applying whichever optimizations are enabled.
    ///
    /// `f` receives the context the work should observe: the caller's own
    /// context when nothing is shared, the shared execution's context
    /// otherwise.
    pub async fn execute<T, F, Fut>(
        &self,
        request: OptimizedRequest,
        f: F,
    ) -> Result<OptimizedResponse<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let ctx = request.context.clone();
        ctx.check()?;
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if !self.is_enabled() {
            self.counters.direct_requests.fetch_add(1, Ordering::Relaxed);
            let data = self.track(
                ctx.run(f(ctx.clone()))
                    .await
                    .map_err(Error::from)
                    .and_then(|out| out.map_err(|err| SharedError::new(err).into())),
            )?;
            return Ok(OptimizedResponse {
                data,
                was_deduplicated: false,
                was_batched: false,
                was_rate_limited: false,
                duration: started.elapsed(),
            });
        }

        let limiter = self.limiter(&request.service);
        let work = move |work_ctx: Context| async move {
            let mut rate_limited = false;
            if let Some(limiter) = limiter {
                rate_limited = limiter.wait(&work_ctx).await?.throttled;
            }
            let data = f(work_ctx).await?;
            Ok::<_, anyhow::Error>(Executed { data, rate_limited })
        };

        let (executed, source) = if self.config.enable_deduplication {
            let optimizers = self.service(&request.service);
            let outcome = self.track(
                optimizers
                    .dedup
                    .execute(&ctx, &request.dedup_key(), work)
                    .await,
            )?;
            (outcome.value, outcome.source)
        } else {
            let executed = self.track(
                ctx.run(work(ctx.clone()))
                    .await
                    .map_err(Error::from)
                    .and_then(|out| out.map_err(|err| SharedError::new(err).into())),
            )?;
            (executed, DedupSource::Executed)
        };

        let was_deduplicated = source != DedupSource::Executed;
        let was_rate_limited = executed.rate_limited && source != DedupSource::Cached;
        if was_deduplicated {
            self.counters
                .deduplicated_requests
                .fetch_add(1, Ordering::Relaxed);
        }
        if was_rate_limited {
            self.counters
                .rate_limited_requests
                .fetch_add(1, Ordering::Relaxed);
        }
        trace!(
            service = %request.service,
            operation = %request.operation,
            deduplicated = was_deduplicated,
            "optimized request completed"
        );

        Ok(OptimizedResponse {
            data: executed.data,
            was_deduplicated,
            was_batched: false,
            was_rate_limited,
            duration: started.elapsed(),
        })
    }

    /// Submit `requests` through the service's batcher and wait for all of
    /// them. Responses come back in request order.
    ///
    /// With batching off (or the manager disabled) `batch_fn` is called
    /// once, directly, with all of `requests`.
    pub async fn execute_batch(
        &self,
        ctx: &Context,
        service: &str,
        batch_key: &str,
        requests: Vec<BatchRequest>,
        batch_fn: BatchFn,
    ) -> Result<Vec<BatchResponse>> {
        ctx.check()?;
        let count = requests.len() as u64;
        self.counters
            .total_requests
            .fetch_add(count, Ordering::Relaxed);

        if !self.is_enabled() || !self.config.enable_batching {
            self.counters
                .direct_requests
                .fetch_add(count, Ordering::Relaxed);
            let ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();
            let responses = self.track(ctx.run(batch_fn(ctx.clone(), requests)).await.map_err(Error::from))?;
            return Ok(in_request_order(&ids, responses));
        }

        let batch_fn = match self.limiter(service) {
            Some(limiter) => throttled(limiter, batch_fn),
            None => batch_fn,
        };

        let optimizers = self.service(service);
        let tickets = requests
            .into_iter()
            .map(|request| optimizers.batcher.submit(batch_key, request, batch_fn.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut responses = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            responses.push(self.track(ticket.wait(ctx).await)?);
        }
        self.counters
            .batched_requests
            .fetch_add(count, Ordering::Relaxed);
        Ok(responses)
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn update_rate_limits(
        &self,
        service: &str,
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    ) -> bool {
        self.limiters
            .get(service)
            .update_limits(limit, remaining, reset_at)
    }

    pub fn set_retry_after(&self, service: &str, duration: Duration) {
        self.limiters.get(service).set_retry_after(duration);
    }

    /// Feed quota headers from a response back into the service's limiter.
    pub fn observe_headers(&self, service: &str, headers: &HeaderMap) -> bool {
        self.limiters.get(service).observe(headers)
    }

    #[must_use]
    pub fn rate_limit_status(&self, service: &str) -> RateLimitStatus {
        self.limiters.get(service).status()
    }

    #[must_use]
    pub fn stats(&self) -> OptimizerStats {
        let counters = &self.counters;
        let total_requests = counters.total_requests.load(Ordering::Relaxed);
        let deduplicated_requests = counters.deduplicated_requests.load(Ordering::Relaxed);

        // Upstream calls saved by batching: every batched request beyond
        // the first of its batch.
        let batch_savings: u64 = self
            .services
            .iter()
            .map(|entry| {
                let stats = entry.value().batcher.stats();
                stats.requests_batched.saturating_sub(stats.batches_flushed)
            })
            .sum();

        OptimizerStats {
            total_requests,
            deduplicated_requests,
            batched_requests: counters.batched_requests.load(Ordering::Relaxed),
            rate_limited_requests: counters.rate_limited_requests.load(Ordering::Relaxed),
            direct_requests: counters.direct_requests.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            efficiency_gain: if total_requests == 0 {
                0.0
            } else {
                (deduplicated_requests + batch_savings) as f64 / total_requests as f64 * 100.0
            },
        }
    }

    #[must_use]
    pub fn detailed_stats(&self) -> DetailedStats {
        let mut services: Vec<ServiceStats> = self
            .services
            .iter()
            .map(|entry| {
                let service = entry.key().clone();
                let rate_limit = self.config.enable_rate_limit.then(|| {
                    let limiter = self.limiters.get(&service);
                    (limiter.status(), limiter.stats())
                });
                ServiceStats {
                    dedup: entry.value().dedup.stats(),
                    batch: entry.value().batcher.stats(),
                    rate_limit,
                    service,
                }
            })
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        DetailedStats {
            overall: self.stats(),
            services,
        }
    }

    /// Flush open batches and drop cached results.
    pub async fn stop(&self) {
        let optimizers: Vec<Arc<ServiceOptimizers>> =
            self.services.iter().map(|e| e.value().clone()).collect();
        for service in optimizers {
            service.batcher.stop().await;
            service.dedup.clear();
        }
        debug!("optimization manager stopped");
    }
}

/// Wrap `inner` so every flush first waits for quota.
fn throttled(limiter: Arc<RateLimiter>, inner: BatchFn) -> BatchFn {
    batch_fn(move |ctx: Context, requests: Vec<BatchRequest>| {
        let limiter = limiter.clone();
        let inner = inner.clone();
        async move {
            if let Err(err) = limiter.wait(&ctx).await {
                let message = err.to_string();
                return requests
                    .into_iter()
                    .map(|r| BatchResponse::failure(r.id, message.clone()))
                    .collect::<Vec<_>>();
            }
            inner(ctx, requests).await
        }
    })
}

fn in_request_order(ids: &[String], responses: Vec<BatchResponse>) -> Vec<BatchResponse> {
    let by_id: HashMap<String, BatchResponse> = responses
        .into_iter()
        .map(|response| (response.id.clone(), response))
        .collect();
    ids.iter()
        .map(|id| {
            by_id
                .get(id)
                .cloned()
                .unwrap_or_else(|| BatchResponse::failure(id.clone(), "no response returned"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    fn manager() -> OptimizationManager {
        OptimizationManager::new(OptimizerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_execute_deduplicates_concurrent_calls() {
        let manager = Arc::new(manager());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .execute(OptimizedRequest::new("github", "get_repo", "org/a"), move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, anyhow::Error>(42u64)
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut deduplicated = 0;
        for handle in handles {
            let response = handle.await.unwrap();
            assert_eq!(response.data, 42);
            if response.was_deduplicated {
                deduplicated += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(deduplicated, 7);
        assert_eq!(manager.stats().deduplicated_requests, 7);
        assert!(manager.stats().efficiency_gain > 0.0);
    }

    #[tokio::test]
    async fn test_disabled_manager_calls_through() {
        let manager = manager();
        manager.disable();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let response = manager
                .execute(OptimizedRequest::new("github", "op", "k"), move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>("x")
                })
                .await
                .unwrap();
            assert!(!response.was_deduplicated && !response.was_batched && !response.was_rate_limited);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.stats().direct_requests, 3);
    }

    #[tokio::test]
    async fn test_execute_consumes_one_quota_unit_per_real_call() {
        let manager = manager();
        for _ in 0..5 {
            manager
                .execute(OptimizedRequest::new("github", "op", "same"), |_| async {
                    Ok::<_, anyhow::Error>(1u8)
                })
                .await
                .unwrap();
        }
        assert_eq!(manager.rate_limit_status("github").remaining, 4999);
    }

    #[tokio::test]
    async fn test_cancelled_request_skips_limiter_and_work() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let ctx = Context::background();
        ctx.cancel();

        let err = manager
            .execute(
                OptimizedRequest::new("github", "op", "k").with_context(ctx),
                move |_| async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(1u8)
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(manager.rate_limit_status("github").remaining, 5000);
    }

    #[tokio::test]
    async fn test_errors_counted() {
        let manager = manager();
        let result = manager
            .execute(OptimizedRequest::new("gitlab", "op", "k"), |_| async {
                Err::<u8, _>(anyhow::anyhow!("404"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_execute_batch_preserves_request_order() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let reverse = batch_fn(move |_ctx, requests: Vec<BatchRequest>| {
            counted.fetch_add(1, Ordering::SeqCst);
            async move {
                requests
                    .into_iter()
                    .rev()
                    .map(|r| BatchResponse::ok(r.id.clone(), json!(r.id)))
                    .collect::<Vec<_>>()
            }
        });

        let requests: Vec<_> = (0..5)
            .map(|i| BatchRequest::new(format!("id{i}"), json!(null)))
            .collect();
        let responses = manager
            .execute_batch(&Context::background(), "github", "branches", requests, reverse)
            .await
            .unwrap();

        let ids: Vec<_> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["id0", "id1", "id2", "id3", "id4"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().batched_requests, 5);
    }

    #[test]
    fn test_update_rate_limits_reaches_service_limiter() {
        let manager = manager();
        let reset_at = Utc::now() + chrono::Duration::seconds(300);
        assert!(manager.update_rate_limits("github", 5000, 10, reset_at));
        let status = manager.rate_limit_status("github");
        assert_eq!((status.limit, status.remaining), (5000, 10));
    }

    #[test]
    fn test_dedup_key_namespaces_service_and_operation() {
        let request = OptimizedRequest::new("github", "get_repo", "org/a");
        assert_eq!(request.dedup_key(), "github:get_repo:org/a");
    }

    #[tokio::test]
    async fn test_detailed_stats_lists_services() {
        let manager = manager();
        manager
            .execute(OptimizedRequest::new("gitea", "op", "k"), |_| async {
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();
        let detailed = manager.detailed_stats();
        assert_eq!(detailed.services.len(), 1);
        assert_eq!(detailed.services[0].service, "gitea");
        assert!(detailed.to_string().contains("gitea"));
    }
}
