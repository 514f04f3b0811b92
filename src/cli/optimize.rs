//! Request optimizer demonstrations against a simulated upstream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tabled::Tabled;

use super::command::{Demo, OptimizeArgs, Optimization};
use super::output;
use crate::config::{OptimizerConfig, RateLimitConfig};
use crate::context::Context;
use crate::error::Result;
use crate::optimizer::{
    batch_fn, BatchFn, BatchRequest, BatchResponse, DetailedStats, OptimizationManager,
    OptimizedRequest, RepositoryBatcher,
};

/// Distinct keys the dedup demo spreads its requests over.
const DISTINCT_KEYS: usize = 5;
const UPSTREAM_LATENCY: Duration = Duration::from_millis(40);

#[derive(Tabled, Serialize)]
struct MetricRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled, Serialize)]
struct ServiceRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Executions")]
    executions: u64,
    #[tabled(rename = "Shared")]
    shared: u64,
    #[tabled(rename = "Cache Hits")]
    cache_hits: u64,
    #[tabled(rename = "Batches")]
    batches: u64,
    #[tabled(rename = "Avg Batch")]
    average_batch: String,
    #[tabled(rename = "Quota")]
    quota: String,
    #[tabled(rename = "Throttled")]
    throttled: u64,
}

/// Run the selected demo and print optimizer statistics.
pub async fn execute(ctx: &Context, args: OptimizeArgs, mut config: OptimizerConfig) -> Result<()> {
    apply_overrides(&mut config, &args);
    let manager = Arc::new(OptimizationManager::new(config)?);
    let upstream = Arc::new(AtomicUsize::new(0));

    output::header(env!("CARGO_PKG_VERSION"));
    output::section(&format!("Optimizer demo: {}", demo_name(args.demo)));
    let pb = output::spinner(&format!("Sending {} requests", args.requests));
    let started = Instant::now();

    let result = match args.demo {
        Demo::Dedup => {
            let keys = (0..args.requests)
                .map(|i| format!("repo-{}", i % DISTINCT_KEYS))
                .collect();
            fetch_all(ctx, &manager, &args.service, keys, &upstream).await
        }
        Demo::Batch => lookup_users(ctx, &manager, &args.service, args.requests, &upstream).await,
        Demo::RateLimit => {
            let keys = (0..args.requests).map(|i| format!("item-{i}")).collect();
            fetch_all(ctx, &manager, &args.service, keys, &upstream).await
        }
        Demo::Combined => combined(ctx, &manager, &args.service, args.requests, &upstream).await,
    };
    manager.stop().await;

    let elapsed = started.elapsed();
    if let Err(err) = result {
        output::spinner_fail(&pb, "Demo failed");
        return Err(err);
    }
    output::spinner_success(&pb, &format!("{} requests in {}", args.requests, output::millis(elapsed)));

    output::field("Upstream calls", upstream.load(Ordering::Relaxed));
    print_stats(&manager.detailed_stats());
    Ok(())
}

fn demo_name(demo: Demo) -> &'static str {
    match demo {
        Demo::Dedup => "deduplication",
        Demo::Batch => "batching",
        Demo::RateLimit => "rate limiting",
        Demo::Combined => "combined",
    }
}

fn apply_overrides(config: &mut OptimizerConfig, args: &OptimizeArgs) {
    for optimization in &args.disable {
        match optimization {
            Optimization::Dedup => config.enable_deduplication = false,
            Optimization::Batch => config.enable_batching = false,
            Optimization::Ratelimit => config.enable_rate_limit = false,
        }
    }
    if let Some(size) = args.batch_size {
        config.batch.max_batch_size = size;
    }
    if let Some(ttl) = args.ttl_ms {
        config.deduplication_ttl_ms = ttl;
    }
    if args.demo == Demo::RateLimit {
        // A quota small enough that the run drops below the low-water mark.
        config.rate_limits.insert(
            args.service.clone(),
            RateLimitConfig {
                initial_limit: u32::try_from(args.requests.max(1)).unwrap_or(u32::MAX),
                window_secs: 2,
                low_water_ratio: 0.5,
                max_backoff_ms: 100,
                adaptive: true,
            },
        );
    }
}

async fn fetch_all(
    ctx: &Context,
    manager: &Arc<OptimizationManager>,
    service: &str,
    keys: Vec<String>,
    upstream: &Arc<AtomicUsize>,
) -> Result<()> {
    let calls = keys.into_iter().map(|key| {
        let upstream = upstream.clone();
        let request =
            OptimizedRequest::new(service, "get", key.clone()).with_context(ctx.clone());
        manager.execute(request, move |work_ctx| async move {
            upstream.fetch_add(1, Ordering::Relaxed);
            work_ctx.sleep(UPSTREAM_LATENCY).await?;
            Ok::<_, anyhow::Error>(json!({ "key": key }))
        })
    });
    for result in join_all(calls).await {
        result?;
    }
    Ok(())
}

fn simulated_lookup(upstream: Arc<AtomicUsize>) -> BatchFn {
    batch_fn(move |ctx: Context, requests: Vec<BatchRequest>| {
        let upstream = upstream.clone();
        async move {
            upstream.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = ctx.sleep(UPSTREAM_LATENCY).await {
                let message = err.to_string();
                return requests
                    .into_iter()
                    .map(|request| BatchResponse::failure(request.id, message.clone()))
                    .collect();
            }
            requests
                .into_iter()
                .map(|request| {
                    let data = json!({ "query": request.payload, "default_branch": "main" });
                    BatchResponse::ok(request.id, data)
                })
                .collect::<Vec<_>>()
        }
    })
}

async fn lookup_users(
    ctx: &Context,
    manager: &Arc<OptimizationManager>,
    service: &str,
    requests: usize,
    upstream: &Arc<AtomicUsize>,
) -> Result<()> {
    let lookup = simulated_lookup(upstream.clone());
    let calls = (0..requests).map(|i| {
        let request = BatchRequest::new(format!("user-{i}"), json!({ "user": i }));
        manager.execute_batch(ctx, service, "users", vec![request], lookup.clone())
    });
    for result in join_all(calls).await {
        for response in result? {
            response.into_result()?;
        }
    }
    Ok(())
}

async fn combined(
    ctx: &Context,
    manager: &Arc<OptimizationManager>,
    service: &str,
    requests: usize,
    upstream: &Arc<AtomicUsize>,
) -> Result<()> {
    let keys = (0..requests / 2)
        .map(|i| format!("repo-{}", i % DISTINCT_KEYS))
        .collect();
    let repos: Vec<String> = (0..requests - requests / 2)
        .map(|i| format!("repo-{i}"))
        .collect();

    let batcher = RepositoryBatcher::new(manager.clone(), service);
    let lookup = simulated_lookup(upstream.clone());
    let (fetched, branches) = tokio::join!(
        fetch_all(ctx, manager, service, keys, upstream),
        batcher.default_branches(ctx, "acme", &repos, lookup),
    );
    fetched?;
    output::field("Default branches", branches?.len());

    // Report the quota the simulated upstream would have returned.
    let quota = RateLimitConfig::preset(service);
    let used = u32::try_from(upstream.load(Ordering::Relaxed)).unwrap_or(u32::MAX);
    let reset_at = Utc::now() + chrono::Duration::seconds(quota.window_secs as i64);
    manager.update_rate_limits(
        service,
        quota.initial_limit,
        quota.initial_limit.saturating_sub(used),
        reset_at,
    );
    Ok(())
}

fn print_stats(stats: &DetailedStats) {
    let overall = &stats.overall;
    let rows = vec![
        MetricRow {
            metric: "Total requests",
            value: overall.total_requests.to_string(),
        },
        MetricRow {
            metric: "Deduplicated",
            value: overall.deduplicated_requests.to_string(),
        },
        MetricRow {
            metric: "Batched",
            value: overall.batched_requests.to_string(),
        },
        MetricRow {
            metric: "Rate limited",
            value: overall.rate_limited_requests.to_string(),
        },
        MetricRow {
            metric: "Direct",
            value: overall.direct_requests.to_string(),
        },
        MetricRow {
            metric: "Errors",
            value: overall.errors.to_string(),
        },
        MetricRow {
            metric: "Efficiency gain",
            value: format!("{:.1}%", overall.efficiency_gain),
        },
    ];
    output::section("Overall");
    output::table("overall", &rows);

    if stats.services.is_empty() {
        return;
    }
    let rows: Vec<ServiceRow> = stats
        .services
        .iter()
        .map(|service| {
            let (quota, throttled) = match &service.rate_limit {
                Some((status, limiter)) => (
                    format!("{}/{}", status.remaining, status.limit),
                    limiter.throttled_requests,
                ),
                None => ("-".to_string(), 0),
            };
            ServiceRow {
                service: service.service.clone(),
                executions: service.dedup.executions,
                shared: service.dedup.deduplicated_calls,
                cache_hits: service.dedup.cache_hits,
                batches: service.batch.batches_flushed,
                average_batch: format!("{:.1}", service.batch.average_batch_size),
                quota,
                throttled,
            }
        })
        .collect();
    output::section("Services");
    output::table("services", &rows);
}
