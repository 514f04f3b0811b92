//! Synthetic work queue run with live progress.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tabled::Tabled;
use tracing::warn;

use super::command::QueueArgs;
use super::output;
use crate::bus::{handler_fn, Event, EventBus, TASK_COMPLETED, TASK_FAILED};
use crate::config::{EventBusConfig, WorkQueueConfig};
use crate::context::Context;
use crate::error::{Error, QueueError, Result};
use crate::queue::{Job, JobResult, Priority, QueueStats, WorkQueue};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Tabled, Serialize)]
struct StatRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Tabled, Serialize)]
struct FailureRow {
    #[tabled(rename = "Job")]
    job: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error")]
    error: String,
}

/// Build the synthetic job set: priorities cycle through every lane and
/// every `fail_every`-th job fails its first attempt.
pub(crate) fn synthetic_jobs(count: usize, fail_every: usize, work: Duration) -> Vec<Job> {
    (0..count)
        .map(|i| {
            let flaky = fail_every > 0 && (i + 1) % fail_every == 0;
            let attempts = Arc::new(AtomicU32::new(0));
            let priority = Priority::from_level((i % 10) as u8);
            Job::new(format!("job-{i:03}"), priority, move |ctx: Context| {
                let attempts = attempts.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    ctx.sleep(work).await?;
                    if flaky && attempt == 1 {
                        anyhow::bail!("simulated failure on attempt {attempt}");
                    }
                    Ok::<_, anyhow::Error>(())
                }
            })
        })
        .collect()
}

pub async fn execute(
    ctx: &Context,
    args: QueueArgs,
    mut config: WorkQueueConfig,
    bus_config: EventBusConfig,
) -> Result<()> {
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    let bus = Arc::new(EventBus::new(bus_config)?);
    let queue = WorkQueue::new(config, Some(bus.clone()))?;
    let mut results = queue.results()?;

    output::header(env!("CARGO_PKG_VERSION"));
    output::section(&format!("Work queue {}", output::highlight(queue.name())));

    let pb = output::progress_bar(args.jobs as u64, "Jobs");
    let source = queue.name().to_string();
    let mut subscriptions = Vec::with_capacity(2);
    for event_type in [TASK_COMPLETED, TASK_FAILED] {
        let pb = pb.clone();
        let source = source.clone();
        subscriptions.push(bus.subscribe(
            event_type,
            handler_fn(move |_ctx, event: Event| {
                if event.source == source {
                    pb.inc(1);
                }
                async { Ok::<_, anyhow::Error>(()) }
            }),
        )?);
    }

    let mut accepted = 0;
    for job in synthetic_jobs(args.jobs, args.fail_every, Duration::from_millis(args.work_ms)) {
        match queue.submit(job) {
            Ok(()) => accepted += 1,
            Err(err) => output::warning(&format!("job rejected: {err}")),
        }
    }

    let mut finished = Vec::with_capacity(accepted);
    while finished.len() < accepted {
        tokio::select! {
            result = results.recv() => match result {
                Some(result) => finished.push(result),
                None => break,
            },
            _ = ctx.done() => {
                output::warning("interrupted, stopping queue");
                break;
            }
        }
    }

    match queue.stop(STOP_TIMEOUT).await {
        Ok(()) => {}
        Err(Error::Queue(QueueError::StopTimeout { timeout_ms })) => {
            warn!(timeout_ms = timeout_ms as u64, "running jobs cancelled at shutdown");
        }
        Err(err) => return Err(err),
    }
    while let Some(result) = results.recv().await {
        finished.push(result);
    }
    for id in subscriptions {
        bus.unsubscribe(id);
    }
    bus.close().await;

    let stats = queue.stats();
    if stats.failed_jobs == 0 && stats.cancelled_jobs == 0 {
        output::spinner_success(&pb, &format!("{} jobs completed", stats.completed_jobs));
    } else {
        output::spinner_fail(
            &pb,
            &format!("{} of {} jobs did not complete", stats.failed_jobs, stats.total_jobs),
        );
    }

    output::table("queue", &stat_rows(&stats));
    let failures = failure_rows(&finished);
    if !failures.is_empty() {
        output::section("Failures");
        output::table("failures", &failures);
    }
    Ok(())
}

fn stat_rows(stats: &QueueStats) -> Vec<StatRow> {
    vec![
        StatRow {
            metric: "Submitted",
            value: stats.total_jobs.to_string(),
        },
        StatRow {
            metric: "Completed",
            value: stats.completed_jobs.to_string(),
        },
        StatRow {
            metric: "Failed",
            value: stats.failed_jobs.to_string(),
        },
        StatRow {
            metric: "Retries",
            value: stats.retried_jobs.to_string(),
        },
        StatRow {
            metric: "Cancelled",
            value: stats.cancelled_jobs.to_string(),
        },
        StatRow {
            metric: "Avg exec time",
            value: output::millis(stats.average_exec_time),
        },
        StatRow {
            metric: "Avg wait time",
            value: output::millis(stats.average_wait_time),
        },
    ]
}

fn failure_rows(results: &[JobResult]) -> Vec<FailureRow> {
    results
        .iter()
        .filter_map(|result| {
            result.error.as_ref().map(|error| FailureRow {
                job: result.job.id().to_string(),
                attempts: result.job.attempt(),
                error: error.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    #[test]
    fn test_synthetic_jobs_cycle_priorities() {
        let jobs = synthetic_jobs(10, 0, Duration::ZERO);
        let high = jobs.iter().filter(|j| j.priority() == Priority::High).count();
        let normal = jobs.iter().filter(|j| j.priority() == Priority::Normal).count();
        let low = jobs.iter().filter(|j| j.priority() == Priority::Low).count();
        assert_eq!((high, normal, low), (2, 4, 4));
        assert_eq!(jobs[3].id(), "job-003");
    }

    #[tokio::test]
    async fn test_flaky_jobs_succeed_on_retry() {
        let queue = WorkQueue::new(testkit::config::queue(2), None).unwrap();
        let mut results = queue.results().unwrap();
        for job in synthetic_jobs(6, 3, Duration::from_millis(1)) {
            queue.submit(job).unwrap();
        }
        let mut finished = Vec::new();
        while finished.len() < 6 {
            finished.push(results.recv().await.unwrap());
        }
        assert!(finished.iter().all(JobResult::is_success));
        assert_eq!(finished.iter().filter(|r| r.retried).count(), 2);
        assert!(failure_rows(&finished).is_empty());

        let stats = queue.stats();
        assert_eq!(stats.retried_jobs, 2);
        assert_eq!(stat_rows(&stats)[1].value, "6");
        queue.stop(Duration::from_secs(1)).await.unwrap();
    }
}
