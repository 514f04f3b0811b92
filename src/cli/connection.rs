//! Requests through the retrying connection manager.

use std::time::Instant;

use serde::Serialize;
use tabled::Tabled;

use super::command::ConnectionArgs;
use super::output;
use crate::config::ConnectionPolicy;
use crate::connection::{ConnectionManager, ConnectionStats};
use crate::context::Context;
use crate::error::Result;

#[derive(Tabled, Serialize)]
struct RequestRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Bytes")]
    bytes: usize,
    #[tabled(rename = "Latency")]
    latency: String,
}

#[derive(Tabled, Serialize)]
struct StatRow {
    #[tabled(rename = "Metric")]
    metric: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

pub async fn execute(ctx: &Context, args: ConnectionArgs, policy: ConnectionPolicy) -> Result<()> {
    let manager = ConnectionManager::new(policy)?;

    output::header(env!("CARGO_PKG_VERSION"));
    output::section(&format!("GET {}", output::highlight(&args.url)));

    let mut rows = Vec::with_capacity(args.requests);
    for index in 1..=args.requests {
        let started = Instant::now();
        let (status, bytes) = match manager.get(ctx, &args.url).await {
            Ok(response) => {
                let status = response.status().to_string();
                let bytes = response.bytes().await.map(|body| body.len()).unwrap_or_default();
                (status, bytes)
            }
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => (err.to_string(), 0),
        };
        rows.push(RequestRow {
            index,
            status,
            bytes,
            latency: output::millis(started.elapsed()),
        });
    }

    output::table("requests", &rows);
    output::section("Connection stats");
    output::table("stats", &stat_rows(&manager.stats()));
    Ok(())
}

fn stat_rows(stats: &ConnectionStats) -> Vec<StatRow> {
    vec![
        StatRow {
            metric: "Requests",
            value: stats.total_requests.to_string(),
        },
        StatRow {
            metric: "Successful",
            value: stats.successful_requests.to_string(),
        },
        StatRow {
            metric: "Failed",
            value: stats.failed_requests.to_string(),
        },
        StatRow {
            metric: "Retries",
            value: stats.retry_attempts.to_string(),
        },
        StatRow {
            metric: "Avg latency",
            value: output::millis(stats.average_latency),
        },
    ]
}
