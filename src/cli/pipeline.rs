//! File transformation pipeline.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tabled::Tabled;

use super::command::PipelineArgs;
use super::output;
use crate::aio::AsyncIo;
use crate::bus::EventBus;
use crate::config::{EventBusConfig, WorkQueueConfig};
use crate::context::Context;
use crate::error::Result;
use crate::pipeline::{output_path, BulkReport, BulkRunner, Progress};

#[derive(Tabled, Serialize)]
struct FailureRow {
    #[tabled(rename = "File")]
    file: String,
    #[tabled(rename = "Error")]
    error: String,
}

fn transform(uppercase: bool) -> impl Fn(&Path, Vec<u8>) -> anyhow::Result<Vec<u8>> + Send + Sync {
    move |_path: &Path, data: Vec<u8>| {
        if uppercase {
            Ok(data.to_ascii_uppercase())
        } else {
            Ok(data)
        }
    }
}

pub async fn execute(
    ctx: &Context,
    args: PipelineArgs,
    queue_config: WorkQueueConfig,
    bus_config: EventBusConfig,
) -> Result<()> {
    output::header(env!("CARGO_PKG_VERSION"));
    output::section(&format!("Processing {} files", args.paths.len()));

    let bus = Arc::new(EventBus::new(bus_config)?);
    let io = AsyncIo::new(num_cpus::get().max(1) * 2, None)?;
    let pb = output::progress_bar(args.paths.len() as u64, "Files");
    let progress = pb.clone();
    let runner = BulkRunner::new(queue_config, bus.clone(), io).with_progress(Arc::new(
        move |Progress { done, .. }| progress.set_position(done as u64),
    ));

    for path in &args.paths {
        output::note(&format!(
            "{} -> {}",
            path.display(),
            output_path(path, &args.suffix).display()
        ));
    }

    let report = runner
        .process_files(ctx, args.paths, &args.suffix, transform(args.uppercase))
        .await;
    bus.close().await;
    let report = report?;

    finish(&pb, &report);
    Ok(())
}

fn finish(pb: &indicatif::ProgressBar, report: &BulkReport) {
    if report.is_clean() {
        output::spinner_success(pb, &report.to_string());
        return;
    }
    output::spinner_fail(pb, &report.to_string());
    let rows: Vec<FailureRow> = report
        .failures
        .iter()
        .map(|failure| FailureRow {
            file: failure.id.trim_start_matches("file:").to_string(),
            error: failure.error.clone(),
        })
        .collect();
    output::table("failures", &rows);
}
