//! Handler for the `config` command group.

use std::path::Path;

use crate::cli::output;
use crate::config::Config;
use crate::error::Result;

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// Execute `config show`.
pub fn execute_show(path: &Path) -> Result<()> {
    let config = Config::load_or_default(path)?;

    output::section("Effective Configuration");
    if path.exists() {
        output::field("Path", path.display());
    } else {
        output::note(&format!("{} not found, showing defaults", path.display()));
    }
    output::field("Log level", &config.logging.level);
    output::field("Log format", &config.logging.format);

    let optimizer = &config.optimizer;
    output::section("Optimizer");
    output::field("Deduplication", on_off(optimizer.enable_deduplication));
    output::field("Batching", on_off(optimizer.enable_batching));
    output::field("Rate limiting", on_off(optimizer.enable_rate_limit));
    output::field("Dedup TTL", format!("{}ms", optimizer.deduplication_ttl_ms));
    output::field("Max batch size", optimizer.batch.max_batch_size);
    output::field("Flush interval", format!("{}ms", optimizer.batch.flush_interval_ms));
    let mut services: Vec<_> = optimizer.rate_limits.iter().collect();
    services.sort_by(|a, b| a.0.cmp(b.0));
    for (service, limits) in services {
        output::field(
            &format!("Quota {service}"),
            format!("{} per {}s", limits.initial_limit, limits.window_secs),
        );
    }

    let queue = &config.queue;
    output::section("Work Queue");
    output::field("Name", &queue.name);
    output::field("Workers", queue.workers);
    output::field(
        "Capacity",
        format!(
            "high {} / normal {} / low {}",
            queue.high_capacity, queue.normal_capacity, queue.low_capacity
        ),
    );
    output::field("Retry", on_off(queue.enable_retry));
    if queue.enable_retry {
        output::field("Max retries", queue.max_retries);
        output::field(
            "Retry delay",
            format!("{}ms - {}ms", queue.retry_base_delay_ms, queue.retry_max_delay_ms),
        );
    }
    output::field("Job timeout", format!("{}s", queue.job_timeout_secs));

    let bus = &config.event_bus;
    output::section("Event Bus");
    output::field("Buffer size", bus.buffer_size);
    output::field("Subscriber buffer", bus.subscriber_buffer_size);
    output::field("Overflow", format!("{:?}", bus.overflow_policy));

    let connection = &config.connection;
    output::section("Connection");
    output::field("Idle per host", connection.effective_idle_per_host());
    output::field("Request timeout", format!("{}s", connection.request_timeout_secs));
    output::field("Max retries", connection.retry.max_retries);
    output::field(
        "Retryable statuses",
        connection
            .retry
            .retryable_status_codes
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    );
    Ok(())
}

/// Execute `config validate`.
pub fn execute_validate(path: &Path) -> Result<()> {
    output::section("Config Validation");
    output::field("Path", path.display());

    let config = Config::load(path)?;
    output::success("Config file is valid");

    let mut warnings = Vec::new();
    if !config.optimizer.enable_deduplication
        && !config.optimizer.enable_batching
        && !config.optimizer.enable_rate_limit
    {
        warnings.push("Every optimization is disabled".to_string());
    }
    if config.queue.workers > num_cpus::get() * 8 {
        warnings.push(format!(
            "{} workers on {} CPUs",
            config.queue.workers,
            num_cpus::get()
        ));
    }
    if config.connection.retry.max_retries == 0 {
        warnings.push("HTTP retries are disabled".to_string());
    }
    if !warnings.is_empty() {
        output::section("Warnings");
        for warning in &warnings {
            output::warning(warning);
        }
    }

    output::hint(&format!("apiflow config show -c {}", path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, Error};

    #[test]
    fn test_validate_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute_validate(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ReadFile(_))));
    }

    #[test]
    fn test_show_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(execute_show(&dir.path().join("absent.toml")).is_ok());
    }
}
