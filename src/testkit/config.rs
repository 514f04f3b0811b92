//! Canonical test configurations.
//!
//! Single source of truth for config structs used across tests.
//! Every delay is shrunk so tests never wait on production timings.

use crate::config::{
    BatchConfig, ConnectionPolicy, EventBusConfig, OptimizerConfig, RateLimitConfig, RetryPolicy,
    WorkQueueConfig,
};

/// Optimizer with a generous quota so rate limiting never paces.
pub fn optimizer() -> OptimizerConfig {
    let mut config = OptimizerConfig {
        deduplication_ttl_ms: 60_000,
        batch: batch(10, 20),
        ..Default::default()
    };
    config.rate_limits.insert("test".to_string(), rate_limit(10_000, 60));
    config
}

pub fn batch(max_batch_size: usize, flush_interval_ms: u64) -> BatchConfig {
    BatchConfig {
        max_batch_size,
        flush_interval_ms,
        concurrency: 4,
    }
}

/// Quota of `limit` requests per `window_secs`, with pacing capped at 50ms.
pub fn rate_limit(limit: u32, window_secs: u64) -> RateLimitConfig {
    RateLimitConfig {
        initial_limit: limit,
        window_secs,
        low_water_ratio: 0.1,
        max_backoff_ms: 50,
        adaptive: false,
    }
}

/// Work queue with millisecond retries and no jitter.
pub fn queue(workers: usize) -> WorkQueueConfig {
    WorkQueueConfig {
        workers,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        retry_jitter_factor: 0.0,
        ..WorkQueueConfig::named("test")
    }
}

pub fn event_bus() -> EventBusConfig {
    EventBusConfig {
        close_timeout_ms: 1_000,
        handler_timeout_ms: 1_000,
        ..Default::default()
    }
}

/// Connection policy retrying `max_retries` times with 1-4ms delays.
pub fn connection(max_retries: u32) -> ConnectionPolicy {
    ConnectionPolicy {
        connect_timeout_secs: 2,
        request_timeout_secs: 5,
        retry: RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter_factor: 0.0,
            ..Default::default()
        },
        ..Default::default()
    }
}
