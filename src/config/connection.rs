//! HTTP connection pooling and retry configuration.

use std::time::Duration;

use serde::Deserialize;

use super::{require_positive, require_ratio};
use crate::error::ConfigError;

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    100
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_retryable_status_codes() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

/// Retry behaviour for transient HTTP failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on a single retry delay (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Random ± fraction applied to each delay.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Response statuses treated as transient.
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
}

impl RetryPolicy {
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_ratio("jitter_factor", self.jitter_factor)?;
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff_factor",
                reason: "must be >= 1.0".to_string(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "max_delay_ms",
                reason: "must be >= base_delay_ms".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_factor: default_jitter_factor(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

const fn default_max_idle_conns() -> usize {
    100
}

const fn default_max_idle_conns_per_host() -> usize {
    10
}

const fn default_idle_conn_timeout_secs() -> u64 {
    90
}

const fn default_keep_alive_secs() -> u64 {
    30
}

const fn default_connect_timeout_secs() -> u64 {
    30
}

const fn default_request_timeout_secs() -> u64 {
    60
}

/// Connection pool settings for the shared HTTP client.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionPolicy {
    /// Idle connections kept across all hosts.
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    /// Idle connections kept per host.
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    /// Idle connections are closed after this long (seconds).
    #[serde(default = "default_idle_conn_timeout_secs")]
    pub idle_conn_timeout_secs: u64,
    /// TCP keep-alive interval (seconds).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for a single attempt (seconds).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ConnectionPolicy {
    /// Per-host idle cap, never above the global cap.
    #[must_use]
    pub fn effective_idle_per_host(&self) -> usize {
        self.max_idle_conns_per_host.min(self.max_idle_conns)
    }

    #[must_use]
    pub fn idle_conn_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_conn_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("connect_timeout_secs", self.connect_timeout_secs)?;
        require_positive("request_timeout_secs", self.request_timeout_secs)?;
        self.retry.validate()
    }
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            max_idle_conns: default_max_idle_conns(),
            max_idle_conns_per_host: default_max_idle_conns_per_host(),
            idle_conn_timeout_secs: default_idle_conn_timeout_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retryable_statuses() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable_status(503));
        assert!(policy.is_retryable_status(429));
        assert!(!policy.is_retryable_status(404));
    }

    #[test]
    fn test_per_host_cap_bounded_by_global() {
        let policy = ConnectionPolicy {
            max_idle_conns: 4,
            max_idle_conns_per_host: 10,
            ..Default::default()
        };
        assert_eq!(policy.effective_idle_per_host(), 4);
    }

    #[test]
    fn test_jitter_out_of_range_rejected() {
        let policy = RetryPolicy {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
