//! Work queue configuration.

use std::time::Duration;

use serde::Deserialize;

use super::{require_positive, require_ratio};
use crate::error::ConfigError;

fn default_name() -> String {
    "default".into()
}

const fn default_workers() -> usize {
    5
}

const fn default_high_capacity() -> usize {
    100
}

const fn default_normal_capacity() -> usize {
    500
}

const fn default_low_capacity() -> usize {
    200
}

const fn default_true() -> bool {
    true
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

const fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_retry_jitter_factor() -> f64 {
    0.25
}

const fn default_job_timeout_secs() -> u64 {
    300
}

/// Priority work queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkQueueConfig {
    /// Label used in logs, events and stats output.
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of worker tasks pulling jobs.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Backlog bound of the high priority lane.
    #[serde(default = "default_high_capacity")]
    pub high_capacity: usize,
    /// Backlog bound of the normal priority lane.
    #[serde(default = "default_normal_capacity")]
    pub normal_capacity: usize,
    /// Backlog bound of the low priority lane.
    #[serde(default = "default_low_capacity")]
    pub low_capacity: usize,
    /// When false every job runs exactly once.
    #[serde(default = "default_true")]
    pub enable_retry: bool,
    /// Retries granted to jobs that do not set their own attempt budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry (milliseconds).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
    /// Cap on a single retry delay (milliseconds).
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Random ± fraction applied to each retry delay.
    #[serde(default = "default_retry_jitter_factor")]
    pub retry_jitter_factor: f64,
    /// Per-attempt execution limit (seconds).
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

impl WorkQueueConfig {
    /// Defaults under a custom name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Attempt budget for jobs that do not carry their own.
    #[must_use]
    pub fn default_max_attempts(&self) -> u32 {
        if self.enable_retry {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let delay_ms = self.retry_base_delay_ms as f64 * self.retry_backoff_factor.powi(exponent);
        Duration::from_millis(delay_ms.min(self.retry_max_delay_ms as f64) as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("workers", self.workers as u64)?;
        require_positive("high_capacity", self.high_capacity as u64)?;
        require_positive("normal_capacity", self.normal_capacity as u64)?;
        require_positive("low_capacity", self.low_capacity as u64)?;
        require_positive("job_timeout_secs", self.job_timeout_secs)?;
        require_ratio("retry_jitter_factor", self.retry_jitter_factor)?;
        if self.retry_backoff_factor < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry_backoff_factor",
                reason: "must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            workers: default_workers(),
            high_capacity: default_high_capacity(),
            normal_capacity: default_normal_capacity(),
            low_capacity: default_low_capacity(),
            enable_retry: true,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_backoff_factor: default_retry_backoff_factor(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter_factor: default_retry_jitter_factor(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let config = WorkQueueConfig {
            retry_base_delay_ms: 100,
            retry_backoff_factor: 2.0,
            retry_max_delay_ms: 350,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(3), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_disabled_means_single_attempt() {
        let config = WorkQueueConfig {
            enable_retry: false,
            ..Default::default()
        };
        assert_eq!(config.default_max_attempts(), 1);
        assert_eq!(WorkQueueConfig::default().default_max_attempts(), 4);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = WorkQueueConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
