//! Request optimizer configuration: deduplication, batching and rate limits.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use super::{require_positive, require_ratio};
use crate::error::ConfigError;

const fn default_true() -> bool {
    true
}

const fn default_deduplication_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

const fn default_max_dedup_entries() -> usize {
    10_000
}

const fn default_max_batch_size() -> usize {
    50
}

const fn default_flush_interval_ms() -> u64 {
    100
}

const fn default_batch_concurrency() -> usize {
    5
}

/// Batch accumulation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Flush as soon as a batch holds this many requests.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Flush a non-empty batch this long after its first request arrived (milliseconds).
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Maximum number of batch calls running at once.
    #[serde(default = "default_batch_concurrency")]
    pub concurrency: usize,
}

impl BatchConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("max_batch_size", self.max_batch_size as u64)?;
        require_positive("flush_interval_ms", self.flush_interval_ms)?;
        require_positive("concurrency", self.concurrency as u64)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            concurrency: default_batch_concurrency(),
        }
    }
}

fn default_low_water_ratio() -> f64 {
    0.1
}

/// Quota model for one remote service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Requests allowed per window before the first header update arrives.
    pub initial_limit: u32,
    /// Length of one quota window (seconds).
    pub window_secs: u64,
    /// Below `remaining / limit` of this ratio, requests are paced.
    #[serde(default = "default_low_water_ratio")]
    pub low_water_ratio: f64,
    /// Upper bound on a single pacing delay (milliseconds).
    pub max_backoff_ms: u64,
    /// Tune the pacing factor from observed quota history.
    #[serde(default = "default_true")]
    pub adaptive: bool,
}

impl RateLimitConfig {
    /// 5000 requests per hour.
    #[must_use]
    pub fn github() -> Self {
        Self {
            initial_limit: 5000,
            window_secs: 3600,
            low_water_ratio: default_low_water_ratio(),
            max_backoff_ms: 15 * 60 * 1000,
            adaptive: true,
        }
    }

    /// 2000 requests per minute.
    #[must_use]
    pub fn gitlab() -> Self {
        Self {
            initial_limit: 2000,
            window_secs: 60,
            low_water_ratio: default_low_water_ratio(),
            max_backoff_ms: 5 * 60 * 1000,
            adaptive: true,
        }
    }

    /// Conservative default; self-hosted instances vary.
    #[must_use]
    pub fn gitea() -> Self {
        Self {
            initial_limit: 1000,
            window_secs: 3600,
            low_water_ratio: default_low_water_ratio(),
            max_backoff_ms: 10 * 60 * 1000,
            adaptive: true,
        }
    }

    /// Built-in preset for `service`, falling back to the gitea values.
    #[must_use]
    pub fn preset(service: &str) -> Self {
        match service {
            "github" => Self::github(),
            "gitlab" => Self::gitlab(),
            _ => Self::gitea(),
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("initial_limit", u64::from(self.initial_limit))?;
        require_positive("window_secs", self.window_secs)?;
        require_ratio("low_water_ratio", self.low_water_ratio)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::gitea()
    }
}

/// Top-level request optimizer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_true")]
    pub enable_deduplication: bool,
    #[serde(default = "default_true")]
    pub enable_batching: bool,
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
    /// How long a completed result keeps satisfying identical requests (milliseconds).
    #[serde(default = "default_deduplication_ttl_ms")]
    pub deduplication_ttl_ms: u64,
    /// Cache size above which expired and then oldest entries are evicted.
    #[serde(default = "default_max_dedup_entries")]
    pub max_dedup_entries: usize,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Per-service overrides of the built-in rate limit presets.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl OptimizerConfig {
    #[must_use]
    pub fn deduplication_ttl(&self) -> Duration {
        Duration::from_millis(self.deduplication_ttl_ms)
    }

    /// Rate limit settings for `service`: override if configured, else preset.
    #[must_use]
    pub fn rate_limit_for(&self, service: &str) -> RateLimitConfig {
        self.rate_limits
            .get(service)
            .cloned()
            .unwrap_or_else(|| RateLimitConfig::preset(service))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("deduplication_ttl_ms", self.deduplication_ttl_ms)?;
        require_positive("max_dedup_entries", self.max_dedup_entries as u64)?;
        self.batch.validate()?;
        for limits in self.rate_limits.values() {
            limits.validate()?;
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enable_deduplication: true,
            enable_batching: true,
            enable_rate_limit: true,
            deduplication_ttl_ms: default_deduplication_ttl_ms(),
            max_dedup_entries: default_max_dedup_entries(),
            batch: BatchConfig::default(),
            rate_limits: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_fall_back_to_gitea() {
        assert_eq!(RateLimitConfig::preset("github").initial_limit, 5000);
        assert_eq!(RateLimitConfig::preset("gitlab").window_secs, 60);
        assert_eq!(RateLimitConfig::preset("bitbucket"), RateLimitConfig::gitea());
    }

    #[test]
    fn test_override_wins_over_preset() {
        let mut config = OptimizerConfig::default();
        let mut custom = RateLimitConfig::github();
        custom.initial_limit = 10;
        config.rate_limits.insert("github".into(), custom);
        assert_eq!(config.rate_limit_for("github").initial_limit, 10);
        assert_eq!(config.rate_limit_for("gitlab").initial_limit, 2000);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = BatchConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "max_batch_size",
                ..
            })
        ));
    }
}
