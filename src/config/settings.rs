//! Application configuration loading and validation.
//!
//! Provides the main [`Config`] struct that aggregates all component
//! settings. Configuration is loaded from a TOML file; every section is
//! optional and falls back to defaults.
//!
//! # Example
//!
//! ```no_run
//! use apiflow::config::Config;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("apiflow.toml")?;
//!     config.init_logging();
//!     Ok(())
//! }
//! ```

use std::path::Path;

use serde::Deserialize;

use super::bus::EventBusConfig;
use super::connection::ConnectionPolicy;
use super::logging::LoggingConfig;
use super::optimizer::OptimizerConfig;
use super::queue::WorkQueueConfig;
use crate::error::{ConfigError, Result};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "APIFLOW_CONFIG";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "apiflow.toml";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging and tracing configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Deduplication, batching and rate limiting.
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Priority work queue.
    #[serde(default)]
    pub queue: WorkQueueConfig,

    /// Publish/subscribe event bus.
    #[serde(default)]
    pub event_bus: EventBusConfig,

    /// Pooled HTTP transport and retry policy.
    #[serde(default)]
    pub connection: ConnectionPolicy,
}

impl Config {
    /// Parse configuration from TOML content.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is malformed or validation fails.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the content is malformed,
    /// or validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse_toml(&content)
    }

    /// Load from `path` when it exists, otherwise use defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Path from [`CONFIG_PATH_ENV`], or [`DEFAULT_CONFIG_PATH`].
    #[must_use]
    pub fn default_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        self.queue.validate()?;
        self.event_bus.validate()?;
        self.connection.validate()?;
        Ok(())
    }

    /// Initialize the tracing subscriber with the logging configuration.
    pub fn init_logging(&self) {
        self.logging.init();
    }
}
