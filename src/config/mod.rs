//! Configuration modules.
//!
//! Each component takes its own config struct; [`settings::Config`] groups
//! them for loading from a single TOML file.

pub mod bus;
pub mod connection;
pub mod logging;
pub mod optimizer;
pub mod queue;
pub mod settings;

pub use bus::{EventBusConfig, OverflowPolicy};
pub use connection::{ConnectionPolicy, RetryPolicy};
pub use logging::LoggingConfig;
pub use optimizer::{BatchConfig, OptimizerConfig, RateLimitConfig};
pub use queue::WorkQueueConfig;
pub use settings::Config;

use crate::error::ConfigError;

pub(crate) fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

pub(crate) fn require_ratio(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be between 0 and 1".to_string(),
        });
    }
    Ok(())
}
