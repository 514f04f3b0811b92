//! Event bus configuration.

use std::time::Duration;

use serde::Deserialize;

use super::require_positive;
use crate::error::ConfigError;

/// What to discard when an asynchronous buffer is full.
///
/// Publishing never blocks, so one of the two ends of the buffer has to give.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest pending event to make room for the new one.
    #[default]
    DropOldest,
    /// Keep the backlog and discard the incoming event.
    DropNewest,
}

const fn default_buffer_size() -> usize {
    1000
}

const fn default_subscriber_buffer_size() -> usize {
    256
}

const fn default_true() -> bool {
    true
}

const fn default_close_timeout_ms() -> u64 {
    5_000
}

const fn default_handler_timeout_ms() -> u64 {
    30_000
}

/// Event bus settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    /// Capacity of the shared dispatch buffer fed by `publish_async`.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Capacity of each asynchronous subscriber's mailbox.
    #[serde(default = "default_subscriber_buffer_size")]
    pub subscriber_buffer_size: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Deliver pending events on close instead of discarding them.
    #[serde(default = "default_true")]
    pub drain_on_close: bool,
    /// Upper bound on draining during close (milliseconds).
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Per-invocation handler limit (milliseconds).
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

impl EventBusConfig {
    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("buffer_size", self.buffer_size as u64)?;
        require_positive("subscriber_buffer_size", self.subscriber_buffer_size as u64)?;
        require_positive("handler_timeout_ms", self.handler_timeout_ms)
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            subscriber_buffer_size: default_subscriber_buffer_size(),
            overflow_policy: OverflowPolicy::default(),
            drain_on_close: true,
            close_timeout_ms: default_close_timeout_ms(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}
