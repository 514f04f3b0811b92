use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// The caller's own context ended while it was waiting.
///
/// Distinct from [`ExecutionError`]: the underlying work may still be
/// running for other callers, or may never have started.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Errors returned synchronously by a submitting call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("{lane} priority lane is full")]
    QueueFull { lane: &'static str },

    #[error("work queue is shutting down")]
    QueueStopped,

    #[error("event bus is closed")]
    BusClosed,

    #[error("batch processor is stopped")]
    BatcherStopped,
}

/// Failure of a piece of caller-supplied work, shared by every waiter.
///
/// Cloning is cheap: all waiters of one execution hold the same
/// underlying error.
#[derive(Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// Whether two handles point at the same failure.
    pub fn same_as(&self, other: &SharedError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedError {}

impl From<anyhow::Error> for SharedError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err)
    }
}

/// Execution-related errors with structured variants.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error(transparent)]
    Failed(SharedError),

    #[error("no response returned for batch request '{id}'")]
    MissingBatchResponse { id: String },

    #[error("batch request '{id}' failed: {message}")]
    BatchItem { id: String, message: String },

    #[error("shared execution was abandoned before completing")]
    Abandoned,

    #[error("cached payload for '{key}' has a different type")]
    PayloadType { key: String },
}

/// Work queue lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("results stream was already taken")]
    ResultsTaken,

    #[error("workers did not finish within {timeout_ms}ms; in-flight jobs were cancelled")]
    StopTimeout { timeout_ms: u128 },
}

/// HTTP transport errors raised by the connection manager.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("request body cannot be replayed for a retry")]
    BodyNotCloneable,

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the caller's context ended, as opposed to the work failing.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Context(_))
    }
}

impl From<SharedError> for Error {
    fn from(err: SharedError) -> Self {
        Error::Execution(ExecutionError::Failed(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_error_clones_point_at_same_failure() {
        let err = SharedError::new(anyhow::anyhow!("boom"));
        let copy = err.clone();
        assert!(err.same_as(&copy));
        assert_eq!(copy.to_string(), "boom");
    }

    #[test]
    fn test_cancellation_is_distinct_from_execution() {
        let cancelled: Error = ContextError::DeadlineExceeded.into();
        let failed: Error = SharedError::new(anyhow::anyhow!("nope")).into();
        assert!(cancelled.is_cancellation());
        assert!(!failed.is_cancellation());
    }

    #[test]
    fn test_submit_error_messages() {
        assert_eq!(
            SubmitError::QueueFull { lane: "high" }.to_string(),
            "high priority lane is full"
        );
        assert_eq!(SubmitError::BusClosed.to_string(), "event bus is closed");
    }
}
