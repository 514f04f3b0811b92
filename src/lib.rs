//! apiflow - request optimization and async execution for bulk API work.
//!
//! The crate bundles the pieces a tool needs when it talks to rate-limited
//! HTTP APIs at volume:
//!
//! - [`optimizer`] - deduplication of identical in-flight calls, batching of
//!   single-item lookups and adaptive, header-driven rate limiting behind
//!   one [`OptimizationManager`](optimizer::OptimizationManager)
//! - [`queue`] - a priority work queue with bounded lanes, retries with
//!   jittered backoff and per-job timeouts
//! - [`bus`] - publish/subscribe events with sync and async delivery
//! - [`connection`] - a pooled HTTP client that retries transient failures
//! - [`aio`] - bounded-concurrency file and HTTP operations
//! - [`pipeline`] - bulk runs combining the queue, the bus and async I/O
//!
//! Cancellation and deadlines flow through [`context::Context`].
//!
//! # Example
//!
//! ```no_run
//! use apiflow::config::OptimizerConfig;
//! use apiflow::optimizer::{OptimizationManager, OptimizedRequest};
//!
//! # async fn demo() -> apiflow::Result<()> {
//! let manager = OptimizationManager::new(OptimizerConfig::default())?;
//! let response = manager
//!     .execute(OptimizedRequest::new("github", "get_repo", "rust-lang/rust"), |_ctx| async {
//!         Ok::<_, anyhow::Error>("main".to_string())
//!     })
//!     .await?;
//! assert!(!response.was_deduplicated);
//! # Ok(())
//! # }
//! ```

pub mod aio;
pub mod bus;
pub mod cli;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod optimizer;
pub mod pipeline;
pub mod queue;

mod stats;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use error::{Error, Result};
