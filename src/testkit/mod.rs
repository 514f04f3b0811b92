//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests).
//!
//! # Modules
//!
//! - [`server`] - `ScriptedServer`, a localhost HTTP server replaying
//!   scripted statuses and headers, plus `refused_url` for connect failures.
//! - [`counter`] - `CallCounter`, per-key invocation counts for work closures.
//! - [`config`] - Fast test configurations for every component.

pub mod config;
pub mod counter;
pub mod server;

pub use counter::CallCounter;
pub use server::{refused_url, ScriptedResponse, ScriptedServer};
