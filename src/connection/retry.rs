//! Retry decisions and backoff delays for HTTP attempts.

use std::time::Duration;

use rand::Rng;
use reqwest::{Method, StatusCode};

use crate::config::RetryPolicy;

/// What a single attempt produced.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    Status(StatusCode),
    Error(&'a reqwest::Error),
}

/// Decides whether a finished attempt should be repeated.
///
/// `attempt` is 1-based. The manager only asks while retries remain.
pub trait RetryDecision: Send + Sync {
    fn should_retry(&self, method: &Method, outcome: AttemptOutcome<'_>, attempt: u32) -> bool;
}

/// Retries transient network errors and the policy's retryable statuses.
/// Methods that are not idempotent are only retried when the connection
/// could not be established, since the server never saw the request.
#[derive(Debug, Clone)]
pub struct DefaultRetryDecision {
    retryable_status_codes: Vec<u16>,
}

impl DefaultRetryDecision {
    #[must_use]
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            retryable_status_codes: policy.retryable_status_codes.clone(),
        }
    }
}

impl RetryDecision for DefaultRetryDecision {
    fn should_retry(&self, method: &Method, outcome: AttemptOutcome<'_>, _attempt: u32) -> bool {
        match outcome {
            AttemptOutcome::Error(err) if !is_idempotent(method) => err.is_connect(),
            AttemptOutcome::Error(err) => is_transient(err),
            AttemptOutcome::Status(_) if !is_idempotent(method) => false,
            AttemptOutcome::Status(status) => self.retryable_status_codes.contains(&status.as_u16()),
        }
    }
}

pub(crate) fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Connect failures, timeouts and transport errors while sending.
pub(crate) fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}

/// Delay before retry `retry` (1-based): exponential growth from the base
/// delay, randomised by the jitter factor and capped at the maximum.
pub(crate) fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1) as i32;
    let mut delay_ms = policy.base_delay_ms as f64 * policy.backoff_factor.powi(exponent);
    if policy.jitter_factor > 0.0 {
        let spread = rand::thread_rng().gen_range(-1.0..=1.0);
        delay_ms += delay_ms * policy.jitter_factor * spread;
    }
    let capped = delay_ms.clamp(0.0, policy.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}
