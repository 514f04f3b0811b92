//! Pooled HTTP client with retry and backoff.
//!
//! [`ConnectionManager`] owns one `reqwest::Client` whose pool is sized from
//! [`ConnectionPolicy`], and repeats transient failures with exponential,
//! jittered backoff. Whether an attempt is repeated is decided by a
//! [`RetryDecision`]; the default retries network errors and the policy's
//! retryable statuses for idempotent methods.

mod retry;
mod stats;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Request, Response};
use tokio::time::Instant;
use tracing::{debug, trace};

pub use retry::{AttemptOutcome, DefaultRetryDecision, RetryDecision};
pub use stats::ConnectionStats;

use crate::config::ConnectionPolicy;
use crate::context::Context;
use crate::error::{ConnectionError, Result};
use retry::backoff_delay;
use stats::{ActiveRequest, Counters};

const MAX_REDIRECTS: usize = 10;

pub struct ConnectionManager {
    policy: ConnectionPolicy,
    client: Client,
    decision: Arc<dyn RetryDecision>,
    counters: Counters,
}

impl ConnectionManager {
    /// Build the pooled client described by `policy`.
    ///
    /// # Errors
    ///
    /// Fails when the policy is invalid or the TLS backend cannot be
    /// initialised.
    pub fn new(policy: ConnectionPolicy) -> Result<Self> {
        policy.validate()?;
        let client = Client::builder()
            .pool_max_idle_per_host(policy.effective_idle_per_host())
            .pool_idle_timeout(policy.idle_conn_timeout())
            .tcp_keepalive(Duration::from_secs(policy.keep_alive_secs))
            .connect_timeout(Duration::from_secs(policy.connect_timeout_secs))
            .timeout(Duration::from_secs(policy.request_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|err| ConnectionError::Client(err.to_string()))?;

        Ok(Self {
            decision: Arc::new(DefaultRetryDecision::new(&policy.retry)),
            policy,
            client,
            counters: Counters::default(),
        })
    }

    /// Replace the retry decision.
    #[must_use]
    pub fn with_retry_decision(mut self, decision: Arc<dyn RetryDecision>) -> Self {
        self.decision = decision;
        self
    }

    /// The pooled client, for requests that should bypass retries.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn policy(&self) -> &ConnectionPolicy {
        &self.policy
    }

    /// Send `request`, repeating transient failures.
    ///
    /// Makes up to `1 + max_retries` attempts. When retries run out on a
    /// retryable status, that last response is returned as `Ok`; when they
    /// run out on a network error, [`ConnectionError::RetriesExhausted`] is
    /// returned. A request whose body cannot be copied is sent once.
    ///
    /// # Errors
    ///
    /// The context's error if it ends during an attempt or a backoff wait,
    /// otherwise a [`ConnectionError`].
    pub async fn do_with_retry(&self, ctx: &Context, request: Request) -> Result<Response> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveRequest::enter(&self.counters.active);
        let started = Instant::now();

        let result = self.attempt_loop(ctx, request).await;
        let success = matches!(&result, Ok(response) if response.status().as_u16() < 400);
        self.counters.finish(success, started.elapsed());
        result
    }

    async fn attempt_loop(&self, ctx: &Context, request: Request) -> Result<Response> {
        let method = request.method().clone();
        let url = request.url().to_string();
        let max_attempts = if request.try_clone().is_some() {
            self.policy.retry.max_retries.saturating_add(1)
        } else {
            1
        };

        let mut pending = Some(request);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if attempt > 1 {
                let delay = backoff_delay(&self.policy.retry, attempt - 1);
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                trace!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                ctx.sleep(delay).await?;
            }

            let last = attempt >= max_attempts;
            let request = if last {
                pending.take()
            } else {
                pending.as_ref().and_then(Request::try_clone)
            }
            .ok_or(ConnectionError::BodyNotCloneable)?;

            match ctx.run(self.client.execute(request)).await? {
                Ok(response) => {
                    let status = response.status();
                    if !last && self.retry(&method, AttemptOutcome::Status(status), attempt) {
                        debug!(url = %url, status = status.as_u16(), attempt, "retryable status");
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if !last && self.retry(&method, AttemptOutcome::Error(&err), attempt) {
                        debug!(url = %url, error = %err, attempt, "transient request error");
                        continue;
                    }
                    if last && max_attempts > 1 {
                        return Err(ConnectionError::RetriesExhausted {
                            attempts: attempt,
                            source: err,
                        }
                        .into());
                    }
                    return Err(ConnectionError::Transport(err).into());
                }
            }
        }
    }

    fn retry(&self, method: &Method, outcome: AttemptOutcome<'_>, attempt: u32) -> bool {
        self.decision.should_retry(method, outcome, attempt)
    }

    /// GET `url` through [`do_with_retry`](Self::do_with_retry).
    pub async fn get(&self, ctx: &Context, url: &str) -> Result<Response> {
        let request = self
            .client
            .get(url)
            .build()
            .map_err(ConnectionError::Transport)?;
        self.do_with_retry(ctx, request).await
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }
}
