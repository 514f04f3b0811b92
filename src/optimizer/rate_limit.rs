//! Adaptive, quota-aware rate limiting.
//!
//! Each upstream service gets one [`RateLimiter`] tracking the quota the
//! service last reported: a limit, the units left in the current window
//! and when that window resets. Callers consume one unit per real request.
//! As the quota runs low, callers are spread out over the remaining window
//! instead of being released in a burst that would hit the hard limit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use tracing::{debug, trace};

use crate::config::{OptimizerConfig, RateLimitConfig};
use crate::context::Context;
use crate::error::Result;

const HISTORY_CAPACITY: usize = 100;
const ADAPT_SAMPLE: usize = 10;
const MAX_PACING_FACTOR: f64 = 3.0;
const MIN_PACING_FACTOR: f64 = 1.0;
const MIN_POLL: Duration = Duration::from_millis(1);

/// One quota report as received from the service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitWindow {
    pub observed_at: DateTime<Utc>,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Current quota as the limiter sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Time left on a server-imposed `Retry-After`, if one is active.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub adaptive_adjusts: u64,
    pub stale_updates: u64,
    pub average_wait: Duration,
    /// Share of requests that went through without any added delay.
    pub efficiency: f64,
    pub pacing_factor: f64,
    pub last_update: Option<DateTime<Utc>>,
}

/// What [`RateLimiter::wait`] did for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub waited: Duration,
    pub throttled: bool,
}

struct LimiterState {
    limit: u32,
    remaining: u32,
    reset_at: DateTime<Utc>,
    retry_until: Option<DateTime<Utc>>,
    /// Reset time of the last window the service reported. Local rollovers
    /// never touch it.
    server_reset_at: Option<DateTime<Utc>>,
    pacing_factor: f64,
    history: VecDeque<RateLimitWindow>,
    last_update: Option<DateTime<Utc>>,
}

impl LimiterState {
    fn initial(config: &RateLimitConfig) -> Self {
        Self {
            limit: config.initial_limit,
            remaining: config.initial_limit,
            reset_at: Utc::now() + to_chrono(config.window()),
            retry_until: None,
            server_reset_at: None,
            pacing_factor: MIN_PACING_FACTOR,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            last_update: None,
        }
    }
}

enum Decision {
    Proceed {
        pace: Duration,
        window: DateTime<Utc>,
    },
    Blocked { for_at_least: Duration },
}

#[derive(Default)]
struct WaitCounters {
    total_requests: AtomicU64,
    throttled_requests: AtomicU64,
    adaptive_adjusts: AtomicU64,
    stale_updates: AtomicU64,
    average_wait: Mutex<Duration>,
}

/// Per-service rate limiter.
pub struct RateLimiter {
    service: String,
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
    counters: WaitCounters,
}

impl RateLimiter {
    #[must_use]
    pub fn new(service: impl Into<String>, config: RateLimitConfig) -> Self {
        let state = LimiterState::initial(&config);
        Self {
            service: service.into(),
            config,
            state: Mutex::new(state),
            counters: WaitCounters::default(),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Block until the caller may issue one request, consuming one unit of
    /// quota.
    ///
    /// Returns early with the context's error if `ctx` ends while waiting;
    /// in that case no quota is consumed: a unit taken before a pacing delay
    /// is handed back.
    pub async fn wait(&self, ctx: &Context) -> Result<WaitOutcome> {
        ctx.check()?;
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let mut throttled = false;
        loop {
            match self.decide() {
                Decision::Proceed { pace, window } => {
                    if !pace.is_zero() {
                        throttled = true;
                        trace!(service = %self.service, pace_ms = pace.as_millis() as u64, "pacing request");
                        if let Err(err) = ctx.sleep(pace).await {
                            self.refund(window);
                            return Err(err.into());
                        }
                    }
                    break;
                }
                Decision::Blocked { for_at_least } => {
                    throttled = true;
                    trace!(
                        service = %self.service,
                        wait_ms = for_at_least.as_millis() as u64,
                        "quota exhausted, waiting"
                    );
                    ctx.sleep(for_at_least.max(MIN_POLL)).await?;
                }
            }
        }

        let waited = started.elapsed();
        if throttled {
            self.counters
                .throttled_requests
                .fetch_add(1, Ordering::Relaxed);
        }
        {
            let mut average = self.counters.average_wait.lock();
            *average = if average.is_zero() {
                waited
            } else {
                (*average + waited) / 2
            };
        }

        Ok(WaitOutcome { waited, throttled })
    }

    fn decide(&self) -> Decision {
        let now = Utc::now();
        let mut state = self.state.lock();

        if let Some(until) = state.retry_until {
            if until > now {
                return Decision::Blocked {
                    for_at_least: until_from(now, until),
                };
            }
            state.retry_until = None;
        }

        if now >= state.reset_at {
            state.remaining = state.limit;
            state.reset_at = now + to_chrono(self.config.window());
            trace!(service = %self.service, "rate limit window rolled over");
        }

        if state.remaining == 0 {
            return Decision::Blocked {
                for_at_least: until_from(now, state.reset_at),
            };
        }

        state.remaining -= 1;

        let ratio = if state.limit == 0 {
            0.0
        } else {
            f64::from(state.remaining) / f64::from(state.limit)
        };
        if ratio >= self.config.low_water_ratio {
            return Decision::Proceed {
                pace: Duration::ZERO,
                window: state.reset_at,
            };
        }

        let until_reset = until_from(now, state.reset_at);
        let share = until_reset.as_secs_f64() / f64::from(state.remaining + 1);
        let pace = Duration::from_secs_f64(share * state.pacing_factor).min(self.config.max_backoff());
        Decision::Proceed {
            pace,
            window: state.reset_at,
        }
    }

    /// Return a unit taken in `window` if that window is still current.
    fn refund(&self, window: DateTime<Utc>) {
        let mut state = self.state.lock();
        if state.reset_at == window && state.remaining < state.limit {
            state.remaining += 1;
        }
    }

    /// Apply a quota report from the service.
    ///
    /// Returns `false` when the report describes a window older than the
    /// one already known and was ignored.
    pub fn update_limits(&self, limit: u32, remaining: u32, reset_at: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let mut state = self.state.lock();

        if state.server_reset_at.is_some_and(|known| reset_at < known) {
            self.counters.stale_updates.fetch_add(1, Ordering::Relaxed);
            trace!(service = %self.service, "ignoring stale rate limit update");
            return false;
        }

        let remaining = remaining.min(limit);
        let same_window = state.server_reset_at == Some(reset_at);
        state.remaining = if same_window {
            state.remaining.min(remaining)
        } else {
            remaining
        };

        let limit_changed = limit != state.limit;
        state.limit = limit;
        state.reset_at = reset_at;
        state.server_reset_at = Some(reset_at);
        state.last_update = Some(now);

        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(RateLimitWindow {
            observed_at: now,
            limit,
            remaining,
            reset_at,
        });

        if self.config.adaptive && limit_changed {
            self.counters.adaptive_adjusts.fetch_add(1, Ordering::Relaxed);
            debug!(service = %self.service, limit, "rate limit changed");
        }
        if self.config.adaptive {
            adapt(&mut state);
        }

        true
    }

    /// Block every caller for `duration`, as requested by the service.
    pub fn set_retry_after(&self, duration: Duration) {
        let until = Utc::now() + to_chrono(duration);
        let mut state = self.state.lock();
        state.retry_until = Some(match state.retry_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        debug!(service = %self.service, retry_after_ms = duration.as_millis() as u64, "retry-after set");
    }

    /// Apply whatever quota information `headers` carry.
    pub fn observe(&self, headers: &HeaderMap) -> bool {
        let parsed = RateLimitHeaders::from_headers(headers);
        let mut applied = false;
        if let Some(retry_after) = parsed.retry_after {
            self.set_retry_after(retry_after);
            applied = true;
        }
        if let (Some(limit), Some(remaining), Some(reset_at)) =
            (parsed.limit, parsed.remaining, parsed.reset_at)
        {
            applied |= self.update_limits(limit, remaining, reset_at);
        }
        applied
    }

    /// Forget everything learned from the service.
    pub fn reset(&self) {
        *self.state.lock() = LimiterState::initial(&self.config);
    }

    #[must_use]
    pub fn status(&self) -> RateLimitStatus {
        let now = Utc::now();
        let state = self.state.lock();
        RateLimitStatus {
            limit: state.limit,
            remaining: state.remaining,
            reset_at: state.reset_at,
            retry_after: state
                .retry_until
                .filter(|until| *until > now)
                .map(|until| until_from(now, until)),
        }
    }

    #[must_use]
    pub fn history(&self) -> Vec<RateLimitWindow> {
        self.state.lock().history.iter().copied().collect()
    }

    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let total_requests = self.counters.total_requests.load(Ordering::Relaxed);
        let throttled_requests = self.counters.throttled_requests.load(Ordering::Relaxed);
        let (pacing_factor, last_update) = {
            let state = self.state.lock();
            (state.pacing_factor, state.last_update)
        };
        RateLimiterStats {
            total_requests,
            throttled_requests,
            adaptive_adjusts: self.counters.adaptive_adjusts.load(Ordering::Relaxed),
            stale_updates: self.counters.stale_updates.load(Ordering::Relaxed),
            average_wait: *self.counters.average_wait.lock(),
            efficiency: if total_requests == 0 {
                1.0
            } else {
                (total_requests - throttled_requests) as f64 / total_requests as f64
            },
            pacing_factor,
            last_update,
        }
    }
}

/// Tighten pacing when most recent windows ran nearly dry, relax it when
/// almost none did.
fn adapt(state: &mut LimiterState) {
    if state.history.len() < ADAPT_SAMPLE {
        return;
    }
    let starved = state
        .history
        .iter()
        .rev()
        .take(ADAPT_SAMPLE)
        .filter(|window| {
            window.limit == 0 || f64::from(window.remaining) / f64::from(window.limit) < 0.1
        })
        .count();

    if starved > ADAPT_SAMPLE / 2 {
        state.pacing_factor = (state.pacing_factor * 1.1).min(MAX_PACING_FACTOR);
    } else if starved < 2 {
        state.pacing_factor = (state.pacing_factor * 0.9).max(MIN_PACING_FACTOR);
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn until_from(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (then - now).to_std().unwrap_or(Duration::ZERO)
}

/// Quota information carried by a response.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parse `X-RateLimit-Limit`, `X-RateLimit-Remaining`,
    /// `X-RateLimit-Reset` (epoch seconds) and `Retry-After` (seconds or
    /// an HTTP date).
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
        };
        let number = |name: &str| text(name).and_then(|value| value.parse::<u64>().ok());

        let retry_after = text("retry-after").and_then(|value| match value.parse::<u64>() {
            Ok(secs) => Some(Duration::from_secs(secs)),
            Err(_) => DateTime::parse_from_rfc2822(value)
                .ok()
                .map(|at| until_from(Utc::now(), at.with_timezone(&Utc))),
        });

        Self {
            limit: number("x-ratelimit-limit").and_then(|n| u32::try_from(n).ok()),
            remaining: number("x-ratelimit-remaining").and_then(|n| u32::try_from(n).ok()),
            reset_at: number("x-ratelimit-reset")
                .and_then(|secs| i64::try_from(secs).ok())
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            retry_after,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Lazily created limiters, one per service name.
pub struct RateLimiterRegistry {
    overrides: HashMap<String, RateLimitConfig>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new(overrides: HashMap<String, RateLimitConfig>) -> Self {
        Self {
            overrides,
            limiters: DashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self::new(config.rate_limits.clone())
    }

    /// Limiter for `service`, created from its override or preset on first use.
    pub fn get(&self, service: &str) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.get(service) {
            return limiter.clone();
        }
        self.limiters
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| RateLimitConfig::preset(service));
                Arc::new(RateLimiter::new(service, config))
            })
            .clone()
    }

    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        services.sort();
        services
    }

    #[must_use]
    pub fn stats_all(&self) -> Vec<(String, RateLimiterStats)> {
        let mut all: Vec<(String, RateLimiterStats)> = self
            .limiters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset_all(&self) {
        for limiter in self.limiters.iter() {
            limiter.reset();
        }
    }
}
