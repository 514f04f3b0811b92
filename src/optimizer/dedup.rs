//! Request deduplication (singleflight plus a short-lived result cache).
//!
//! Concurrent callers asking for the same key share one execution of the
//! supplied work. Successful results stay cached for the configured TTL so
//! a burst of identical reads arriving just after completion is served
//! without touching the upstream API again.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures_util::FutureExt;
use tracing::{debug, trace};

use super::flight::{Flight, FlightTicket};
use crate::context::Context;
use crate::error::{ExecutionError, Result, SharedError};

type Payload = Arc<dyn Any + Send + Sync>;
type Outcome = std::result::Result<Payload, ExecutionError>;

enum Slot {
    InFlight(Arc<Flight<Outcome>>),
    Ready { payload: Payload, expires_at: Instant },
}

/// How a caller obtained its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupSource {
    /// This caller started the execution.
    Executed,
    /// This caller joined an execution that was already running.
    Joined,
    /// Served from the result cache.
    Cached,
}

#[derive(Debug, Clone)]
pub struct DedupOutcome<T> {
    pub value: T,
    pub source: DedupSource,
}

impl<T> DedupOutcome<T> {
    /// Followers and cache hits count as deduplicated; the executor does not.
    #[must_use]
    pub fn was_deduplicated(&self) -> bool {
        self.source != DedupSource::Executed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub total_requests: u64,
    pub deduplicated_calls: u64,
    pub cache_hits: u64,
    pub executions: u64,
    pub cache_size: usize,
}

#[derive(Default)]
struct DedupCounters {
    total_requests: AtomicU64,
    deduplicated_calls: AtomicU64,
    cache_hits: AtomicU64,
    executions: AtomicU64,
}

/// Thread-safe request deduplicator.
pub struct RequestDeduplicator {
    entries: Arc<DashMap<String, Slot>>,
    ttl: Duration,
    max_entries: usize,
    counters: DedupCounters,
}

enum Role {
    Executor(FlightTicket<Outcome>),
    Follower(FlightTicket<Outcome>),
    Hit(Payload),
}

impl RequestDeduplicator {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            counters: DedupCounters::default(),
        }
    }

    /// Run `f` at most once for every caller that shares `key`.
    ///
    /// The first caller spawns `f` on its own task with the flight's
    /// context; everyone, including that first caller, then waits for the
    /// shared result. A caller whose `ctx` ends stops waiting without
    /// disturbing the others. `f` is never invoked for an expired `ctx`.
    pub async fn execute<T, F, Fut>(&self, ctx: &Context, key: &str, f: F) -> Result<DedupOutcome<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        ctx.check()?;
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let (ticket, source) = match self.claim(key) {
            Role::Hit(payload) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .deduplicated_calls
                    .fetch_add(1, Ordering::Relaxed);
                trace!(key, "dedup cache hit");
                return Ok(DedupOutcome {
                    value: downcast(key, &payload)?,
                    source: DedupSource::Cached,
                });
            }
            Role::Follower(ticket) => {
                self.counters
                    .deduplicated_calls
                    .fetch_add(1, Ordering::Relaxed);
                trace!(key, waiters = ticket.flight().waiters(), "joining in-flight request");
                (ticket, DedupSource::Joined)
            }
            Role::Executor(ticket) => {
                self.counters.executions.fetch_add(1, Ordering::Relaxed);
                self.spawn_execution(key, ticket.flight().clone(), f);
                (ticket, DedupSource::Executed)
            }
        };

        if self.entries.len() > self.max_entries {
            self.gc();
        }

        let payload = ticket.wait(ctx).await??;
        Ok(DedupOutcome {
            value: downcast(key, &payload)?,
            source,
        })
    }

    /// Decide this caller's role under the map's shard lock.
    ///
    /// Executors and followers leave with a registered waiter ticket, so an
    /// in-flight entry cannot be abandoned between the claim and the wait.
    fn claim(&self, key: &str) -> Role {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                match occupied.get() {
                    Slot::Ready {
                        payload,
                        expires_at,
                    } if *expires_at > Instant::now() => return Role::Hit(payload.clone()),
                    Slot::InFlight(flight) => {
                        if let Some(ticket) = flight.join() {
                            return Role::Follower(ticket);
                        }
                    }
                    Slot::Ready { .. } => {}
                }
                let (flight, ticket) = Flight::start();
                occupied.insert(Slot::InFlight(flight));
                Role::Executor(ticket)
            }
            MapEntry::Vacant(vacant) => {
                let (flight, ticket) = Flight::start();
                vacant.insert(Slot::InFlight(flight));
                Role::Executor(ticket)
            }
        }
    }

    fn spawn_execution<T, F, Fut>(&self, key: &str, flight: Arc<Flight<Outcome>>, f: F)
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let entries = self.entries.clone();
        let ttl = self.ttl;
        let key = key.to_string();

        tokio::spawn(async move {
            let work_ctx = flight.context();
            let outcome: Outcome = match work_ctx
                .run(AssertUnwindSafe(f(work_ctx.clone())).catch_unwind())
                .await
            {
                Ok(Ok(Ok(value))) => Ok(Arc::new(value) as Payload),
                Ok(Ok(Err(err))) => Err(ExecutionError::Failed(SharedError::new(err))),
                Ok(Err(_panic)) => Err(ExecutionError::Failed(SharedError::new(
                    anyhow::anyhow!("request for '{key}' panicked"),
                ))),
                Err(_) => Err(ExecutionError::Abandoned),
            };

            // Publish to the cache before waking waiters so a caller that
            // arrives right after completion sees the cached value.
            let is_current =
                |slot: &Slot| matches!(slot, Slot::InFlight(current) if Arc::ptr_eq(current, &flight));
            match &outcome {
                Ok(payload) => {
                    if let Some(mut slot) = entries.get_mut(&key) {
                        if is_current(&*slot) {
                            *slot = Slot::Ready {
                                payload: payload.clone(),
                                expires_at: Instant::now() + ttl,
                            };
                        }
                    }
                }
                Err(err) => {
                    debug!(key = %key, error = %err, "deduplicated request failed");
                    entries.remove_if(&key, |_, slot| is_current(slot));
                }
            }

            flight.complete(outcome);
        });
    }

    /// Drop expired results, then the oldest ones while over capacity.
    pub fn gc(&self) {
        let now = Instant::now();
        self.entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::InFlight(flight) => !flight.is_abandoned() || flight.waiters() > 0,
        });

        if self.entries.len() > self.max_entries {
            let mut ready: Vec<(String, Instant)> = self
                .entries
                .iter()
                .filter_map(|entry| match entry.value() {
                    Slot::Ready { expires_at, .. } => Some((entry.key().clone(), *expires_at)),
                    Slot::InFlight(_) => None,
                })
                .collect();
            ready.sort_by(|a, b| a.1.cmp(&b.1));

            let to_remove = self.entries.len().saturating_sub(self.max_entries);
            for (key, _) in ready.into_iter().take(to_remove) {
                self.entries.remove(&key);
            }
        }
    }

    /// Forget every cached result. Running executions still finish for
    /// their current waiters.
    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            deduplicated_calls: self.counters.deduplicated_calls.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            executions: self.counters.executions.load(Ordering::Relaxed),
            cache_size: self.entries.len(),
        }
    }
}

fn downcast<T: Clone + 'static>(key: &str, payload: &Payload) -> Result<T> {
    payload
        .as_ref()
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| ExecutionError::PayloadType { key: key.to_string() }.into())
}
