//! Publish/subscribe event bus with sync and async delivery.
//!
//! Sync subscribers run inside the publisher's call, in subscription
//! order. Async subscribers each own a bounded mailbox and a task, so a
//! single handler always sees events in the order they were published
//! while slow handlers never hold up the publisher or each other.
//!
//! [`EventBus::publish_async`] never blocks. Events go into a bounded
//! dispatch buffer drained by a dispatcher task; when a buffer is full the
//! configured [`OverflowPolicy`](crate::config::OverflowPolicy) decides
//! which event is dropped, and the drop is counted in [`BusStats`].

mod event;
mod handler;
mod mailbox;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

pub use event::{Event, ANY, ERROR, FILE_PROCESSED, REQUEST_COMPLETED, TASK_COMPLETED, TASK_FAILED};
pub use handler::{handler_fn, EventHandler, Middleware, TracingMiddleware};

use crate::config::EventBusConfig;
use crate::context::Context;
use crate::error::{Result, SubmitError};
use mailbox::{Mailbox, Push};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Sync,
    Async,
}

struct Subscription {
    id: SubscriptionId,
    event_type: String,
    handler: Arc<dyn EventHandler>,
    /// Present for async subscriptions.
    mailbox: Option<Arc<Mailbox<Event>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BusStats {
    pub total_events: u64,
    pub processed_events: u64,
    pub failed_events: u64,
    pub dropped_events: u64,
    pub subscribers: usize,
    /// Events waiting in the dispatch buffer or in async mailboxes.
    pub pending_events: usize,
    pub average_handle_time: Duration,
}

#[derive(Default)]
struct BusCounters {
    total_events: AtomicU64,
    processed_events: AtomicU64,
    failed_events: AtomicU64,
    dropped_events: AtomicU64,
    average_handle_time: Mutex<Duration>,
}

struct Shared {
    config: EventBusConfig,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    dispatch: Mailbox<Event>,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: BusCounters,
    /// Handed to handlers running off the publisher's path; cancelled when
    /// a close runs out of time.
    shutdown: Context,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    subscribers: TaskTracker,
}

impl Shared {
    fn matching(&self, event: &Event) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .read()
            .iter()
            .filter(|sub| event.matches(&sub.event_type))
            .cloned()
            .collect()
    }

    async fn deliver(&self, ctx: &Context, event: &Event) {
        for subscription in self.matching(event) {
            match &subscription.mailbox {
                None => self.run_handler(ctx, &subscription.handler, event).await,
                Some(mailbox) => {
                    let outcome = mailbox.push(event.clone());
                    if outcome.dropped() {
                        self.counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                        trace!(subscription = subscription.id, "subscriber mailbox full, event dropped");
                    }
                }
            }
        }
    }

    async fn run_handler(&self, ctx: &Context, handler: &Arc<dyn EventHandler>, event: &Event) {
        let wrapped = {
            let middleware = self.middleware.read();
            handler::apply(&middleware, handler.clone())
        };

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.config.handler_timeout(), wrapped.handle(ctx, event)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(())) => {
                self.counters.processed_events.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                self.counters.failed_events.fetch_add(1, Ordering::Relaxed);
                debug!(event_type = %event.event_type, error = %err, "event handler failed");
            }
            Err(_) => {
                self.counters.failed_events.fetch_add(1, Ordering::Relaxed);
                debug!(event_type = %event.event_type, "event handler timed out");
            }
        }

        let mut average = self.counters.average_handle_time.lock();
        *average = if average.is_zero() {
            elapsed
        } else {
            (*average + elapsed) / 2
        };
    }
}

/// Event bus. Cheap to clone; clones share subscriptions and buffers.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Create a bus and start its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(config: EventBusConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            dispatch: Mailbox::new(config.buffer_size, config.overflow_policy),
            config,
            subscriptions: RwLock::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: BusCounters::default(),
            shutdown: Context::background(),
            dispatcher: Mutex::new(None),
            subscribers: TaskTracker::new(),
        });

        let dispatcher_shared = shared.clone();
        let handle = tokio::spawn(async move {
            let shared = dispatcher_shared;
            while let Some(event) = shared.dispatch.pop().await {
                shared.deliver(&shared.shutdown, &event).await;
            }
            trace!("event dispatcher stopped");
        });
        *shared.dispatcher.lock() = Some(handle);

        Ok(Self { shared })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SubmitError::BusClosed.into());
        }
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Register a handler that runs inline during [`publish`](Self::publish)
    /// and on the dispatcher for [`publish_async`](Self::publish_async).
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.add(event_type.into(), handler, DeliveryMode::Sync)
    }

    /// Register a handler that runs on its own task, in publication order.
    pub fn subscribe_async(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        self.add(event_type.into(), handler, DeliveryMode::Async)
    }

    fn add(
        &self,
        event_type: String,
        handler: Arc<dyn EventHandler>,
        mode: DeliveryMode,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let mailbox = match mode {
            DeliveryMode::Sync => None,
            DeliveryMode::Async => {
                let mailbox = Arc::new(Mailbox::new(
                    self.shared.config.subscriber_buffer_size,
                    self.shared.config.overflow_policy,
                ));
                let shared = self.shared.clone();
                let inbox = mailbox.clone();
                let handler = handler.clone();
                self.shared.subscribers.spawn(async move {
                    while let Some(event) = inbox.pop().await {
                        shared.run_handler(&shared.shutdown, &handler, &event).await;
                    }
                });
                Some(mailbox)
            }
        };

        let mut subscriptions = self.shared.subscriptions.write();
        // A close may have started while the task above was being set up.
        if self.is_closed() {
            if let Some(mailbox) = &mailbox {
                mailbox.close();
            }
            return Err(SubmitError::BusClosed.into());
        }
        subscriptions.push(Arc::new(Subscription {
            id,
            event_type: event_type.clone(),
            handler,
            mailbox,
        }));
        debug!(subscription = id, event_type = %event_type, mode = ?mode, "subscribed");
        Ok(id)
    }

    /// Remove a subscription. Events still queued for it are dropped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscriptions = self.shared.subscriptions.write();
            let position = subscriptions.iter().position(|sub| sub.id == id);
            position.map(|index| subscriptions.remove(index))
        };
        let Some(subscription) = removed else {
            return false;
        };
        if let Some(mailbox) = &subscription.mailbox {
            mailbox.close();
            let dropped = mailbox.discard() as u64;
            self.shared
                .counters
                .dropped_events
                .fetch_add(dropped, Ordering::Relaxed);
        }
        true
    }

    /// Add middleware applied to every subsequent delivery.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.shared.middleware.write().push(middleware);
    }

    /// Deliver `event` to sync subscribers before returning and queue it
    /// for async subscribers.
    ///
    /// Handler failures are recorded in the statistics and do not stop
    /// delivery to the remaining subscribers.
    pub async fn publish(&self, ctx: &Context, event: Event) -> Result<()> {
        self.ensure_open()?;
        ctx.check()?;
        self.shared
            .counters
            .total_events
            .fetch_add(1, Ordering::Relaxed);
        self.shared.deliver(ctx, &event).await;
        Ok(())
    }

    /// Queue `event` for out-of-band delivery. Never blocks.
    pub fn publish_async(&self, event: Event) -> Result<()> {
        self.ensure_open()?;
        self.shared
            .counters
            .total_events
            .fetch_add(1, Ordering::Relaxed);
        match self.shared.dispatch.push(event) {
            Push::Closed => Err(SubmitError::BusClosed.into()),
            outcome => {
                if outcome.dropped() {
                    self.shared
                        .counters
                        .dropped_events
                        .fetch_add(1, Ordering::Relaxed);
                    trace!("dispatch buffer full, event dropped");
                }
                Ok(())
            }
        }
    }

    /// Stop accepting publications and subscriptions, then drain (or
    /// discard, per configuration) pending events and wait for the
    /// delivery tasks.
    ///
    /// Returns `true` when everything pending was delivered. Only the first
    /// call does any work.
    pub async fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        let shared = &self.shared;
        // Taking the lock after setting `closed` orders this snapshot after
        // any subscription that is still being added.
        let mailboxes: Vec<Arc<Mailbox<Event>>> = shared
            .subscriptions
            .read()
            .iter()
            .filter_map(|sub| sub.mailbox.clone())
            .collect();

        shared.dispatch.close();
        if !shared.config.drain_on_close {
            let mut dropped = shared.dispatch.discard();
            for mailbox in &mailboxes {
                dropped += mailbox.discard();
            }
            shared
                .counters
                .dropped_events
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }

        let dispatcher = shared.dispatcher.lock().take();
        let drain = async {
            if let Some(handle) = dispatcher {
                let _ = handle.await;
            }
            for mailbox in &mailboxes {
                mailbox.close();
            }
            shared.subscribers.close();
            shared.subscribers.wait().await;
        };

        let drained = tokio::time::timeout(shared.config.close_timeout(), drain)
            .await
            .is_ok();
        if !drained {
            shared.shutdown.cancel();
            let mut dropped = shared.dispatch.discard();
            for mailbox in &mailboxes {
                mailbox.close();
                dropped += mailbox.discard();
            }
            shared
                .counters
                .dropped_events
                .fetch_add(dropped as u64, Ordering::Relaxed);
            debug!(dropped, "event bus close timed out; pending events discarded");
        }
        shared.subscriptions.write().clear();
        debug!(drained, "event bus closed");
        drained
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        let counters = &self.shared.counters;
        let subscriptions = self.shared.subscriptions.read();
        let pending_events = self.shared.dispatch.len()
            + subscriptions
                .iter()
                .filter_map(|sub| sub.mailbox.as_ref())
                .map(|mailbox| mailbox.len())
                .sum::<usize>();
        BusStats {
            total_events: counters.total_events.load(Ordering::Relaxed),
            processed_events: counters.processed_events.load(Ordering::Relaxed),
            failed_events: counters.failed_events.load(Ordering::Relaxed),
            dropped_events: counters.dropped_events.load(Ordering::Relaxed),
            subscribers: subscriptions.len(),
            pending_events,
            average_handle_time: *counters.average_handle_time.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use crate::config::OverflowPolicy;
    use crate::error::Error;

    fn bus() -> EventBus {
        EventBus::new(EventBusConfig::default()).unwrap()
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        handler_fn(move |_ctx, _event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    #[tokio::test]
    async fn test_sync_handlers_run_before_publish_returns() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(
                TASK_COMPLETED,
                handler_fn(move |_ctx, _event| {
                    let order = order.clone();
                    async move {
                        order.lock().push(name);
                        Ok::<_, anyhow::Error>(())
                    }
                }),
            )
            .unwrap();
        }

        bus.publish(&Context::background(), Event::new(TASK_COMPLETED, "test", json!({})))
            .await
            .unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_sync_handler_does_not_stop_delivery() {
        let bus = bus();
        let delivered = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            TASK_FAILED,
            handler_fn(|_ctx, _event| async { Err::<(), _>(anyhow::anyhow!("handler broke")) }),
        )
        .unwrap();
        bus.subscribe(TASK_FAILED, counting(delivered.clone())).unwrap();

        bus.publish(&Context::background(), Event::new(TASK_FAILED, "test", json!({})))
            .await
            .unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.failed_events, 1);
        assert_eq!(stats.processed_events, 1);
    }

    #[tokio::test]
    async fn test_only_matching_type_is_delivered() {
        let bus = bus();
        let completed = Arc::new(AtomicUsize::new(0));
        let everything = Arc::new(AtomicUsize::new(0));
        bus.subscribe(TASK_COMPLETED, counting(completed.clone())).unwrap();
        bus.subscribe(ANY, counting(everything.clone())).unwrap();

        let ctx = Context::background();
        bus.publish(&ctx, Event::new(TASK_COMPLETED, "t", json!(1))).await.unwrap();
        bus.publish(&ctx, Event::new(FILE_PROCESSED, "t", json!(2))).await.unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(everything.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_handler_sees_publish_order() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_async(
            REQUEST_COMPLETED,
            handler_fn(move |_ctx, event| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(event.data.as_u64().unwrap_or_default());
                    Ok::<_, anyhow::Error>(())
                }
            }),
        )
        .unwrap();

        for i in 0..50u64 {
            bus.publish_async(Event::new(REQUEST_COMPLETED, "t", json!(i))).unwrap();
        }
        assert!(bus.close().await);
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(ERROR, counting(count.clone())).unwrap();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(&Context::background(), Event::new(ERROR, "t", json!(null)))
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_everything() {
        let bus = bus();
        bus.close().await;
        assert!(bus.close().await);

        let publish = bus.publish_async(Event::new(ERROR, "t", json!(null)));
        assert!(matches!(publish, Err(Error::Submit(SubmitError::BusClosed))));
        let subscribe = bus.subscribe(ERROR, counting(Arc::new(AtomicUsize::new(0))));
        assert!(matches!(subscribe, Err(Error::Submit(SubmitError::BusClosed))));
    }

    #[tokio::test]
    async fn test_overflow_is_counted() {
        let bus = EventBus::new(EventBusConfig {
            subscriber_buffer_size: 1,
            overflow_policy: OverflowPolicy::DropNewest,
            ..EventBusConfig::default()
        })
        .unwrap();

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let blocked = gate.clone();
        bus.subscribe_async(
            FILE_PROCESSED,
            handler_fn(move |_ctx, _event| {
                let blocked = blocked.clone();
                async move {
                    let _permit = blocked.acquire().await?;
                    Ok::<_, anyhow::Error>(())
                }
            }),
        )
        .unwrap();

        for _ in 0..5 {
            bus.publish(&Context::background(), Event::new(FILE_PROCESSED, "t", json!(null)))
                .await
                .unwrap();
        }
        // One event is being handled, one waits in the mailbox.
        assert!(bus.stats().dropped_events >= 3);
        gate.add_permits(10);
        bus.close().await;
    }

    #[tokio::test]
    async fn test_discard_on_close_drops_pending() {
        let bus = EventBus::new(EventBusConfig {
            drain_on_close: false,
            ..EventBusConfig::default()
        })
        .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe_async(TASK_COMPLETED, counting(count.clone())).unwrap();
        for _ in 0..100 {
            bus.publish_async(Event::new(TASK_COMPLETED, "t", json!(null))).unwrap();
        }
        bus.close().await;

        let stats = bus.stats();
        assert_eq!(
            stats.processed_events + stats.dropped_events,
            100,
            "every event is either delivered or counted as dropped"
        );
    }

    #[tokio::test]
    async fn test_middleware_wraps_async_deliveries() {
        struct Counting(Arc<AtomicUsize>);
        impl Middleware for Counting {
            fn wrap(&self, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
                self.0.fetch_add(1, Ordering::SeqCst);
                next
            }
        }

        let bus = bus();
        let wraps = Arc::new(AtomicUsize::new(0));
        bus.use_middleware(Arc::new(Counting(wraps.clone())));
        bus.subscribe_async(TASK_COMPLETED, counting(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        bus.publish_async(Event::new(TASK_COMPLETED, "t", json!(null))).unwrap();
        bus.close().await;
        assert_eq!(wraps.load(Ordering::SeqCst), 1);
    }
}
