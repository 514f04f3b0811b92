//! Event handler and middleware traits.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::trace;

use super::Event;
use crate::context::Context;

/// Reacts to events delivered by the bus.
///
/// A handler subscribed with [`EventBus::subscribe`](super::EventBus::subscribe)
/// runs inline in the publisher's call; one subscribed with
/// [`EventBus::subscribe_async`](super::EventBus::subscribe_async) runs on its
/// own task and sees events in publication order.
///
/// # Example
///
/// ```ignore
/// struct ProgressCounter(AtomicUsize);
///
/// #[async_trait]
/// impl EventHandler for ProgressCounter {
///     async fn handle(&self, _ctx: &Context, _event: &Event) -> anyhow::Result<()> {
///         self.0.fetch_add(1, Ordering::Relaxed);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// A returned error is counted in the bus statistics; delivery to other
    /// handlers continues.
    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        (self.0)(ctx.clone(), event.clone()).await
    }
}

/// Turn an async closure into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Wraps handlers at delivery time.
///
/// Middleware registered first ends up outermost.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler>;
}

/// Emits a trace event with the handling time of every delivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

struct Traced {
    next: Arc<dyn EventHandler>,
}

#[async_trait]
impl EventHandler for Traced {
    async fn handle(&self, ctx: &Context, event: &Event) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = self.next.handle(ctx, event).await;
        trace!(
            event_type = %event.event_type,
            event_id = %event.id,
            elapsed_us = started.elapsed().as_micros() as u64,
            ok = result.is_ok(),
            "event handled"
        );
        result
    }
}

impl Middleware for TracingMiddleware {
    fn wrap(&self, next: Arc<dyn EventHandler>) -> Arc<dyn EventHandler> {
        Arc::new(Traced { next })
    }
}

pub(crate) fn apply(
    middleware: &[Arc<dyn Middleware>],
    handler: Arc<dyn EventHandler>,
) -> Arc<dyn EventHandler> {
    middleware
        .iter()
        .rev()
        .fold(handler, |next, layer| layer.wrap(next))
}
