//! Write-once, multi-reader result cell shared by every caller of one execution.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::context::Context;
use crate::error::{ExecutionError, Result};

#[derive(Default)]
struct Waiters {
    count: usize,
    abandoned: bool,
}

/// One shared execution: a single producer completes it, any number of
/// callers wait on it and each receive a clone of the same value.
///
/// The flight owns a [`Context`] for the work it represents. That context
/// is cancelled when the last waiter gives up before completion, so work
/// nobody is waiting for anymore stops at its next suspension point. Once
/// abandoned, a flight admits no new waiters.
pub struct Flight<T> {
    slot: watch::Sender<Option<T>>,
    waiters: Mutex<Waiters>,
    context: Context,
}

impl<T: Clone> Flight<T> {
    #[must_use]
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot,
            waiters: Mutex::new(Waiters::default()),
            context: Context::background(),
        }
    }

    /// Create a flight together with the ticket of its first waiter.
    #[must_use]
    pub fn start() -> (Arc<Self>, FlightTicket<T>) {
        let flight = Arc::new(Self::new());
        flight.waiters.lock().count = 1;
        let ticket = FlightTicket {
            flight: flight.clone(),
        };
        (flight, ticket)
    }

    /// Context handed to the producer.
    #[must_use]
    pub fn context(&self) -> Context {
        self.context.clone()
    }

    /// Store the result. Only the first call has any effect.
    pub fn complete(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// True when every waiter left before a result arrived.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.waiters.lock().abandoned
    }

    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.lock().count
    }

    /// Register a new waiter, or `None` if the flight was already abandoned.
    ///
    /// The returned ticket counts as a waiter from this moment on, so the
    /// flight cannot be abandoned between joining and waiting.
    #[must_use]
    pub fn join(self: &Arc<Self>) -> Option<FlightTicket<T>> {
        let mut waiters = self.waiters.lock();
        if waiters.abandoned {
            return None;
        }
        waiters.count += 1;
        Some(FlightTicket {
            flight: self.clone(),
        })
    }

    fn leave(&self) {
        let mut waiters = self.waiters.lock();
        waiters.count = waiters.count.saturating_sub(1);
        if waiters.count == 0 && !self.is_complete() {
            waiters.abandoned = true;
            self.context.cancel();
        }
    }
}

impl<T: Clone> Default for Flight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered waiter on a [`Flight`].
pub struct FlightTicket<T: Clone> {
    flight: Arc<Flight<T>>,
}

impl<T: Clone> FlightTicket<T> {
    #[must_use]
    pub fn flight(&self) -> &Arc<Flight<T>> {
        &self.flight
    }

    /// Wait for the result, or until `ctx` ends.
    ///
    /// Leaving early only removes this caller; the execution carries on
    /// for everyone else.
    pub async fn wait(self, ctx: &Context) -> Result<T> {
        ctx.check()?;
        let mut rx = self.flight.slot.subscribe();

        let received = ctx
            .run(async move {
                rx.wait_for(Option::is_some)
                    .await
                    .map(|slot| slot.clone())
            })
            .await?;

        match received {
            Ok(Some(value)) => Ok(value),
            _ => Err(ExecutionError::Abandoned.into()),
        }
    }
}

impl<T: Clone> Drop for FlightTicket<T> {
    fn drop(&mut self) {
        self.flight.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::{ContextError, Error};

    #[tokio::test]
    async fn test_all_waiters_see_same_value() {
        let flight = Arc::new(Flight::<u32>::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let flight = flight.clone();
            handles.push(tokio::spawn(async move {
                flight.join().unwrap().wait(&Context::background()).await.unwrap()
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(flight.complete(42));
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn test_second_complete_is_ignored() {
        let flight = Arc::new(Flight::new());
        assert!(flight.complete(1));
        assert!(!flight.complete(2));
        assert_eq!(flight.join().unwrap().wait(&Context::background()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_others_waiting() {
        let flight = Arc::new(Flight::<&'static str>::new());

        let patient = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.join().unwrap().wait(&Context::background()).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        let hasty = flight
            .join()
            .unwrap()
            .wait(&Context::background().with_timeout(Duration::from_millis(5)))
            .await;
        assert!(matches!(
            hasty,
            Err(Error::Context(ContextError::DeadlineExceeded))
        ));
        assert!(!flight.is_abandoned());

        flight.complete("done");
        assert_eq!(patient.await.unwrap().unwrap(), "done");
    }

    #[tokio::test]
    async fn test_last_waiter_leaving_cancels_work_context() {
        let flight = Arc::new(Flight::<u8>::new());
        let work_ctx = flight.context();
        let _ = flight
            .join()
            .unwrap()
            .wait(&Context::background().with_timeout(Duration::from_millis(5)))
            .await;
        assert!(work_ctx.err().is_some());
        assert!(flight.is_abandoned());
        assert_eq!(flight.waiters(), 0);
        assert!(flight.join().is_none());
    }

    #[tokio::test]
    async fn test_joined_ticket_keeps_flight_alive_when_first_waiter_leaves() {
        let (flight, first) = Flight::<u8>::start();
        let second = flight.join().unwrap();

        let ctx = Context::background();
        ctx.cancel();
        assert!(first.wait(&ctx).await.is_err());

        assert!(!flight.is_abandoned());
        assert!(flight.context().err().is_none());
        flight.complete(7);
        assert_eq!(second.wait(&Context::background()).await.unwrap(), 7);
    }
}
