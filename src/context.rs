//! Cancellation and deadline propagation.
//!
//! Every blocking operation in the crate takes a [`Context`]. A context is
//! cancelled either explicitly via [`Context::cancel`] (which also cancels
//! every context derived from it) or implicitly once its deadline passes.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ContextError;

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled on its own.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child that is cancelled with this context, or on its own.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child that additionally expires after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child that expires at `deadline` (or earlier if the parent does).
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why the context ended, or `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Fail fast if the context has already ended.
    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }

    /// Race `fut` against the context.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Sleep until `instant` unless the context ends first.
    pub async fn sleep_until(&self, instant: Instant) -> Result<(), ContextError> {
        self.run(tokio::time::sleep_until(instant)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_live() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_affect_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(parent.err().is_none());
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let err = ctx.sleep(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, ContextError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_expired_context_never_polls_future() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        let mut polled = false;
        let result = ctx
            .run(async {
                polled = true;
            })
            .await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
        assert!(!polled);
    }

    #[test]
    fn test_child_deadline_never_extends_parent() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let parent = Context::background().with_timeout(Duration::from_millis(5));
            let child = parent.with_timeout(Duration::from_secs(60));
            assert_eq!(child.deadline(), parent.deadline());
        });
    }
}
