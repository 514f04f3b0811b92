//! Bounded FIFO with a configurable overflow policy.
//!
//! `tokio::sync::mpsc` cannot evict its oldest item, so the bus keeps its
//! own small queue: a mutex-guarded `VecDeque` and a `Notify` for the
//! single consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::OverflowPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    Accepted,
    /// Accepted after evicting the oldest queued item.
    EvictedOldest,
    /// Rejected because the mailbox was full.
    Rejected,
    Closed,
}

impl Push {
    pub(crate) fn dropped(self) -> bool {
        matches!(self, Push::EvictedOldest | Push::Rejected)
    }
}

struct State<T> {
    queue: VecDeque<T>,
    closed: bool,
}

pub(crate) struct Mailbox<T> {
    state: Mutex<State<T>>,
    ready: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> Mailbox<T> {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            ready: Notify::new(),
            capacity,
            policy,
        }
    }

    /// Never blocks.
    pub(crate) fn push(&self, item: T) -> Push {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Push::Closed;
            }
            if state.queue.len() < self.capacity {
                state.queue.push_back(item);
                Push::Accepted
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.queue.pop_front();
                        state.queue.push_back(item);
                        Push::EvictedOldest
                    }
                    OverflowPolicy::DropNewest => Push::Rejected,
                }
            }
        };
        if outcome != Push::Rejected {
            self.ready.notify_one();
        }
        outcome
    }

    /// Next item, or `None` once closed and empty.
    pub(crate) async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Stop accepting items. Queued items can still be popped.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_one();
    }

    /// Drop everything still queued, returning how many were dropped.
    pub(crate) fn discard(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let mailbox = Mailbox::new(4, OverflowPolicy::DropOldest);
        for i in 0..3 {
            assert_eq!(mailbox.push(i), Push::Accepted);
        }
        mailbox.close();
        let mut seen = Vec::new();
        while let Some(item) = mailbox.pop().await {
            seen.push(item);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let mailbox = Mailbox::new(2, OverflowPolicy::DropOldest);
        mailbox.push(1);
        mailbox.push(2);
        assert_eq!(mailbox.push(3), Push::EvictedOldest);
        assert_eq!(mailbox.pop().await, Some(2));
        assert_eq!(mailbox.pop().await, Some(3));
    }

    #[tokio::test]
    async fn test_drop_newest_rejects() {
        let mailbox = Mailbox::new(1, OverflowPolicy::DropNewest);
        mailbox.push("a");
        assert!(mailbox.push("b").dropped());
        assert_eq!(mailbox.pop().await, Some("a"));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let mailbox = Arc::new(Mailbox::new(1, OverflowPolicy::DropOldest));
        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        mailbox.push(7u8);
        assert_eq!(consumer.await.unwrap(), Some(7));
    }

    #[test]
    fn test_closed_rejects_and_discard_empties() {
        let mailbox = Mailbox::new(4, OverflowPolicy::DropOldest);
        mailbox.push(1);
        mailbox.push(2);
        assert_eq!(mailbox.discard(), 2);
        mailbox.close();
        assert_eq!(mailbox.push(3), Push::Closed);
        assert_eq!(mailbox.len(), 0);
    }
}
