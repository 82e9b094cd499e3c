//! Per-connection outbound delivery queue.
//!
//! Each connection owns one bounded FIFO of outbound events. The dispatcher
//! pushes from any task; exactly one drain task (the connection adapter)
//! pops and writes to the transport, so enqueue order is delivery order.
//! A full queue sheds load instead of blocking the sender, so one slow
//! client cannot stall a room.

use crate::event::OutboundEvent;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::Arc;
use tokio::sync::Notify;

/// What to do when a connection's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room for the new one.
    DropOldest,
    /// Drop the incoming event and keep the queue as-is.
    DropNewest,
}

/// Outbound queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Maximum queued events per connection.
    pub capacity: usize,
    /// Overflow policy when the queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Result of a push attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Event enqueued.
    Enqueued,
    /// Event enqueued; the oldest queued event was evicted.
    DroppedOldest,
    /// Event dropped; the queue was full.
    DroppedNewest,
    /// Queue is closed; the event was discarded.
    Closed,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<Arc<OutboundEvent>>,
    closed: bool,
}

/// A bounded, closeable, single-consumer event queue.
#[derive(Debug)]
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: QueueConfig,
}

impl OutboundQueue {
    /// Create a queue with the given configuration.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(config.capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event. Never blocks.
    ///
    /// Pushing onto a closed queue is a silent no-op from the caller's point
    /// of view; the connection is gone, not in error.
    pub fn push(&self, event: Arc<OutboundEvent>) -> Push {
        let result = {
            let mut inner = self.lock();
            if inner.closed {
                return Push::Closed;
            }
            if inner.items.len() >= self.config.capacity {
                match self.config.overflow {
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.items.push_back(event);
                        Push::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => Push::DroppedNewest,
                }
            } else {
                inner.items.push_back(event);
                Push::Enqueued
            }
        };
        if result != Push::DroppedNewest {
            self.notify.notify_one();
        }
        result
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the queue is closed. Pending items are discarded
    /// at close, so a `None` here means the connection is done.
    pub async fn pop(&self) -> Option<Arc<OutboundEvent>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(event) = inner.items.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue, discarding anything still queued. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.items.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::kinds;
    use serde_json::json;

    fn event(n: u64) -> Arc<OutboundEvent> {
        Arc::new(OutboundEvent::broadcast(kinds::SYSTEM, json!({ "n": n })))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(QueueConfig::default());

        for n in 0..3 {
            assert_eq!(queue.push(event(n)), Push::Enqueued);
        }

        for n in 0..3 {
            let popped = queue.pop().await.unwrap();
            assert_eq!(popped.payload["n"], n);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_overflow() {
        let queue = OutboundQueue::new(QueueConfig {
            capacity: 2,
            overflow: OverflowPolicy::DropOldest,
        });

        queue.push(event(0));
        queue.push(event(1));
        assert_eq!(queue.push(event(2)), Push::DroppedOldest);

        // Event 0 was evicted; 1 and 2 remain in order.
        assert_eq!(queue.pop().await.unwrap().payload["n"], 1);
        assert_eq!(queue.pop().await.unwrap().payload["n"], 2);
    }

    #[tokio::test]
    async fn test_drop_newest_overflow() {
        let queue = OutboundQueue::new(QueueConfig {
            capacity: 2,
            overflow: OverflowPolicy::DropNewest,
        });

        queue.push(event(0));
        queue.push(event(1));
        assert_eq!(queue.push(event(2)), Push::DroppedNewest);

        assert_eq!(queue.pop().await.unwrap().payload["n"], 0);
        assert_eq!(queue.pop().await.unwrap().payload["n"], 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_close_discards_and_unblocks() {
        let queue = Arc::new(OutboundQueue::new(QueueConfig::default()));
        queue.push(event(0));

        queue.close();
        assert!(queue.is_closed());
        // Pending items are discarded on close.
        assert!(queue.pop().await.is_none());
        // Enqueue after close is a no-op.
        assert_eq!(queue.push(event(1)), Push::Closed);
        // Close is idempotent.
        queue.close();
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(QueueConfig::default()));

        let drain = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push(event(7));

        let popped = drain.await.unwrap().unwrap();
        assert_eq!(popped.payload["n"], 7);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_close() {
        let queue = Arc::new(OutboundQueue::new(QueueConfig::default()));

        let drain = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        assert!(drain.await.unwrap().is_none());
    }
}
