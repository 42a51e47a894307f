//! Bounded hand-off buffer between a feed driver and its consumer
//!
//! Unlike a tokio mpsc channel, emitting never waits: when the buffer is
//! full the configured [`OverflowPolicy`] decides whether to evict the
//! oldest item, discard the newest, or fail the feed. The consumer side
//! awaits items with [`BoundedReceiver::recv`], which keeps yielding
//! queued items after the producer terminates and only then reports the
//! terminal outcome.

use crate::error::FeedError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

/// What to do with a new item when the buffer is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Terminate the feed with [`FeedError::Overflow`]
    Fail,
    /// Evict the oldest queued item to make room
    #[default]
    DropOldest,
    /// Discard the incoming item
    DropNewest,
}

/// How an emitted item was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// Queued without evicting anything
    Queued,
    /// Queued after evicting the oldest item
    DroppedOldest,
    /// Discarded; the queue is unchanged
    DroppedNewest,
}

/// Errors returned by [`BoundedEmitter::emit`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    /// The buffer is full and the policy is [`OverflowPolicy::Fail`]
    #[error("buffer full (capacity {capacity})")]
    Overflow { capacity: usize },

    /// The receiver was dropped; nothing will consume this item
    #[error("receiver dropped")]
    Disconnected,
}

/// Terminal outcome recorded by the producer
enum Terminal {
    Completed,
    // the error is handed out once, then the receiver reports end-of-stream
    Failed(Option<FeedError>),
}

struct Inner<T> {
    items: VecDeque<T>,
    terminal: Option<Terminal>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    emitted: AtomicU64,
    dropped: AtomicU64,
    consumer_gone: AtomicBool,
}

/// Create a bounded emitter/receiver pair
///
/// `capacity` is clamped to at least 1.
pub fn bounded<T>(capacity: usize, policy: OverflowPolicy) -> (BoundedEmitter<T>, BoundedReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::with_capacity(capacity),
            terminal: None,
        }),
        notify: Notify::new(),
        emitted: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        consumer_gone: AtomicBool::new(false),
    });
    (
        BoundedEmitter {
            shared: Arc::clone(&shared),
            capacity,
            policy,
        },
        BoundedReceiver { shared },
    )
}

/// Producer half of the buffer
///
/// Owned by the feed driver. Dropping the emitter marks the stream
/// completed if no terminal outcome was recorded, so a consumer never
/// waits on a producer that no longer exists.
pub struct BoundedEmitter<T> {
    shared: Arc<Shared<T>>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> BoundedEmitter<T> {
    /// Hand an item to the consumer without waiting
    pub fn emit(&self, item: T) -> std::result::Result<EmitOutcome, EmitError> {
        if self.shared.consumer_gone.load(Ordering::Acquire) {
            return Err(EmitError::Disconnected);
        }

        let outcome = {
            let mut inner = lock(&self.shared.inner);
            if inner.terminal.is_some() {
                return Err(EmitError::Disconnected);
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                EmitOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::Fail => {
                        return Err(EmitError::Overflow {
                            capacity: self.capacity,
                        })
                    }
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.items.push_back(item);
                        EmitOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => EmitOutcome::DroppedNewest,
                }
            }
        };

        match outcome {
            EmitOutcome::Queued => {
                self.shared.emitted.fetch_add(1, Ordering::Relaxed);
            }
            EmitOutcome::DroppedOldest => {
                self.shared.emitted.fetch_add(1, Ordering::Relaxed);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            EmitOutcome::DroppedNewest => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.notify.notify_one();
        Ok(outcome)
    }

    /// Mark the stream cleanly finished
    ///
    /// Queued items remain readable; once drained, `recv` returns `None`.
    /// The first recorded terminal outcome wins.
    pub fn complete(&self) {
        let mut inner = lock(&self.shared.inner);
        if inner.terminal.is_none() {
            inner.terminal = Some(Terminal::Completed);
        }
        drop(inner);
        self.shared.notify.notify_one();
    }

    /// Mark the stream failed
    ///
    /// Queued items remain readable; once drained, `recv` returns the
    /// error exactly once and `None` afterwards.
    pub fn fail(&self, error: FeedError) {
        let mut inner = lock(&self.shared.inner);
        if inner.terminal.is_none() {
            inner.terminal = Some(Terminal::Failed(Some(error)));
        }
        drop(inner);
        self.shared.notify.notify_one();
    }

    /// Buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured overflow policy
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

impl<T> Drop for BoundedEmitter<T> {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Consumer half of the buffer
pub struct BoundedReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> BoundedReceiver<T> {
    /// Wait for the next item
    ///
    /// Returns `Ok(Some(item))` while items are available, the recorded
    /// failure once after the queue drains, and `Ok(None)` from then on.
    pub async fn recv(&mut self) -> crate::error::Result<Option<T>> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut inner = lock(&self.shared.inner);
                if let Some(item) = inner.items.pop_front() {
                    return Ok(Some(item));
                }
                match &mut inner.terminal {
                    Some(Terminal::Completed) => return Ok(None),
                    Some(Terminal::Failed(slot)) => {
                        return match slot.take() {
                            Some(err) => Err(err),
                            None => Ok(None),
                        };
                    }
                    None => {}
                }
            }
            notified.await;
        }
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        lock(&self.shared.inner).items.len()
    }

    /// Whether the queue is currently empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items accepted into the queue
    pub fn emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Relaxed)
    }

    /// Total items discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for BoundedReceiver<T> {
    fn drop(&mut self) {
        self.shared.consumer_gone.store(true, Ordering::Release);
    }
}

// A panicked lock holder cannot leave the queue logically torn; take the
// guard anyway.
fn lock<T>(mutex: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_emit_then_drain_in_order() {
        let (tx, mut rx) = bounded(8, OverflowPolicy::DropOldest);
        for n in 1..=3 {
            assert_eq!(tx.emit(n), Ok(EmitOutcome::Queued));
        }
        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), Some(1));
            assert_eq!(rx.recv().await.unwrap(), Some(2));
            assert_eq!(rx.recv().await.unwrap(), Some(3));
        });
        assert_eq!(rx.emitted(), 3);
        assert_eq!(rx.dropped(), 0);
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let (tx, mut rx) = bounded(3, OverflowPolicy::DropOldest);
        for n in 1..=5 {
            tx.emit(n).unwrap();
        }
        assert_eq!(rx.len(), 3);
        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), Some(3));
            assert_eq!(rx.recv().await.unwrap(), Some(4));
            assert_eq!(rx.recv().await.unwrap(), Some(5));
        });
        assert_eq!(rx.emitted(), 5);
        assert_eq!(rx.dropped(), 2);
    }

    #[test]
    fn test_drop_newest_keeps_earliest() {
        let (tx, mut rx) = bounded(2, OverflowPolicy::DropNewest);
        assert_eq!(tx.emit("a"), Ok(EmitOutcome::Queued));
        assert_eq!(tx.emit("b"), Ok(EmitOutcome::Queued));
        assert_eq!(tx.emit("c"), Ok(EmitOutcome::DroppedNewest));
        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), Some("a"));
            assert_eq!(rx.recv().await.unwrap(), Some("b"));
        });
        assert_eq!(rx.dropped(), 1);
    }

    #[test]
    fn test_fail_policy_reports_overflow() {
        let (tx, _rx) = bounded(1, OverflowPolicy::Fail);
        assert_eq!(tx.emit(1), Ok(EmitOutcome::Queued));
        assert_eq!(tx.emit(2), Err(EmitError::Overflow { capacity: 1 }));
    }

    #[test]
    fn test_complete_drains_queue_first() {
        let (tx, mut rx) = bounded(4, OverflowPolicy::DropOldest);
        tx.emit("pending").unwrap();
        tx.complete();
        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), Some("pending"));
            assert_eq!(rx.recv().await.unwrap(), None);
            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn test_fail_surfaces_error_once_after_drain() {
        let (tx, mut rx) = bounded(4, OverflowPolicy::DropOldest);
        tx.emit("pending").unwrap();
        tx.fail(FeedError::Overflow { capacity: 4 });
        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), Some("pending"));
            assert!(matches!(
                rx.recv().await,
                Err(FeedError::Overflow { capacity: 4 })
            ));
            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn test_first_terminal_wins() {
        let (tx, mut rx) = bounded::<u32>(4, OverflowPolicy::DropOldest);
        tx.complete();
        tx.fail(FeedError::Overflow { capacity: 4 });
        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn test_emit_after_terminal_is_rejected() {
        let (tx, _rx) = bounded(4, OverflowPolicy::DropOldest);
        tx.complete();
        assert_eq!(tx.emit(1), Err(EmitError::Disconnected));
    }

    #[test]
    fn test_consumer_drop_disconnects_emitter() {
        let (tx, rx) = bounded(4, OverflowPolicy::DropOldest);
        drop(rx);
        assert_eq!(tx.emit(1), Err(EmitError::Disconnected));
    }

    #[test]
    fn test_emitter_drop_completes_stream() {
        let (tx, mut rx) = bounded::<u32>(4, OverflowPolicy::DropOldest);
        drop(tx);
        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn test_capacity_clamped_to_one() {
        let (tx, _rx) = bounded::<u32>(0, OverflowPolicy::Fail);
        assert_eq!(tx.capacity(), 1);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_later_emit() {
        let (tx, mut rx) = bounded(4, OverflowPolicy::DropOldest);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.emit(7u32).unwrap();
        });
        assert_eq!(rx.recv().await.unwrap(), Some(7));
        producer.await.unwrap();
    }
}
