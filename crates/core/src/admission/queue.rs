//! Bounded FIFO job queue
//!
//! `push` never blocks: a full queue rejects immediately, which is the
//! backpressure signal producers see. `pop` waits until an item arrives, the
//! queue is closed and drained, or the caller's context ends.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cancel::{CancelContext, CancelError};

/// Queue rejection, returning the item to the caller
#[derive(thiserror::Error)]
pub enum QueueError<T> {
    #[error("queue is full")]
    Full(T),

    #[error("queue is closed")]
    Closed(T),
}

impl<T> QueueError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> std::fmt::Debug for QueueError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Fixed-capacity buffer between producers and the worker pool
///
/// Invariant: `len() <= capacity()` at every observation point.
pub struct BoundedJobQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    available: Notify,
}

impl<T> BoundedJobQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Append an item, or hand it back if the queue is full or closed
    pub fn push(&self, item: T) -> Result<(), QueueError<T>> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed(item));
            }
            if state.items.len() >= self.capacity {
                return Err(QueueError::Full(item));
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        let (item, more) = {
            let mut state = self.state.lock();
            let item = state.items.pop_front();
            (item, !state.items.is_empty())
        };
        if item.is_some() && more {
            self.available.notify_one();
        }
        item
    }

    /// Wait for the oldest item
    ///
    /// Returns `Ok(None)` once the queue is closed and empty: no more work.
    pub async fn pop(&self, ctx: &CancelContext) -> Result<Option<T>, CancelError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking state so a push between the check and
            // the await still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    let more = !state.items.is_empty();
                    drop(state);
                    if more {
                        self.available.notify_one();
                    }
                    return Ok(Some(item));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            ctx.check()?;

            tokio::select! {
                _ = &mut notified => {}
                reason = ctx.done() => return Err(reason.into()),
            }
        }
    }

    /// Stop accepting items; waiting consumers drain what is left, then see `None`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_waiters();
    }

    /// Remove every queued item (used by forced shutdown)
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_push_rejects_when_full() {
        let queue = BoundedJobQueue::new(10);

        let results: Vec<_> = (0..15).map(|i| queue.push(i)).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 10);
        let rejected: Vec<_> = results
            .into_iter()
            .filter_map(|r| r.err())
            .inspect(|e| assert!(e.is_full()))
            .map(QueueError::into_inner)
            .collect();
        assert_eq!(rejected, vec![10, 11, 12, 13, 14]);
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn test_push_after_close() {
        let queue = BoundedJobQueue::new(4);
        queue.close();

        let err = queue.push("late").unwrap_err();
        assert!(matches!(err, QueueError::Closed("late")));
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let queue = BoundedJobQueue::new(3);
        for step in 0..100u32 {
            if step % 3 == 2 {
                queue.try_pop();
            } else {
                let _ = queue.push(step);
            }
            assert!(queue.len() <= queue.capacity());
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedJobQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        queue.close();

        let ctx = CancelContext::new();
        let mut seen = Vec::new();
        while let Some(item) = queue.pop(&ctx).await.unwrap() {
            seen.push(item);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(BoundedJobQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(&CancelContext::new()).await })
        };

        tokio::task::yield_now().await;
        queue.push(42).unwrap();

        assert_eq!(consumer.await.unwrap().unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumers() {
        let queue: Arc<BoundedJobQueue<u32>> = Arc::new(BoundedJobQueue::new(2));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop(&CancelContext::new()).await })
            })
            .collect();

        tokio::task::yield_now().await;
        queue.close();

        for consumer in consumers {
            assert_eq!(consumer.await.unwrap().unwrap(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_honours_deadline() {
        let queue: BoundedJobQueue<u32> = BoundedJobQueue::new(2);
        let ctx = CancelContext::with_timeout(Duration::from_millis(100));

        let err = queue.pop(&ctx).await.unwrap_err();
        assert!(err.is_deadline());
    }

    #[test]
    fn test_drain_empties_queue() {
        let queue = BoundedJobQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();

        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
    }
}
