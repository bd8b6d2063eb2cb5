//! Delay-ordered work queue.
//!
//! Items become available at their ready time. Among items with the same
//! ready time, the one pushed first comes out first, using a monotonically
//! increasing sequence number as tie-breaker. Any number of producers and
//! consumers may share the queue.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Why an item was not enqueued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue holds `capacity` items already.
    #[error("queue full (capacity: {capacity})")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },

    /// The queue has been closed.
    #[error("queue closed")]
    Closed,
}

struct Scheduled<T> {
    ready_at: Instant,
    sequence: u64,
    item: T,
}

impl<T> PartialEq for Scheduled<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.sequence == other.sequence
    }
}

impl<T> Eq for Scheduled<T> {}

impl<T> PartialOrd for Scheduled<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Scheduled<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap behavior (earliest first)
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct State<T> {
    heap: BinaryHeap<Scheduled<T>>,
    next_sequence: u64,
    closed: bool,
}

/// Bounded min-heap of items keyed by ready time.
pub struct DelayQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> DelayQueue<T> {
    /// Create a queue accepting at most `capacity` items through [`push`](Self::push).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Create a queue without bound.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Enqueue a new item, respecting the capacity bound.
    pub fn push(&self, item: T, ready_at: Instant) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.heap.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        Self::insert(&mut state, item, ready_at);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Put an already accepted item back, ignoring the capacity bound.
    ///
    /// Returns the item if the queue is closed.
    pub fn requeue(&self, item: T, ready_at: Instant) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(item);
        }
        Self::insert(&mut state, item, ready_at);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    fn insert(state: &mut State<T>, item: T, ready_at: Instant) {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(Scheduled {
            ready_at,
            sequence,
            item,
        });
    }

    /// Wait for the earliest item to become ready and take it.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                match state.heap.peek().map(|head| head.ready_at) {
                    Some(ready_at) if ready_at <= Instant::now() => {
                        let head = state.heap.pop()?;
                        let more = !state.heap.is_empty();
                        drop(state);
                        if more {
                            // Another consumer may be able to take the next item.
                            self.notify.notify_one();
                        }
                        return Some(head.item);
                    }
                    other => other,
                }
            };

            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop accepting items and wake every consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Remove and return every remaining item in ready order.
    pub fn drain(&self) -> Vec<T> {
        let mut heap = std::mem::take(&mut self.state.lock().heap);
        let mut items = Vec::with_capacity(heap.len());
        while let Some(scheduled) = heap.pop() {
            items.push(scheduled.item);
        }
        items
    }

    /// Drop every item for which `keep` returns false. Returns how many were dropped.
    ///
    /// `keep` runs under the queue lock.
    pub fn retain(&self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let mut state = self.state.lock();
        let before = state.heap.len();
        state.heap.retain(|scheduled| keep(&scheduled.item));
        before - state.heap.len()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
