//! Pending reply callers and their round-trip timeouts.
//!
//! # Architecture
//!
//! ```text
//! add_reply_caller(id, caller, ttl)
//!   ├─ callers[id] = (caller, generation)
//!   └─ timers.push((id, generation), now + ttl)
//!
//! message_arrived(reply)          timer task pops (id, generation)
//!   └─ callers.remove(id)           └─ callers.remove_if(id, same generation)
//!        └─ caller.on_reply            └─ caller.on_error(Timeout)
//! ```
//!
//! Both paths go through an atomic remove on the same key, so whichever
//! wins delivers and the other finds nothing. A timer whose caller is gone
//! is a no-op when it fires; one task drives every timer. Timers of callers
//! resolved early are swept out of the heap once they outnumber the waiting
//! callers, so a steady reply rate does not grow it up to `rate × ttl`.

use crate::error::ReplyError;
use crate::message::{Reply, RequestReplyId};
use crate::messaging::DelayQueue;
use crate::reply::ReplyCaller;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Dead timers tolerated before a sweep regardless of the number of callers.
const MIN_DEAD_TIMERS_BEFORE_SWEEP: usize = 32;

struct PendingCaller {
    caller: Box<dyn ReplyCaller>,
    generation: u64,
}

struct Timer {
    request_reply_id: RequestReplyId,
    generation: u64,
}

struct DirectoryInner {
    callers: DashMap<RequestReplyId, PendingCaller>,
    timers: DelayQueue<Timer>,
    /// Timers still queued whose caller was resolved before they fired.
    dead_timers: AtomicUsize,
    next_generation: AtomicU64,
    shut_down: AtomicBool,
}

/// Correlates request ids with the callers waiting for their replies.
///
/// Every registered caller is resolved exactly once: with its reply, with a
/// timeout once its round-trip TTL elapses, with an explicit failure, or
/// with a shutdown error.
pub struct ReplyCallerDirectory {
    inner: Arc<DirectoryInner>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplyCallerDirectory {
    /// Create the directory and start its timer task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(DirectoryInner {
            callers: DashMap::new(),
            timers: DelayQueue::unbounded(),
            dead_timers: AtomicUsize::new(0),
            next_generation: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        let timer_inner = inner.clone();
        let timer_task = tokio::spawn(async move {
            while let Some(timer) = timer_inner.timers.pop().await {
                timer_inner.expire(timer);
            }
        });

        Self {
            inner,
            timer_task: Mutex::new(Some(timer_task)),
        }
    }

    /// Register `caller` for `request_reply_id`, timing out after `round_trip_ttl`.
    ///
    /// A caller registered after shutdown is failed immediately.
    pub fn add_reply_caller(
        &self,
        request_reply_id: RequestReplyId,
        caller: Box<dyn ReplyCaller>,
        round_trip_ttl: Duration,
    ) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            caller.on_error(ReplyError::Shutdown);
            return;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let replaced = self.inner.callers.insert(
            request_reply_id.clone(),
            PendingCaller { caller, generation },
        );
        if let Some(replaced) = replaced {
            tracing::warn!(%request_reply_id, "Reply caller registered twice, failing the older one");
            replaced.caller.on_error(ReplyError::Delivery {
                message: format!("reply caller for {request_reply_id} was replaced"),
            });
        }

        tracing::trace!(%request_reply_id, ttl_ms = round_trip_ttl.as_millis() as u64, "Reply caller added");
        let timer = Timer {
            request_reply_id,
            generation,
        };
        if let Err(timer) = self.inner.timers.requeue(timer, Instant::now() + round_trip_ttl) {
            // Shutdown raced with registration.
            if let Some(pending) = self.inner.remove_matching(&timer) {
                pending.caller.on_error(ReplyError::Shutdown);
            }
        }
    }

    /// Deliver `reply` to its caller. Returns false if no caller was waiting,
    /// which happens for duplicate, late or spurious replies.
    pub fn message_arrived(&self, reply: Reply) -> bool {
        match self.inner.callers.remove(&reply.request_reply_id) {
            Some((request_reply_id, pending)) => {
                tracing::trace!(%request_reply_id, "Reply delivered to caller");
                self.inner.timer_orphaned();
                pending.caller.on_reply(reply);
                true
            }
            None => {
                tracing::warn!(
                    request_reply_id = %reply.request_reply_id,
                    "Dropping reply without waiting caller"
                );
                false
            }
        }
    }

    /// Fail the caller of `request_reply_id`. Returns false if none was waiting.
    pub fn fail(&self, request_reply_id: &RequestReplyId, error: ReplyError) -> bool {
        match self.inner.callers.remove(request_reply_id) {
            Some((_, pending)) => {
                tracing::debug!(%request_reply_id, error = %error, "Reply caller failed");
                self.inner.timer_orphaned();
                pending.caller.on_error(error);
                true
            }
            None => false,
        }
    }

    /// Take the caller of `request_reply_id` out without resolving it.
    ///
    /// The returned caller becomes the responsibility of the caller.
    pub fn remove(&self, request_reply_id: &RequestReplyId) -> Option<Box<dyn ReplyCaller>> {
        let (_, pending) = self.inner.callers.remove(request_reply_id)?;
        self.inner.timer_orphaned();
        Some(pending.caller)
    }

    /// Whether a caller waits on `request_reply_id`.
    pub fn contains(&self, request_reply_id: &RequestReplyId) -> bool {
        self.inner.callers.contains_key(request_reply_id)
    }

    /// Number of waiting callers.
    pub fn len(&self) -> usize {
        self.inner.callers.len()
    }

    /// Whether no caller is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.callers.is_empty()
    }

    /// Cancel every timer and fail every waiting caller with
    /// [`ReplyError::Shutdown`].
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.timers.close();
        let cancelled = self.inner.timers.drain().len();
        if let Some(task) = self.timer_task.lock().take() {
            task.abort();
        }

        let ids: Vec<RequestReplyId> = self
            .inner
            .callers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let failed = ids
            .iter()
            .filter(|id| self.fail(id, ReplyError::Shutdown))
            .count();
        tracing::debug!(cancelled, failed, "Reply caller directory shut down");
    }
}

impl Default for ReplyCallerDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReplyCallerDirectory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DirectoryInner {
    fn remove_matching(&self, timer: &Timer) -> Option<PendingCaller> {
        self.callers
            .remove_if(&timer.request_reply_id, |_, pending| {
                pending.generation == timer.generation
            })
            .map(|(_, pending)| pending)
    }

    /// Account for a caller resolved before its timer fired, sweeping the
    /// heap once such timers outnumber the waiting callers.
    fn timer_orphaned(&self) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let dead = self.dead_timers.fetch_add(1, Ordering::AcqRel) + 1;
        if dead < MIN_DEAD_TIMERS_BEFORE_SWEEP || dead <= self.callers.len() {
            return;
        }
        if self
            .dead_timers
            .compare_exchange(dead, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread got there first.
            return;
        }
        let swept = self.timers.retain(|timer| {
            self.callers
                .get(&timer.request_reply_id)
                .is_some_and(|pending| pending.generation == timer.generation)
        });
        tracing::trace!(swept, remaining = self.timers.len(), "Swept reply timers");
    }

    fn expire(&self, timer: Timer) {
        if let Some(pending) = self.remove_matching(&timer) {
            tracing::debug!(request_reply_id = %timer.request_reply_id, "Reply caller timed out");
            pending.caller.on_error(ReplyError::Timeout);
        }
    }
}
