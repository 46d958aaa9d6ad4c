//! Overflow-aware bounded queue.
//!
//! The producer side is a lock-free [`ArrayQueue`]: `offer` never waits, it
//! hands the element back once the queue is full. The first rejection after a
//! calm period opens an *overflow episode* and notifies the registered
//! [`OverflowListener`]; the episode closes, with exactly one reset
//! notification, once draining brings the size down to the reset threshold.
//!
//! ```text
//!   size: 0 ........ reset_threshold ........ capacity
//!                         ^                      ^
//!          on_reset() when draining to here      on_overflow() on first rejection
//! ```
//!
//! Drains are serialized with each other but never block the producer.

use crate::error::{StreamError, StreamResult};
use crossbeam_queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives backpressure transitions from an [`OverflowableQueue`].
pub trait OverflowListener: Send + Sync {
    /// The queue reached capacity and started rejecting input.
    fn on_overflow(&self);

    /// The queue drained to its reset threshold and accepts input again.
    fn on_reset(&self);
}

/// Counters describing queue traffic since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Elements passed to `offer`
    pub offered: u64,
    /// Elements accepted into the queue
    pub accepted: u64,
    /// Elements rejected because the queue was full
    pub rejected: u64,
    /// Elements removed by drains and clears
    pub drained: u64,
    /// Overflow episodes started
    pub overflow_episodes: u64,
}

/// Bounded, thread-safe FIFO with overflow/reset signalling.
pub struct OverflowableQueue<E> {
    queue: ArrayQueue<E>,
    reset_threshold: usize,
    overflow: AtomicBool,
    listener: RwLock<Option<Arc<dyn OverflowListener>>>,
    /// Serializes overflow state transitions and their notifications.
    transition: Mutex<()>,
    /// Serializes drains so each one removes a contiguous FIFO run.
    drain_lock: Mutex<()>,
    offered: AtomicU64,
    rejected: AtomicU64,
    drained: AtomicU64,
    episodes: AtomicU64,
}

impl<E> fmt::Debug for OverflowableQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverflowableQueue")
            .field("capacity", &self.queue.capacity())
            .field("reset_threshold", &self.reset_threshold)
            .field("len", &self.queue.len())
            .field("overflow", &self.is_overflow())
            .finish()
    }
}

impl<E> OverflowableQueue<E> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// `reset_threshold` must be below `capacity`.
    pub fn new(capacity: usize, reset_threshold: usize) -> StreamResult<Self> {
        if capacity == 0 {
            return Err(StreamError::configuration("queue capacity must be > 0"));
        }
        if reset_threshold >= capacity {
            return Err(StreamError::Configuration(format!(
                "queue reset threshold ({reset_threshold}) must be below capacity ({capacity})"
            )));
        }

        Ok(Self {
            queue: ArrayQueue::new(capacity),
            reset_threshold,
            overflow: AtomicBool::new(false),
            listener: RwLock::new(None),
            transition: Mutex::new(()),
            drain_lock: Mutex::new(()),
            offered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            drained: AtomicU64::new(0),
            episodes: AtomicU64::new(0),
        })
    }

    /// Maximum number of queued elements.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Size at or below which an overflow episode ends.
    pub fn reset_threshold(&self) -> usize {
        self.reset_threshold
    }

    /// Current number of queued elements.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether an overflow episode is in progress.
    pub fn is_overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Install or clear the overflow listener (last writer wins).
    ///
    /// A listener installed during an overflow episode is told about the
    /// episode straight away, so it always sees the matching `on_reset`.
    pub fn set_overflow_listener(&self, listener: Option<Arc<dyn OverflowListener>>) {
        let _transition = self.transition.lock();
        if let (Some(listener), true) = (&listener, self.is_overflow()) {
            listener.on_overflow();
        }
        *self.listener.write() = listener;
    }

    /// Try to enqueue `element` without blocking.
    ///
    /// Returns the element back when the queue is full.
    pub fn offer(&self, element: E) -> Result<(), E> {
        self.offered.fetch_add(1, Ordering::Relaxed);
        match self.queue.push(element) {
            Ok(()) => Ok(()),
            Err(element) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                if !self.is_overflow() {
                    self.enter_overflow();
                }
                Err(element)
            }
        }
    }

    /// Remove and return up to `max` elements in FIFO order.
    pub fn drain_up_to(&self, max: usize) -> Vec<E> {
        let mut out = Vec::with_capacity(max.min(self.len()));
        self.drain_into(&mut out, max);
        out
    }

    /// Append up to `max` elements to `out` in FIFO order; returns how many.
    pub fn drain_into(&self, out: &mut Vec<E>, max: usize) -> usize {
        let drained = {
            let _drain = self.drain_lock.lock();
            let mut count = 0;
            while count < max {
                match self.queue.pop() {
                    Some(element) => {
                        out.push(element);
                        count += 1;
                    }
                    None => break,
                }
            }
            count
        };

        self.drained.fetch_add(drained as u64, Ordering::Relaxed);
        self.check_reset();
        drained
    }

    /// Drop every queued element; returns how many were removed.
    ///
    /// Bookkeeping matches a full drain, so an active overflow episode ends.
    pub fn clear(&self) -> usize {
        let cleared = {
            let _drain = self.drain_lock.lock();
            let mut count = 0;
            while self.queue.pop().is_some() {
                count += 1;
            }
            count
        };

        self.drained.fetch_add(cleared as u64, Ordering::Relaxed);
        self.check_reset();
        cleared
    }

    /// Snapshot of the traffic counters.
    pub fn metrics(&self) -> QueueMetrics {
        let offered = self.offered.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        QueueMetrics {
            offered,
            accepted: offered.saturating_sub(rejected),
            rejected,
            drained: self.drained.load(Ordering::Relaxed),
            overflow_episodes: self.episodes.load(Ordering::Relaxed),
        }
    }

    fn enter_overflow(&self) {
        let _transition = self.transition.lock();
        if self.overflow.swap(true, Ordering::AcqRel) {
            return;
        }
        self.episodes.fetch_add(1, Ordering::Relaxed);
        warn!(
            capacity = self.capacity(),
            reset_threshold = self.reset_threshold,
            "Queue overflow, rejecting input"
        );
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_overflow();
        }
    }

    fn check_reset(&self) {
        if !self.is_overflow() || self.len() > self.reset_threshold {
            return;
        }
        let _transition = self.transition.lock();
        if self.len() > self.reset_threshold || !self.overflow.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(
            len = self.len(),
            reset_threshold = self.reset_threshold,
            "Queue overflow reset"
        );
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_reset();
        }
    }
}
