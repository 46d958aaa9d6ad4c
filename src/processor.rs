//! Scheduled buffer processor.
//!
//! Decouples a fast producer from its consumer. The producer calls
//! [`ScheduledBufferProcessor::receive`], which only offers the element to an
//! [`OverflowableQueue`] and returns. A periodic task, run by the injected
//! [`Scheduler`], drains at most `max_buffers_per_interval` elements per run
//! and pushes them in order to the single registered [`Listener`].
//!
//! Worst-case consumer invocation rate is therefore bounded by
//! `max_buffers_per_interval / distribution_interval`, and queued memory by
//! `capacity` elements, however bursty the producer is.
//!
//! # Failure isolation
//!
//! A listener error or panic is logged and counted; the rest of the batch is
//! still delivered and the task keeps running on schedule. A listener that
//! hangs stalls later runs, since delivery is synchronous.
//!
//! # Example
//!
//! ```
//! use sdr_stream::processor::{ProcessorConfig, ScheduledBufferProcessor};
//! use sdr_stream::scheduler::ManualScheduler;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let scheduler = ManualScheduler::new();
//! let config = ProcessorConfig {
//!     capacity: 10,
//!     reset_threshold: 4,
//!     distribution_interval: Duration::from_millis(50),
//!     max_buffers_per_interval: 5,
//! };
//! let processor = ScheduledBufferProcessor::<u32>::new(&config, Arc::new(scheduler.clone()))?;
//! processor.set_listener(Some(Arc::new(|value: u32| -> anyhow::Result<()> {
//!     println!("got {value}");
//!     Ok(())
//! })));
//!
//! processor.start();
//! processor.receive(1);
//! scheduler.advance(Duration::from_millis(50));
//! assert_eq!(processor.stats().dispatched, 1);
//! # Ok::<(), sdr_stream::error::StreamError>(())
//! ```

use crate::error::{StreamError, StreamResult};
use crate::listener::{deliver, Delivery, Listener};
use crate::queue::{OverflowListener, OverflowableQueue, QueueMetrics};
use crate::scheduler::{ScheduledTask, Scheduler};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Queue sizing and drain cadence for a [`ScheduledBufferProcessor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Maximum queued elements; offers beyond this are dropped
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Queue size at or below which an overflow episode ends
    #[serde(default = "default_reset_threshold")]
    pub reset_threshold: usize,
    /// Period of the drain task (e.g. `"50ms"`)
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub distribution_interval: Duration,
    /// Maximum elements delivered per drain run
    #[serde(default = "default_max_buffers")]
    pub max_buffers_per_interval: usize,
}

fn default_capacity() -> usize {
    64
}

fn default_reset_threshold() -> usize {
    16
}

fn default_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_max_buffers() -> usize {
    16
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            reset_threshold: default_reset_threshold(),
            distribution_interval: default_interval(),
            max_buffers_per_interval: default_max_buffers(),
        }
    }
}

impl ProcessorConfig {
    /// Check the sizing invariants.
    pub fn validate(&self) -> StreamResult<()> {
        if self.capacity == 0 {
            return Err(StreamError::configuration("processor capacity must be > 0"));
        }
        if self.reset_threshold >= self.capacity {
            return Err(StreamError::Configuration(format!(
                "processor reset_threshold ({}) must be below capacity ({})",
                self.reset_threshold, self.capacity
            )));
        }
        validate_cadence(self.distribution_interval, self.max_buffers_per_interval)
    }
}

fn validate_cadence(interval: Duration, max_buffers_per_interval: usize) -> StreamResult<()> {
    if interval.is_zero() {
        return Err(StreamError::configuration(
            "processor distribution_interval must be > 0",
        ));
    }
    if max_buffers_per_interval == 0 {
        return Err(StreamError::configuration(
            "processor max_buffers_per_interval must be > 0",
        ));
    }
    Ok(())
}

/// Counters describing processor activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Underlying queue traffic
    pub queue: QueueMetrics,
    /// Elements currently waiting in the queue
    pub queued: usize,
    /// Elements delivered to the listener without error
    pub dispatched: u64,
    /// Deliveries that returned an error or panicked
    pub failures: u64,
}

struct Shared<E> {
    queue: OverflowableQueue<E>,
    listener: RwLock<Option<Arc<dyn Listener<E>>>>,
    max_buffers_per_interval: usize,
    dispatched: AtomicU64,
    failures: AtomicU64,
}

impl<E> Shared<E> {
    /// One scheduled run: drain a batch and deliver it in FIFO order.
    fn distribute(&self, batch: &mut Vec<E>) {
        self.queue.drain_into(batch, self.max_buffers_per_interval);
        if batch.is_empty() {
            return;
        }

        let listener = self.listener.read().clone();
        let Some(listener) = listener else {
            trace!(count = batch.len(), "No listener registered, discarding buffers");
            batch.clear();
            return;
        };

        for element in batch.drain(..) {
            match deliver(listener.as_ref(), element) {
                Delivery::Delivered => {
                    self.dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Failed(message) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(error = %message, "Error while dispatching buffer to listener");
                }
                Delivery::Panicked(message) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(panic = %message, "Listener panicked while dispatching buffer");
                }
            }
        }
    }
}

/// Bounded queue plus a periodic task that feeds one listener.
pub struct ScheduledBufferProcessor<E> {
    shared: Arc<Shared<E>>,
    scheduler: Arc<dyn Scheduler>,
    distribution_interval: Duration,
    running: AtomicBool,
    task: Mutex<Option<ScheduledTask>>,
}

impl<E: Send + 'static> ScheduledBufferProcessor<E> {
    /// Build a processor with its own queue sized from `config`.
    pub fn new(config: &ProcessorConfig, scheduler: Arc<dyn Scheduler>) -> StreamResult<Self> {
        config.validate()?;
        let queue = OverflowableQueue::new(config.capacity, config.reset_threshold)?;
        Self::with_queue(
            queue,
            config.distribution_interval,
            config.max_buffers_per_interval,
            scheduler,
        )
    }

    /// Build a processor around an existing queue.
    pub fn with_queue(
        queue: OverflowableQueue<E>,
        distribution_interval: Duration,
        max_buffers_per_interval: usize,
        scheduler: Arc<dyn Scheduler>,
    ) -> StreamResult<Self> {
        validate_cadence(distribution_interval, max_buffers_per_interval)?;

        Ok(Self {
            shared: Arc::new(Shared {
                queue,
                listener: RwLock::new(None),
                max_buffers_per_interval,
                dispatched: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            scheduler,
            distribution_interval,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Set or replace (`None` clears) the listener receiving drained elements.
    pub fn set_listener(&self, listener: Option<Arc<dyn Listener<E>>>) {
        *self.shared.listener.write() = listener;
    }

    /// Set or replace (`None` clears) the overflow/reset listener.
    pub fn set_overflow_listener(&self, listener: Option<Arc<dyn OverflowListener>>) {
        self.shared.queue.set_overflow_listener(listener);
    }

    /// Queue an element for distribution. Never blocks.
    ///
    /// Elements offered while the queue is full are dropped; the overflow
    /// listener hears about the episode, not about each drop.
    pub fn receive(&self, element: E) {
        if let Err(rejected) = self.shared.queue.offer(element) {
            drop(rejected);
        }
    }

    /// Begin periodic distribution. Calling it while running does nothing.
    pub fn start(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let mut batch = Vec::with_capacity(shared.max_buffers_per_interval);
        let task = self.scheduler.schedule_at_fixed_rate(
            self.distribution_interval,
            Box::new(move || shared.distribute(&mut batch)),
        );
        *self.task.lock() = Some(task);

        info!(
            capacity = self.shared.queue.capacity(),
            reset_threshold = self.shared.queue.reset_threshold(),
            interval_ms = self.distribution_interval.as_millis() as u64,
            max_buffers_per_interval = self.shared.max_buffers_per_interval,
            "Buffer processor started"
        );
    }

    /// Cancel periodic distribution and discard queued elements.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(task) = self.task.lock().take() {
            task.cancel();
        }
        let cleared = self.clear_queue();
        info!(cleared, "Buffer processor stopped");
    }

    /// Discard every queued element; returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let cleared = self.shared.queue.clear();
        if cleared > 0 {
            debug!(cleared, "Cleared buffer processor queue");
        }
        cleared
    }

    /// Whether the periodic task is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Elements currently queued.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Activity counters.
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            queue: self.shared.queue.metrics(),
            queued: self.shared.queue.len(),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
        }
    }
}

impl<E: Send + 'static> Listener<E> for ScheduledBufferProcessor<E> {
    fn receive(&self, item: E) -> anyhow::Result<()> {
        ScheduledBufferProcessor::receive(self, item);
        Ok(())
    }
}

impl<E> Drop for ScheduledBufferProcessor<E> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use anyhow::bail;
    use tracing_test::traced_test;

    fn processor(
        capacity: usize,
        reset_threshold: usize,
        max: usize,
    ) -> (ScheduledBufferProcessor<u32>, ManualScheduler) {
        let scheduler = ManualScheduler::new();
        let config = ProcessorConfig {
            capacity,
            reset_threshold,
            distribution_interval: Duration::from_millis(10),
            max_buffers_per_interval: max,
        };
        let processor = ScheduledBufferProcessor::new(&config, Arc::new(scheduler.clone())).unwrap();
        (processor, scheduler)
    }

    fn collecting_listener() -> (Arc<dyn Listener<u32>>, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn Listener<u32>> = Arc::new(move |value: u32| -> anyhow::Result<()> {
            sink.lock().push(value);
            Ok(())
        });
        (listener, seen)
    }

    #[test]
    fn test_config_validation() {
        assert!(ProcessorConfig::default().validate().is_ok());

        let mut config = ProcessorConfig::default();
        config.reset_threshold = config.capacity;
        assert!(config.validate().is_err());

        let mut config = ProcessorConfig::default();
        config.max_buffers_per_interval = 0;
        assert!(config.validate().is_err());

        let mut config = ProcessorConfig::default();
        config.distribution_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_start_is_idempotent() {
        let (processor, scheduler) = processor(8, 2, 4);
        processor.start();
        processor.start();
        assert!(processor.is_running());
        assert_eq!(scheduler.task_count(), 1);

        processor.stop();
        processor.stop();
        assert!(!processor.is_running());
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_drains_in_order_with_batch_limit() {
        let (processor, scheduler) = processor(16, 4, 3);
        let (listener, seen) = collecting_listener();
        processor.set_listener(Some(listener));

        for i in 0..7 {
            processor.receive(i);
        }
        processor.start();

        scheduler.run_pending();
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5]);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_no_distribution_while_stopped() {
        let (processor, scheduler) = processor(8, 2, 8);
        let (listener, seen) = collecting_listener();
        processor.set_listener(Some(listener));

        processor.receive(1);
        processor.receive(2);
        scheduler.advance(Duration::from_millis(100));

        assert!(seen.lock().is_empty());
        assert_eq!(processor.queue_len(), 2);
    }

    #[test]
    fn test_failing_listener_does_not_abort_batch() {
        let (processor, scheduler) = processor(8, 2, 8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        processor.set_listener(Some(Arc::new(move |value: u32| -> anyhow::Result<()> {
            if value == 1 {
                bail!("bad buffer {value}");
            }
            if value == 2 {
                panic!("listener blew up");
            }
            sink.lock().push(value);
            Ok(())
        })));

        for i in 0..5 {
            processor.receive(i);
        }
        processor.start();
        scheduler.run_pending();

        assert_eq!(*seen.lock(), vec![0, 3, 4]);
        let stats = processor.stats();
        assert_eq!(stats.dispatched, 3);
        assert_eq!(stats.failures, 2);

        // Later runs still happen.
        processor.receive(10);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(*seen.lock(), vec![0, 3, 4, 10]);
    }

    #[test]
    fn test_listener_replacement_last_writer_wins() {
        let (processor, scheduler) = processor(8, 2, 8);
        let (first, first_seen) = collecting_listener();
        let (second, second_seen) = collecting_listener();
        processor.set_listener(Some(first));
        processor.set_listener(Some(second));

        processor.receive(5);
        processor.start();
        scheduler.run_pending();

        assert!(first_seen.lock().is_empty());
        assert_eq!(*second_seen.lock(), vec![5]);
    }

    #[test]
    fn test_drop_cancels_task() {
        let (processor, scheduler) = processor(8, 2, 8);
        processor.start();
        assert_eq!(scheduler.task_count(), 1);
        drop(processor);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    #[traced_test]
    fn test_listener_failure_is_logged() {
        let (processor, scheduler) = processor(8, 2, 8);
        processor.set_listener(Some(Arc::new(|value: u32| -> anyhow::Result<()> {
            bail!("cannot use buffer {value}")
        })));

        processor.receive(42);
        processor.start();
        scheduler.run_pending();

        assert!(logs_contain("Error while dispatching buffer to listener"));
        assert!(logs_contain("cannot use buffer 42"));
        assert!(logs_contain("Buffer processor started"));
    }
}
