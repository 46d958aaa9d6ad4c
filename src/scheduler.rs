//! Periodic task scheduling.
//!
//! Buffer processors do not reach for a process-wide thread pool. Each one is
//! handed a [`Scheduler`] at construction, which makes the drain cadence an
//! explicit dependency:
//!
//! - [`TokioScheduler`]: runs tasks on a tokio runtime via `tokio::time::interval`
//! - [`ManualScheduler`]: virtual clock advanced by the caller, for tests and
//!   for embedding in loops that already own a clock
//!
//! Tasks are synchronous closures. A task that overruns its interval delays
//! the following runs; it is never run concurrently with itself.

use crate::error::{StreamError, StreamResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, trace};

/// Work run once per interval.
pub type Task = Box<dyn FnMut() + Send + 'static>;

/// Source of fixed-rate periodic execution.
pub trait Scheduler: Send + Sync {
    /// Run `task` now and then every `interval` until the returned handle is
    /// cancelled.
    fn schedule_at_fixed_rate(&self, interval: Duration, task: Task) -> ScheduledTask;
}

struct TaskState {
    cancelled: AtomicBool,
    abort: Mutex<Option<AbortHandle>>,
}

/// Handle to a scheduled periodic task.
///
/// Dropping the handle does not cancel the task.
#[derive(Clone)]
pub struct ScheduledTask {
    state: Arc<TaskState>,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ScheduledTask {
    fn new() -> Self {
        Self {
            state: Arc::new(TaskState {
                cancelled: AtomicBool::new(false),
                abort: Mutex::new(None),
            }),
        }
    }

    fn set_abort(&self, handle: AbortHandle) {
        if self.is_cancelled() {
            handle.abort();
        } else {
            *self.state.abort.lock() = Some(handle);
        }
    }

    /// Stop future runs.
    ///
    /// A run already in progress finishes; no run starts after this returns.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.state.abort.lock().take() {
            handle.abort();
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }
}

/// Scheduler backed by a tokio runtime.
///
/// The timer lives on the runtime; each run executes on its blocking pool,
/// never on the caller's thread or an async worker. A run that panics is
/// logged and the task keeps its schedule.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Schedule onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule onto the runtime the caller is running in.
    pub fn current() -> StreamResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| StreamError::Configuration(format!("no tokio runtime available: {e}")))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_at_fixed_rate(&self, interval: Duration, task: Task) -> ScheduledTask {
        let scheduled = ScheduledTask::new();
        let state = Arc::clone(&scheduled.state);
        let task = Arc::new(Mutex::new(task));

        let join = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if state.cancelled.load(Ordering::Acquire) {
                    break;
                }
                // Each run goes to the blocking pool and is awaited, so runs
                // never overlap and async workers stay free.
                let run = Arc::clone(&task);
                let run_state = Arc::clone(&state);
                let outcome = tokio::task::spawn_blocking(move || {
                    if !run_state.cancelled.load(Ordering::Acquire) {
                        let mut task = run.lock();
                        (*task)();
                    }
                })
                .await;
                if let Err(e) = outcome {
                    if e.is_cancelled() {
                        break;
                    }
                    error!(error = %e, "Periodic task panicked");
                }
            }
            trace!("Periodic task finished");
        });

        scheduled.set_abort(join.abort_handle());
        scheduled
    }
}

struct ManualEntry {
    interval: Duration,
    next_due: Duration,
    task: Task,
    handle: ScheduledTask,
}

/// Deterministic scheduler driven by an explicit virtual clock.
///
/// Tasks are due immediately when scheduled and then every interval of
/// virtual time. Nothing runs until [`ManualScheduler::advance`] or
/// [`ManualScheduler::run_pending`] is called.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    entries: Vec<ManualEntry>,
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &state.now)
            .field("tasks", &state.entries.len())
            .finish()
    }
}

impl ManualScheduler {
    /// Create a scheduler at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Number of live (not cancelled) tasks.
    pub fn task_count(&self) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| !entry.handle.is_cancelled())
            .count()
    }

    /// Run every task that is due at the current virtual time.
    pub fn run_pending(&self) -> usize {
        self.advance(Duration::ZERO)
    }

    /// Move the clock forward by `by`, running each task once per interval
    /// boundary crossed. Returns the number of task runs.
    pub fn advance(&self, by: Duration) -> usize {
        // Tasks run outside the lock so they may schedule or cancel work.
        let (now, mut entries) = {
            let mut state = self.inner.lock();
            state.now += by;
            (state.now, std::mem::take(&mut state.entries))
        };

        let mut runs = 0;
        for entry in entries.iter_mut() {
            while !entry.handle.is_cancelled() && entry.next_due <= now {
                (entry.task)();
                entry.next_due += entry.interval;
                runs += 1;
            }
        }
        entries.retain(|entry| !entry.handle.is_cancelled());

        let mut state = self.inner.lock();
        entries.append(&mut state.entries);
        state.entries = entries;
        runs
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_at_fixed_rate(&self, interval: Duration, task: Task) -> ScheduledTask {
        let handle = ScheduledTask::new();
        let mut state = self.inner.lock();
        let next_due = state.now;
        state.entries.push(ManualEntry {
            interval,
            next_due,
            task,
            handle: handle.clone(),
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_runs_immediately_then_per_interval() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _task =
            scheduler.schedule_at_fixed_rate(Duration::from_millis(50), counting_task(&counter));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(scheduler.run_pending(), 0);

        scheduler.advance(Duration::from_millis(49));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        scheduler.advance(Duration::from_millis(150));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_manual_cancel_stops_runs() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task =
            scheduler.schedule_at_fixed_rate(Duration::from_millis(10), counting_task(&counter));

        scheduler.run_pending();
        task.cancel();
        task.cancel();
        scheduler.advance(Duration::from_millis(100));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fixed_rate() {
        let scheduler = TokioScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let task =
            scheduler.schedule_at_fixed_rate(Duration::from_millis(50), counting_task(&counter));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        task.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_task_survives_panicking_run() {
        let scheduler = TokioScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let runs = Arc::clone(&counter);
        let task = scheduler.schedule_at_fixed_rate(
            Duration::from_millis(50),
            Box::new(move || {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            }),
        );

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        task.cancel();
    }

    // Single-threaded runtime: a run executed on the worker would stall the
    // test body until the gate timed out.
    #[tokio::test]
    async fn test_tokio_task_blocks_without_stalling_runtime() {
        let scheduler = TokioScheduler::current().unwrap();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<bool>();
        let task = scheduler.schedule_at_fixed_rate(
            Duration::from_secs(3600),
            Box::new(move || {
                let opened = gate_rx.recv_timeout(Duration::from_secs(5)).is_ok();
                let _ = done_tx.send(opened);
            }),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate_tx.send(()).unwrap();
        let opened =
            tokio::task::spawn_blocking(move || done_rx.recv_timeout(Duration::from_secs(5)))
                .await
                .unwrap()
                .unwrap();
        assert!(opened);
        task.cancel();
    }

    #[test]
    fn test_current_without_runtime_is_error() {
        assert!(TokioScheduler::current().is_err());
    }
}
