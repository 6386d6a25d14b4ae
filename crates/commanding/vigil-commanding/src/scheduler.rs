//! Delayed task execution.
//!
//! The engine never sleeps. Check windows are armed through a [`Scheduler`]:
//! [`TokioScheduler`] runs tasks on a tokio runtime, [`ManualScheduler`]
//! runs them when a virtual clock is advanced.

use crate::{Result, VerifyError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::trace;

/// Work to run once a delay has elapsed
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation handle of a scheduled task
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    /// Runtime task backing the timer, dropped together with its captures on cancel
    task: Option<Arc<tokio::task::AbortHandle>>,
}

impl TimerHandle {
    /// Prevent the task from running. No effect once it has run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Clock plus delayed execution
pub trait Scheduler: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` after `delay`, unless the returned handle is cancelled first
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Scheduler backed by a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    /// Use the runtime of the calling context
    pub fn try_current() -> Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::with_handle)
            .map_err(|e| VerifyError::Configuration(format!("no tokio runtime: {e}")))
    }

    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let guard = cancelled.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !guard.load(Ordering::SeqCst) {
                task();
            }
        });
        TimerHandle {
            cancelled,
            task: Some(Arc::new(join.abort_handle())),
        }
    }
}

struct ManualState {
    elapsed: Duration,
    next_seq: u64,
    queue: BTreeMap<(Duration, u64), (Task, TimerHandle)>,
}

/// Deterministic scheduler driven by [`ManualScheduler::advance`].
///
/// Tasks due at the same instant run in the order they were scheduled. Tasks
/// run on the advancing thread with no internal lock held, so they may
/// schedule further tasks.
pub struct ManualScheduler {
    epoch: DateTime<Utc>,
    state: Mutex<ManualState>,
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualScheduler {
    /// Virtual clock starting at the Unix epoch
    pub fn new() -> Self {
        Self::with_epoch(DateTime::<Utc>::from(SystemTime::UNIX_EPOCH))
    }

    pub fn with_epoch(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                next_seq: 0,
                queue: BTreeMap::new(),
            }),
        }
    }

    /// Virtual time since the epoch
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Tasks still due to run
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .queue
            .values()
            .filter(|(_, timer)| !timer.is_cancelled())
            .count()
    }

    /// Move the clock forward, running every task that falls due
    pub fn advance(&self, by: Duration) {
        let target = self.elapsed() + by;
        self.advance_to(target);
    }

    /// Move the clock to `target` since the epoch
    pub fn advance_to(&self, target: Duration) {
        loop {
            let due = {
                let mut state = self.state.lock();
                match state.queue.first_key_value() {
                    Some((&(at, _), _)) if at <= target => {
                        state.elapsed = state.elapsed.max(at);
                        state.queue.pop_first().map(|(_, entry)| entry)
                    }
                    _ => {
                        state.elapsed = state.elapsed.max(target);
                        None
                    }
                }
            };
            match due {
                Some((task, timer)) if !timer.is_cancelled() => task(),
                Some(_) => trace!("Skipping cancelled task"),
                None => break,
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.epoch + elapsed
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let timer = TimerHandle::default();
        let mut state = self.state.lock();
        let key = (state.elapsed + delay, state.next_seq);
        state.next_seq += 1;
        state.queue.insert(key, (task, timer.clone()));
        timer
    }
}
