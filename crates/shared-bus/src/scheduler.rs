//! # Recurring Tasks
//!
//! The store transport polls and cleans up on fixed periods. It asks a
//! [`TaskScheduler`] for that instead of owning timers, so a host can run
//! the work wherever it schedules its own.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// One run of a recurring task.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Produces a fresh future for every run.
pub type RecurringTask = Box<dyn FnMut() -> TaskFuture + Send + 'static>;

/// Runs work periodically.
pub trait TaskScheduler: Send + Sync {
    /// Run `task` after `initial_delay`, then every `period`, until the
    /// returned handle is cancelled or dropped. Runs never overlap.
    fn schedule(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        task: RecurringTask,
    ) -> TaskHandle;
}

/// Cancels a scheduled task. Dropping the handle cancels too.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Wrap a stop signal and, if the task runs on tokio, its join handle.
    #[must_use]
    pub fn new(
        name: &'static str,
        stop: watch::Sender<bool>,
        join: Option<JoinHandle<()>>,
    ) -> Self {
        Self { name, stop, join }
    }

    /// Stop scheduling further runs. A run in progress is aborted.
    pub fn cancel(&self) {
        let _ = self.stop.send(true);
        if let Some(join) = &self.join {
            join.abort();
        }
        debug!(task = self.name, "Scheduled task cancelled");
    }

    /// Whether the task has stopped for good.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match &self.join {
            Some(join) => join.is_finished(),
            None => *self.stop.borrow(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

/// Scheduler backed by tokio tasks and timers.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler {
    handle: Option<Handle>,
}

impl TokioScheduler {
    /// Spawn onto the runtime current at `schedule` time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn onto a specific runtime.
    #[must_use]
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(
        &self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        mut task: RecurringTask,
    ) -> TaskHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));

        let work = async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => task().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = name, "Scheduled task stopped");
        };

        let join = match &self.handle {
            Some(handle) => handle.spawn(work),
            None => tokio::spawn(work),
        };
        debug!(task = name, ?initial_delay, ?period, "Scheduled recurring task");

        TaskHandle::new(name, stop_tx, Some(join))
    }
}
