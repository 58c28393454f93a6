//! # Priority Scheduler
//!
//! Concurrency-bounded async task runner shared by the puller and importer.
//!
//! ## Overview
//!
//! - Tasks are ranked `Instant > High > Normal > Low > Idle` and run FIFO
//!   within a rank. The dispatcher always drains the highest non-empty rank
//!   first.
//! - At most `concurrency` tasks run at once; everything else waits in the
//!   queue.
//! - A task failing with a remote rate limit is re-queued at `Low` after the
//!   configured delay. It is never reported as a terminal error.
//! - Every other failure is handed to the [`SchedulerObserver`] together with
//!   the task id and context so the owning item can be marked.
//!
//! ## Disposal
//!
//! [`Scheduler::dispose`] drops pending work, stops accepting new tasks and
//! then awaits tasks that are already running. Follow-up tasks those
//! in-flight bodies try to add are rejected with `SchedulerClosed`.
//!
//! ## Usage
//!
//! ```ignore
//! let scheduler = Scheduler::new(settings, observer);
//! scheduler.add(Task::new("list docs", Priority::Instant, move || {
//!     let puller = puller.clone();
//!     async move { puller.list_docs_page(None).await }
//! }))?;
//! scheduler.wait_idle().await;
//! ```

use core_runtime::config::SchedulerSettings;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};

/// Task priority, highest first when dispatching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work that must not compete with throughput (snapshots, moves)
    Idle = 0,
    /// Retries and polling
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Instant = 4,
}

impl Priority {
    const LEVELS: usize = 5;

    fn slot(self) -> usize {
        self as usize
    }
}

pub type TaskFuture = BoxFuture<'static, Result<()>>;

type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// A re-runnable unit of work.
///
/// The body is a factory rather than a single future so the scheduler can
/// run the same task again after a rate-limit demotion.
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub priority: Priority,
    /// Status id reported on failure; defaults to the task id
    pub context: Option<String>,
    execute: TaskFn,
}

impl Task {
    pub fn new<F, Fut>(id: impl Into<String>, priority: Priority, execute: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority,
            context: None,
            execute: Arc::new(move || execute().boxed()),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn context_id(&self) -> &str {
        self.context.as_deref().unwrap_or(&self.id)
    }

    fn run(&self) -> TaskFuture {
        (self.execute)()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("context", &self.context)
            .finish()
    }
}

/// Receives task outcomes the scheduler cannot resolve itself.
#[cfg_attr(test, mockall::automock)]
pub trait SchedulerObserver: Send + Sync {
    /// A task failed with a non-retryable error.
    fn on_error(&self, task_id: &str, context: &str, error: &SyncError);

    /// A task hit a rate limit and was demoted to `Low`.
    fn on_retry(&self, _task_id: &str, _context: &str) {}
}

#[derive(Default)]
struct State {
    queues: [VecDeque<Task>; Priority::LEVELS],
    running: usize,
    delayed: usize,
    closed: bool,
}

impl State {
    fn pending(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn pop_highest(&mut self) -> Option<Task> {
        self.queues.iter_mut().rev().find_map(VecDeque::pop_front)
    }

    fn is_idle(&self) -> bool {
        self.running == 0 && self.delayed == 0 && self.pending() == 0
    }
}

struct Inner {
    state: Mutex<State>,
    concurrency: usize,
    retry_delay: Duration,
    observer: Arc<dyn SchedulerObserver>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    idle: Notify,
}

/// Cloneable handle to a shared priority queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, observer: Arc<dyn SchedulerObserver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                concurrency: settings.concurrency.max(1),
                retry_delay: settings.rate_limit_retry_delay,
                observer,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                idle: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a task behind every pending task of the same or higher priority.
    pub fn add(&self, task: Task) -> Result<()> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(SyncError::SchedulerClosed);
            }
            debug!(task_id = %task.id, priority = ?task.priority, "Queued task");
            state.queues[task.priority.slot()].push_back(task);
        }
        self.next();
        Ok(())
    }

    /// Queue a task once `delay` has elapsed. The scheduler counts as busy
    /// while the delay runs.
    pub fn add_after(&self, task: Task, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return self.add(task);
        }

        {
            let mut state = self.state();
            if state.closed {
                return Err(SyncError::SchedulerClosed);
            }
            state.delayed += 1;
        }

        let scheduler = self.clone();
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scheduler.inner.shutdown.cancelled() => {}
            }

            scheduler.state().delayed -= 1;
            if scheduler.add(task).is_err() {
                debug!("Dropped delayed task after disposal");
                scheduler.notify_if_idle();
            }
        });
        Ok(())
    }

    /// Fill free concurrency slots with the highest-priority pending tasks.
    fn next(&self) {
        let ready: Vec<Task> = {
            let mut state = self.state();
            let mut ready = Vec::new();
            while state.running < self.inner.concurrency {
                match state.pop_highest() {
                    Some(task) => {
                        state.running += 1;
                        ready.push(task);
                    }
                    None => break,
                }
            }
            ready
        };

        for task in ready {
            let scheduler = self.clone();
            self.inner.tracker.spawn(async move { scheduler.run(task).await });
        }
    }

    async fn run(self, task: Task) {
        debug!(task_id = %task.id, priority = ?task.priority, "Running task");

        let outcome = AssertUnwindSafe(task.run())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SyncError::TaskPanicked(task.id.clone())));

        match outcome {
            Ok(()) => debug!(task_id = %task.id, "Task finished"),
            Err(e) if e.is_rate_limited() => {
                warn!(task_id = %task.id, "Rate limited, demoting task to low priority");
                self.inner.observer.on_retry(&task.id, task.context_id());
                let delay = self.inner.retry_delay;
                if self.add_after(task.with_priority(Priority::Low), delay).is_err() {
                    debug!("Scheduler closed, retry dropped");
                }
            }
            Err(SyncError::SchedulerClosed) => {
                debug!(task_id = %task.id, "Task stopped by scheduler disposal");
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Task failed");
                self.inner
                    .observer
                    .on_error(&task.id, task.context_id(), &e);
            }
        }

        self.state().running -= 1;
        self.next();
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    pub fn pending(&self) -> usize {
        self.state().pending()
    }

    pub fn running(&self) -> usize {
        self.state().running
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn is_idle(&self) -> bool {
        self.state().is_idle()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Resolves once nothing is queued, running or waiting on a retry delay.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Drop pending tasks, reject new ones and await in-flight tasks.
    pub async fn dispose(&self) {
        let dropped = {
            let mut state = self.state();
            state.closed = true;
            let dropped = state.pending();
            state.queues.iter_mut().for_each(VecDeque::clear);
            dropped
        };

        info!(dropped, "Disposing scheduler");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.idle.notify_waiters();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Scheduler")
            .field("concurrency", &self.inner.concurrency)
            .field("pending", &state.pending())
            .field("running", &state.running)
            .field("closed", &state.closed)
            .finish()
    }
}
