//! Recurring tasks with hang detection
//!
//! Each scheduled task gets its own loop task (the scheduling clock). Every
//! execution of the body is spawned onto a separate tokio task and raced
//! against the task's timeout, so a hung body is detected from the outside:
//!
//! - success: reschedule after `interval`
//! - timeout: abort the body, wait for it to be gone, reschedule after `interval`
//! - failure (`Err` or panic): terminal until `Scheduler::resubmit`
//!
//! Bodies only run while holding a permit from the shared `Workers` pool,
//! which also runs non-blocking cache refreshes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

type BodyFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;
type Work = Arc<dyn Fn() -> BodyFuture + Send + Sync>;

/// When a task first runs, how often it repeats, and how long one run may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Timing {
    /// Run immediately, then every `interval`.
    pub fn every(interval: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            interval,
            timeout,
        }
    }

    pub fn after(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }
}

/// Lifecycle of a recurring task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Closed,
}

impl TaskState {
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::TimedOut => "timed_out",
            TaskState::Closed => "closed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Counters for one recurring task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub scheduled: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Bounded pool of execution permits.
///
/// Cloning shares the pool. Closing it rejects new work and aborts the
/// background jobs still queued or running.
#[derive(Clone)]
pub struct Workers {
    inner: Arc<WorkersInner>,
}

struct WorkersInner {
    size: usize,
    permits: Arc<Semaphore>,
    background: Mutex<JoinSet<()>>,
}

impl Workers {
    /// Pool with `size` permits (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(WorkersInner {
                size,
                permits: Arc::new(Semaphore::new(size)),
                background: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Permits not currently held.
    pub fn idle(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Run `job` on the pool once a permit is free. Returns immediately.
    pub fn spawn<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let permits = self.inner.permits.clone();
        let mut background = self
            .inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                job.await;
            }
        });
        Ok(())
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)
    }

    async fn close(&self) {
        self.inner.permits.close();
        let mut background = std::mem::take(
            &mut *self
                .inner
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        background.abort_all();
        while background.join_next().await.is_some() {}
    }
}

struct TaskShared {
    name: String,
    timing: Timing,
    work: Work,
    scheduled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    state: watch::Sender<TaskState>,
    last_error: Mutex<Option<String>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl TaskShared {
    fn set_state(&self, state: TaskState) {
        self.state.send_replace(state);
    }

    fn stats(&self) -> TaskStats {
        TaskStats {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    fn last_error(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn runner(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.runner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Observer for one scheduled task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn timing(&self) -> Timing {
        self.shared.timing
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> TaskStats {
        self.shared.stats()
    }

    /// Reason of the most recent failure, if the task failed.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error().clone()
    }

    /// Wait until the task enters `target`.
    ///
    /// Transient states can be overwritten before a waiter observes them;
    /// this is reliable for `Failed` and `Closed`.
    pub async fn wait_for_state(&self, target: TaskState) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == target).await;
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Runs recurring tasks on a shared worker pool.
pub struct Scheduler {
    workers: Workers,
    tasks: Mutex<Vec<Arc<TaskShared>>>,
    closing: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            workers: Workers::new(workers),
            tasks: Mutex::new(Vec::new()),
            closing,
        }
    }

    /// Pool shared with non-blocking cache refreshes.
    pub fn workers(&self) -> &Workers {
        &self.workers
    }

    pub fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|shared| TaskHandle {
                shared: shared.clone(),
            })
            .collect()
    }

    /// Register `work` to run per `timing` until it fails or the scheduler
    /// shuts down.
    pub fn schedule<F, Fut, E>(
        &self,
        name: impl Into<String>,
        timing: Timing,
        work: F,
    ) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let work: Work = Arc::new(move || -> BodyFuture {
            let run = work();
            Box::pin(async move { run.await.map_err(|e| e.to_string()) })
        });
        let (state, _) = watch::channel(TaskState::Idle);
        let shared = Arc::new(TaskShared {
            name: name.into(),
            timing,
            work,
            scheduled: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            state,
            last_error: Mutex::new(None),
            runner: Mutex::new(None),
        });

        self.start(&shared);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(shared.clone());
        info!(
            task = %shared.name,
            initial_delay_ms = timing.initial_delay.as_millis() as u64,
            interval_ms = timing.interval.as_millis() as u64,
            timeout_ms = timing.timeout.as_millis() as u64,
            "scheduled recurring task"
        );
        Ok(TaskHandle { shared })
    }

    /// Restart a failed task with its original timing.
    pub fn resubmit(&self, handle: &TaskHandle) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        // Claim the Failed -> Scheduled transition before spawning, so a
        // concurrent resubmit cannot start a second loop.
        let mut current = TaskState::Failed;
        let claimed = handle.shared.state.send_if_modified(|state| {
            current = *state;
            if *state == TaskState::Failed {
                *state = TaskState::Scheduled;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(Error::InvalidState(format!(
                "task {} is {current}, only failed tasks can be resubmitted",
                handle.name()
            )));
        }
        handle.shared.last_error().take();
        self.start(&handle.shared);
        info!(task = %handle.name(), "resubmitted failed task");
        Ok(())
    }

    /// Cancel all pending and in-flight work and refuse new work.
    ///
    /// Idempotent. Returns once every task loop has exited.
    pub async fn shutdown(&self) {
        if self.closing.send_replace(true) {
            debug!("scheduler already shut down");
            return;
        }
        info!("shutting down scheduler");

        self.workers.close().await;
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for task in &tasks {
            let runner = task.runner().take();
            if let Some(runner) = runner {
                let _ = runner.await;
            }
            task.set_state(TaskState::Closed);
        }
        info!(tasks = tasks.len(), "scheduler stopped");
    }

    fn start(&self, shared: &Arc<TaskShared>) {
        let runner = tokio::spawn(run_task(
            shared.clone(),
            self.workers.clone(),
            self.closing.subscribe(),
        ));
        *shared.runner() = Some(runner);
    }
}

enum Outcome {
    Succeeded,
    TimedOut,
    Failed(String),
    Closed,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::TimedOut => "timed_out",
            Outcome::Failed(_) => "failed",
            Outcome::Closed => "closed",
        }
    }
}

async fn run_task(task: Arc<TaskShared>, workers: Workers, mut closing: watch::Receiver<bool>) {
    let mut delay = task.timing.initial_delay;
    loop {
        task.scheduled.fetch_add(1, Ordering::Relaxed);
        task.set_state(TaskState::Scheduled);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = closed(&mut closing) => return,
        }

        let outcome = execute(&task, &workers, &mut closing).await;
        record_run(&task.name, outcome.label());

        match outcome {
            Outcome::Succeeded => {
                task.succeeded.fetch_add(1, Ordering::Relaxed);
                task.set_state(TaskState::Succeeded);
                debug!(task = %task.name, "task run succeeded");
            }
            Outcome::TimedOut => {
                task.timed_out.fetch_add(1, Ordering::Relaxed);
                task.set_state(TaskState::TimedOut);
                warn!(
                    task = %task.name,
                    timeout_ms = task.timing.timeout.as_millis() as u64,
                    "task exceeded its timeout, abandoned and rescheduled"
                );
            }
            Outcome::Failed(reason) => {
                task.failed.fetch_add(1, Ordering::Relaxed);
                *task.last_error() = Some(reason.clone());
                task.set_state(TaskState::Failed);
                error!(task = %task.name, error = %reason, "task failed, not rescheduling");
                return;
            }
            Outcome::Closed => return,
        }

        delay = task.timing.interval;
    }
}

/// One execution of the body, bounded by the task's timeout.
///
/// On shutdown the body is aborted and awaited before returning.
async fn execute(
    task: &TaskShared,
    workers: &Workers,
    closing: &mut watch::Receiver<bool>,
) -> Outcome {
    let permit = tokio::select! {
        permit = workers.acquire() => permit,
        _ = closed(closing) => return Outcome::Closed,
    };
    let Ok(_permit) = permit else {
        return Outcome::Closed;
    };
    task.set_state(TaskState::Running);

    let mut body = tokio::spawn((task.work)());
    let _abort = AbortOnDrop(body.abort_handle());
    let finished = tokio::select! {
        finished = tokio::time::timeout(task.timing.timeout, &mut body) => finished,
        _ = closed(closing) => {
            body.abort();
            let _ = body.await;
            return Outcome::Closed;
        }
    };

    match finished {
        Ok(Ok(Ok(()))) => Outcome::Succeeded,
        Ok(Ok(Err(reason))) => Outcome::Failed(reason),
        Ok(Err(e)) if e.is_panic() => Outcome::Failed("task panicked".to_string()),
        Ok(Err(_)) => Outcome::Failed("task cancelled".to_string()),
        Err(_) => {
            body.abort();
            let _ = body.await;
            Outcome::TimedOut
        }
    }
}

async fn closed(closing: &mut watch::Receiver<bool>) {
    let _ = closing.wait_for(|closed| *closed).await;
}

/// Aborts the body if the loop driving it is dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn record_run(task: &str, outcome: &'static str) {
    metrics::counter!(
        "scheduler_task_runs_total",
        "task" => task.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
