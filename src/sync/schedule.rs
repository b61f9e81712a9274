//! Cancellable scheduled tasks on tokio timers.
//!
//! A task runs `step` repeatedly; each step says how long to wait before the
//! next one, or that the task is done. `TaskHandle::stop` is synchronous and
//! idempotent: once it returns the task is aborted, and any state change the
//! step performs through `TaskGuard::commit` is either already complete or
//! will never happen.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// What a step wants to happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    After(Duration),
    Done,
}

struct TaskShared {
    name: &'static str,
    stopped: Mutex<bool>,
    finished: AtomicBool,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskShared {
    fn stopped(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Passed to every step; gates state mutation on the task still running.
#[derive(Clone)]
pub struct TaskGuard {
    shared: Arc<TaskShared>,
}

impl TaskGuard {
    /// Guard for work that no scheduled task owns. It is never stopped.
    pub fn unscoped() -> Self {
        TaskGuard {
            shared: Arc::new(TaskShared {
                name: "unscoped",
                stopped: Mutex::new(false),
                finished: AtomicBool::new(false),
                join: Mutex::new(None),
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stopped()
    }

    /// Run `f` unless the task was stopped. `stop()` cannot return while a
    /// commit is running, so nothing committed lands after it. `f` must not
    /// stop its own task.
    pub fn commit<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let stopped = self.shared.stopped();
        if *stopped {
            return None;
        }
        Some(f())
    }
}

/// Handle to a running scheduled task. Clones refer to the same task.
#[derive(Clone)]
pub struct TaskHandle {
    shared: Arc<TaskShared>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl TaskHandle {
    /// Cancel the pending timer and any in-progress step. Calling it again is
    /// a no-op.
    pub fn stop(&self) {
        {
            let mut stopped = self.shared.stopped();
            if *stopped {
                return;
            }
            *stopped = true;
        }
        let join = self
            .shared
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            join.abort();
        }
        debug!(task = self.shared.name, "Scheduled task stopped");
    }

    pub fn is_running(&self) -> bool {
        !*self.shared.stopped() && !self.shared.finished.load(Ordering::SeqCst)
    }
}

/// Spawn a task that waits `first_delay`, runs `step`, then waits whatever
/// the step asks for, until the step returns `Next::Done` or the task is
/// stopped.
pub fn spawn_scheduled<F, Fut>(
    name: &'static str,
    first_delay: Duration,
    mut step: F,
) -> TaskHandle
where
    F: FnMut(TaskGuard) -> Fut + Send + 'static,
    Fut: Future<Output = Next> + Send + 'static,
{
    let shared = Arc::new(TaskShared {
        name,
        stopped: Mutex::new(false),
        finished: AtomicBool::new(false),
        join: Mutex::new(None),
    });
    let guard = TaskGuard {
        shared: Arc::clone(&shared),
    };

    let join = tokio::spawn(async move {
        let mut delay = first_delay;
        loop {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if guard.is_stopped() {
                break;
            }
            match step(guard.clone()).await {
                Next::After(d) => delay = d,
                Next::Done => break,
            }
        }
        guard.shared.finished.store(true, Ordering::SeqCst);
    });

    *shared.join.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
    TaskHandle { shared }
}

/// Spawn a task that runs `step` every `period`, first after `first_delay`.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    first_delay: Duration,
    period: Duration,
    mut step: F,
) -> TaskHandle
where
    F: FnMut(TaskGuard) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_scheduled(name, first_delay, move |guard| {
        let fut = step(guard);
        async move {
            fut.await;
            Next::After(period)
        }
    })
}
