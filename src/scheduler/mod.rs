//! Periodic task scheduling for the pipeline stages.
//!
//! Every stage performs all of its work inside one periodic callback, driven
//! by a [`TaskScheduler`] injected at construction. Production code uses
//! [`ThreadTaskScheduler`]; tests use [`ManualTaskScheduler`] to single-step
//! the whole pipeline deterministically.

mod manual;
mod thread;

pub use manual::ManualTaskScheduler;
pub use thread::ThreadTaskScheduler;

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A periodic callback. Returning `Some(duration)` overrides the wait before
/// the next run (self-paced backoff); `None` uses the task's configured
/// minimum wait.
pub type TaskCallback = Box<dyn FnMut() -> Option<Duration> + Send>;

/// Schedules callbacks that run repeatedly with a minimum spacing between
/// runs. A task is never invoked concurrently with itself.
pub trait TaskScheduler: Send + Sync {
    /// Registers `callback` to run periodically, at least `min_wait` apart
    /// (measured from the start of one run to the start of the next).
    fn start_periodic(&self, callback: TaskCallback, min_wait: Duration, name: &str) -> TaskHandle;

    /// Flags the task for removal without blocking. An in-flight run is
    /// allowed to finish; no further runs occur. Returns whether the handle
    /// referred to a registered task.
    fn stop_periodic(&self, handle: &TaskHandle) -> bool;

    /// Number of currently registered periodic tasks.
    fn periodic_task_count(&self) -> usize;
}

/// Handle to a started periodic task.
#[derive(Clone)]
pub struct TaskHandle {
    id: u64,
    control: Arc<TaskControl>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            control: Arc::new(TaskControl::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn control(&self) -> &Arc<TaskControl> {
        &self.control
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

/// Shared stop flag plus a condvar so a sleeping worker wakes up promptly when
/// its task is stopped.
pub(crate) struct TaskControl {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl TaskControl {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn stop(&self) {
        let mut stopped = self.stopped.lock().expect("task control lock poisoned");
        *stopped = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock().expect("task control lock poisoned")
    }

    /// Sleeps until `deadline` or until the task is stopped, whichever comes
    /// first.
    pub(crate) fn wait_until(&self, deadline: Instant) {
        let mut stopped = self.stopped.lock().expect("task control lock poisoned");
        loop {
            if *stopped {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(stopped, deadline - now)
                .expect("task control lock poisoned");
            stopped = guard;
        }
    }
}
