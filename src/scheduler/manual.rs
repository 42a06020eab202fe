use super::{TaskCallback, TaskHandle, TaskScheduler};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::error;

struct ManualTask {
    id: u64,
    name: String,
    handle: TaskHandle,
    callback: Mutex<TaskCallback>,
}

/// Deterministic scheduler for tests: nothing runs until [`run_once`] is
/// called, which synchronously invokes every registered task once on the
/// calling thread, in registration order.
///
/// The error contract matches the production scheduler: a panicking callback
/// is caught and logged, and the task stays registered.
///
/// [`run_once`]: ManualTaskScheduler::run_once
pub struct ManualTaskScheduler {
    tasks: Mutex<Vec<Arc<ManualTask>>>,
    next_id: AtomicU64,
}

impl ManualTaskScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Invokes every registered periodic task exactly once.
    pub fn run_once(&self) {
        // Snapshot under the lock, invoke outside it: callbacks may register
        // or stop tasks while running.
        let snapshot: Vec<Arc<ManualTask>> = self
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .clone();

        for task in snapshot {
            if task.handle.control().is_stopped() {
                continue;
            }
            let mut callback = task.callback.lock().expect("task callback lock poisoned");
            if catch_unwind(AssertUnwindSafe(|| (callback)())).is_err() {
                error!(task = %task.name, "periodic task panicked, will run again");
            }
        }

        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .retain(|task| !task.handle.control().is_stopped());
    }

    /// Invokes every registered periodic task `n` times.
    pub fn run(&self, n: usize) {
        for _ in 0..n {
            self.run_once();
        }
    }
}

impl Default for ManualTaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler for ManualTaskScheduler {
    fn start_periodic(&self, callback: TaskCallback, _min_wait: Duration, name: &str) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id);
        self.tasks
            .lock()
            .expect("task list lock poisoned")
            .push(Arc::new(ManualTask {
                id,
                name: name.to_string(),
                handle: handle.clone(),
                callback: Mutex::new(callback),
            }));
        handle
    }

    fn stop_periodic(&self, handle: &TaskHandle) -> bool {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        let Some(position) = tasks.iter().position(|t| t.id == handle.id()) else {
            return false;
        };
        let task = tasks.remove(position);
        task.handle.control().stop();
        true
    }

    fn periodic_task_count(&self) -> usize {
        self.tasks.lock().expect("task list lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_nothing_runs_without_stepping() {
        let scheduler = ManualTaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler.start_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            Duration::ZERO,
            "idle",
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run_once_invokes_each_task_once() {
        let scheduler = ManualTaskScheduler::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        for counter in [Arc::clone(&a), Arc::clone(&b)] {
            scheduler.start_periodic(
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    None
                }),
                Duration::ZERO,
                "task",
            );
        }

        scheduler.run_once();
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        scheduler.run(3);
        assert_eq!(a.load(Ordering::SeqCst), 4);
        assert_eq!(b.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_stopped_task_no_longer_runs() {
        let scheduler = ManualTaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = scheduler.start_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            Duration::ZERO,
            "stoppable",
        );

        scheduler.run_once();
        assert!(scheduler.stop_periodic(&handle));
        scheduler.run(5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.periodic_task_count(), 0);
    }

    #[test]
    fn test_panicking_task_stays_registered() {
        let scheduler = ManualTaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler.start_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("always fails");
            }),
            Duration::ZERO,
            "panicky",
        );

        scheduler.run(3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.periodic_task_count(), 1);
    }

    #[test]
    fn test_tasks_run_in_registration_order() {
        let scheduler = ManualTaskScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            scheduler.start_periodic(
                Box::new(move || {
                    order.lock().unwrap().push(tag);
                    None
                }),
                Duration::ZERO,
                tag,
            );
        }
        scheduler.run_once();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
