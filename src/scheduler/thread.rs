use super::{TaskCallback, TaskControl, TaskHandle, TaskScheduler};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

struct TaskRecord {
    id: u64,
    name: String,
    control: Arc<TaskControl>,
}

/// Production scheduler: each periodic task runs on its own worker thread.
///
/// After a run completes, the task is rescheduled to run once at least the
/// wait time has elapsed since the previous run began. Panics inside a
/// callback are caught and logged; the task keeps running. Dropping the
/// scheduler stops every task (non-blocking, in-flight runs finish).
pub struct ThreadTaskScheduler {
    tasks: Mutex<Vec<TaskRecord>>,
    next_id: AtomicU64,
}

impl ThreadTaskScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for ThreadTaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler for ThreadTaskScheduler {
    fn start_periodic(
        &self,
        mut callback: TaskCallback,
        min_wait: Duration,
        name: &str,
    ) -> TaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TaskHandle::new(id);
        let control = Arc::clone(handle.control());

        debug!(task = name, id, ?min_wait, "starting periodic task");
        self.tasks.lock().expect("task list lock poisoned").push(TaskRecord {
            id,
            name: name.to_string(),
            control: Arc::clone(&control),
        });

        let task_name = name.to_string();
        let builder = thread::Builder::new().name(task_name.clone());
        builder
            .spawn(move || loop {
                if control.is_stopped() {
                    break;
                }
                let began = Instant::now();
                let next_wait = match catch_unwind(AssertUnwindSafe(|| callback())) {
                    Ok(wait) => wait,
                    Err(_) => {
                        error!(task = %task_name, "periodic task panicked, will run again");
                        None
                    }
                };
                let wait = next_wait.unwrap_or(min_wait);
                control.wait_until(began + wait);
            })
            .expect("failed to spawn periodic task thread");

        handle
    }

    fn stop_periodic(&self, handle: &TaskHandle) -> bool {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        let Some(position) = tasks.iter().position(|t| t.id == handle.id()) else {
            return false;
        };
        let record = tasks.remove(position);
        debug!(task = %record.name, id = record.id, "stopping periodic task");
        record.control.stop();
        true
    }

    fn periodic_task_count(&self) -> usize {
        self.tasks.lock().expect("task list lock poisoned").len()
    }
}

impl Drop for ThreadTaskScheduler {
    fn drop(&mut self) {
        let tasks = self.tasks.lock().expect("task list lock poisoned");
        for task in tasks.iter() {
            task.control.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_task_runs_repeatedly() {
        let scheduler = ThreadTaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = scheduler.start_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            Duration::from_millis(1),
            "counter",
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(runs.load(Ordering::SeqCst) >= 3, "task should have run repeatedly");
        assert!(scheduler.stop_periodic(&handle));
    }

    #[test]
    fn test_stop_prevents_further_runs() {
        let scheduler = ThreadTaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = scheduler.start_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }),
            Duration::from_millis(1),
            "stopped",
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(scheduler.stop_periodic(&handle));
        assert_eq!(scheduler.periodic_task_count(), 0);

        // Allow any in-flight run to finish, then verify the count settles.
        thread::sleep(Duration::from_millis(20));
        let settled = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), settled);
    }

    #[test]
    fn test_stop_twice_returns_false() {
        let scheduler = ThreadTaskScheduler::new();
        let handle =
            scheduler.start_periodic(Box::new(|| None), Duration::from_millis(10), "once");
        assert!(scheduler.stop_periodic(&handle));
        assert!(!scheduler.stop_periodic(&handle));
    }

    #[test]
    fn test_panicking_task_survives() {
        let scheduler = ThreadTaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = scheduler.start_periodic(
            Box::new(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("first run explodes");
                }
                None
            }),
            Duration::from_millis(1),
            "panicky",
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(
            runs.load(Ordering::SeqCst) >= 3,
            "task should keep running after a panic"
        );
        scheduler.stop_periodic(&handle);
    }

    #[test]
    fn test_callback_controls_its_own_pace() {
        let scheduler = ThreadTaskScheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        // min_wait is enormous but the callback overrides with a tiny wait.
        let handle = scheduler.start_periodic(
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(Duration::from_millis(1))
            }),
            Duration::from_secs(3600),
            "self-paced",
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while runs.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(runs.load(Ordering::SeqCst) >= 2);
        scheduler.stop_periodic(&handle);
    }
}
