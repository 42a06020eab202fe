use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A resettable completion flag with bounded waiting.
///
/// Stages set the flag once they have processed everything their upstream has
/// produced, and clear it when new pending work arrives. Consumers block on
/// [`wait`] to observe the caught-up state. Multi-stage waits compose by
/// subtracting the time spent on the first wait from the budget of the second.
///
/// [`wait`]: CaughtUpFlag::wait
pub struct CaughtUpFlag {
    caught_up: Mutex<bool>,
    cond: Condvar,
}

impl CaughtUpFlag {
    pub fn new() -> Self {
        Self {
            caught_up: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut caught_up = self.caught_up.lock().expect("caught-up lock poisoned");
        *caught_up = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        let mut caught_up = self.caught_up.lock().expect("caught-up lock poisoned");
        *caught_up = false;
    }

    pub fn is_set(&self) -> bool {
        *self.caught_up.lock().expect("caught-up lock poisoned")
    }

    /// Blocks until the flag is set. With `Some(timeout)` the wait is bounded;
    /// returns whether the flag was observed set.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut caught_up = self.caught_up.lock().expect("caught-up lock poisoned");
        match timeout {
            None => {
                while !*caught_up {
                    caught_up = self
                        .cond
                        .wait(caught_up)
                        .expect("caught-up lock poisoned");
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*caught_up {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(caught_up, deadline - now)
                        .expect("caught-up lock poisoned");
                    caught_up = guard;
                }
                true
            }
        }
    }
}

impl Default for CaughtUpFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Remaining time budget after `elapsed` has been spent, for composing
/// sequential waits. `None` (unbounded) stays unbounded.
pub fn remaining_budget(timeout: Option<Duration>, started: Instant) -> Option<Duration> {
    timeout.map(|t| t.saturating_sub(started.elapsed()))
}
