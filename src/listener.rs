use crate::modification::Modification;
use crate::source::SourceId;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Receives change notifications from a [`crate::source::LogSource`].
///
/// The callback is invoked while the source holds its listener lock; listeners
/// are expected to do no more than queue the modification for later
/// processing.
pub trait SourceListener: Send + Sync {
    fn on_modified(&self, source: SourceId, modification: Modification);
}

/// Per-listener batching state.
///
/// Raw "read up to N lines" signals are folded into gap-free `Appended`
/// notifications of at most `max_count` lines each, spaced at least `max_wait`
/// apart unless a full batch is available.
struct ListenerNotifier {
    source: SourceId,
    listener: Arc<dyn SourceListener>,
    max_wait: Duration,
    max_count: usize,
    last_reported: usize,
    last_reported_at: Instant,
}

impl ListenerNotifier {
    /// Creating a notifier immediately reports `Reset`: the listener starts
    /// from a known-empty baseline and needs no separate backfill path.
    fn new(
        source: SourceId,
        listener: Arc<dyn SourceListener>,
        max_wait: Duration,
        max_count: usize,
    ) -> Self {
        let mut notifier = Self {
            source,
            listener,
            max_wait,
            max_count,
            last_reported: 0,
            last_reported_at: Instant::now(),
        };
        notifier.emit(Modification::Reset);
        notifier
    }

    fn emit(&mut self, modification: Modification) {
        self.listener.on_modified(self.source, modification);
    }

    /// The source has read up to `count` lines in total.
    fn on_read(&mut self, count: usize) {
        if count < self.last_reported {
            return;
        }
        loop {
            let pending = count - self.last_reported;
            if pending == 0 {
                break;
            }
            if pending >= self.max_count {
                let section = Modification::appended(self.last_reported, self.max_count);
                self.last_reported += self.max_count;
                self.last_reported_at = Instant::now();
                self.emit(section);
            } else if self.last_reported_at.elapsed() >= self.max_wait {
                let section = Modification::appended(self.last_reported, pending);
                self.last_reported = count;
                self.last_reported_at = Instant::now();
                self.emit(section);
            } else {
                break;
            }
        }
    }

    /// Catches the listener up to `count` regardless of `max_wait`, still
    /// chunked by `max_count`.
    fn flush(&mut self, count: usize) {
        while self.last_reported < count {
            let pending = count - self.last_reported;
            let take = pending.min(self.max_count);
            let section = Modification::appended(self.last_reported, take);
            self.last_reported += take;
            self.last_reported_at = Instant::now();
            self.emit(section);
        }
    }

    /// Lines from `index` on are gone. Clamped to what was actually reported:
    /// lines the listener never saw appended need no removal.
    fn invalidate(&mut self, index: usize) {
        if index < self.last_reported {
            let removed = Modification::removed(index, self.last_reported - index);
            self.last_reported = index;
            self.last_reported_at = Instant::now();
            self.emit(removed);
        }
    }

    /// Delivered immediately, never batched.
    fn reset(&mut self) {
        self.last_reported = 0;
        self.last_reported_at = Instant::now();
        self.emit(Modification::Reset);
    }

    fn properties_changed(&mut self) {
        self.emit(Modification::PropertiesChanged);
    }
}

struct CollectionState {
    notifiers: Vec<ListenerNotifier>,
    current_count: usize,
}

/// The set of listeners registered on one source.
///
/// Add, remove and every notification path are mutually exclusive behind a
/// single lock, so a listener is never invoked concurrently with its own
/// registration or removal.
pub struct ListenerCollection {
    source: SourceId,
    state: Mutex<CollectionState>,
}

impl ListenerCollection {
    pub fn new(source: SourceId) -> Self {
        Self {
            source,
            state: Mutex::new(CollectionState {
                notifiers: Vec::new(),
                current_count: 0,
            }),
        }
    }

    /// Registers `listener` and synchronously catches it up to the source's
    /// current count (`Reset` followed by `Appended` batches).
    pub fn add_listener(
        &self,
        listener: Arc<dyn SourceListener>,
        max_wait: Duration,
        max_count: usize,
    ) {
        assert!(max_count > 0, "max_count must be positive");
        let mut state = self.lock();
        let current = state.current_count;
        let mut notifier = ListenerNotifier::new(self.source, listener, max_wait, max_count);
        notifier.flush(current);
        state.notifiers.push(notifier);
    }

    /// Removes `listener`; returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn SourceListener>) -> bool {
        let mut state = self.lock();
        let before = state.notifiers.len();
        state
            .notifiers
            .retain(|n| !Arc::ptr_eq(&n.listener, listener));
        state.notifiers.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.lock().notifiers.len()
    }

    /// The source has read `count` lines in total since the last reset.
    pub fn on_read(&self, count: usize) {
        let mut state = self.lock();
        state.current_count = count;
        for notifier in &mut state.notifiers {
            notifier.on_read(count);
        }
    }

    /// Forces every listener up to the current count, ignoring `max_wait`.
    /// Called at the end of a read pass so a long wait cannot strand a tail
    /// of fewer than `max_count` lines.
    pub fn flush(&self) {
        let mut state = self.lock();
        let current = state.current_count;
        for notifier in &mut state.notifiers {
            notifier.flush(current);
        }
    }

    /// Content from `index` on has been retracted.
    pub fn invalidate(&self, index: usize) {
        let mut state = self.lock();
        state.current_count = state.current_count.min(index);
        for notifier in &mut state.notifiers {
            notifier.invalidate(index);
        }
    }

    /// The source was reset; delivered to every listener immediately.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.current_count = 0;
        for notifier in &mut state.notifiers {
            notifier.reset();
        }
    }

    pub fn properties_changed(&self) {
        let mut state = self.lock();
        for notifier in &mut state.notifiers {
            notifier.properties_changed();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CollectionState> {
        self.state.lock().expect("listener collection lock poisoned")
    }
}
