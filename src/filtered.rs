use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::entry::LogEntry;
use crate::filter::{LogEntryFilter, NoThrowFilter};
use crate::listener::{ListenerCollection, SourceListener};
use crate::modification::Modification;
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::section::LogSection;
use crate::source::{
    assert_index_in_range, assert_section_in_range, fetch_section, LogSource, SourceError,
    SourceId,
};
use crate::sync::{remaining_budget, CaughtUpFlag};

/// How many upstream lines are fetched and evaluated per batch.
const BATCH_SIZE: usize = 1000;

/// Batching parameters for the listener this stage registers upstream.
const SOURCE_MAX_WAIT: Duration = Duration::from_millis(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Queues upstream modifications for the stage's periodic task and marks the
/// stage as no longer caught up the moment one arrives.
struct ForwardListener {
    sender: Mutex<Sender<Modification>>,
    caught_up: Arc<CaughtUpFlag>,
}

impl SourceListener for ForwardListener {
    fn on_modified(&self, _source: SourceId, modification: Modification) {
        self.caught_up.clear();
        // The receiver only disappears once the stage is dropped; a failed
        // send then has nobody left to care.
        let _ = self
            .sender
            .lock()
            .expect("forward sender lock poisoned")
            .send(modification);
    }
}

struct FilterState {
    /// Entries that passed, re-indexed to this stage. `original_index` holds
    /// each entry's upstream index, ascending.
    entries: Vec<LogEntry>,
    /// Next upstream index to evaluate.
    cursor: usize,
    /// Minimum bounding section of everything announced upstream, coalesced
    /// across queued `Appended` notifications.
    full: LogSection,
    /// Lines of the trailing, possibly still growing logical entry.
    group: Vec<LogEntry>,
    /// How many lines of `group` have already been emitted. A group that
    /// passed tentatively keeps its lines even if later lines would have
    /// flipped the verdict.
    group_emitted: usize,
}

struct Inner {
    id: SourceId,
    upstream: Arc<dyn LogSource>,
    filter: NoThrowFilter,
    pending: Mutex<Receiver<Modification>>,
    state: Mutex<FilterState>,
    listeners: ListenerCollection,
    caught_up: Arc<CaughtUpFlag>,
}

/// A live view of the entries of another source that pass a filter.
///
/// Entries are re-indexed to be gap-free; `original_index` preserves each
/// entry's upstream position so selections survive filter changes.
/// Multi-line entries are evaluated as a whole: the entry passes when the
/// filter is satisfied by its lines together, and then all of its lines are
/// shown. The trailing entry of a still-growing source is evaluated
/// tentatively and extended as its lines arrive.
pub struct FilteredLogSource {
    inner: Arc<Inner>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskHandle,
    forward: Arc<dyn SourceListener>,
}

impl FilteredLogSource {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        upstream: Arc<dyn LogSource>,
        filter: Arc<dyn LogEntryFilter>,
    ) -> Arc<Self> {
        let id = SourceId::next();
        let caught_up = Arc::new(CaughtUpFlag::new());
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(Inner {
            id,
            upstream: Arc::clone(&upstream),
            filter: NoThrowFilter::new(filter),
            pending: Mutex::new(receiver),
            state: Mutex::new(FilterState {
                entries: Vec::new(),
                cursor: 0,
                full: LogSection::new(0, 0),
                group: Vec::new(),
                group_emitted: 0,
            }),
            listeners: ListenerCollection::new(id),
            caught_up: Arc::clone(&caught_up),
        });
        let forward: Arc<dyn SourceListener> = Arc::new(ForwardListener {
            sender: Mutex::new(sender),
            caught_up,
        });
        upstream.add_listener(Arc::clone(&forward), SOURCE_MAX_WAIT, BATCH_SIZE);

        let task_inner = Arc::clone(&inner);
        let task = scheduler.start_periodic(
            Box::new(move || task_inner.run_once()),
            POLL_INTERVAL,
            &format!("filter {}", id),
        );
        Arc::new(Self {
            inner,
            scheduler,
            task,
            forward,
        })
    }

    /// Maps an index of this view back to its upstream index, for keeping a
    /// selection stable when the filter changes.
    pub fn original_index_of(&self, index: usize) -> usize {
        self.inner.state.lock().expect("filter state lock poisoned").entries[index].original_index
    }

    /// Finds the view index showing the given upstream index, or the closest
    /// one before it when that line was filtered out.
    pub fn find_closest_to(&self, original_index: usize) -> Option<usize> {
        let state = self.inner.state.lock().expect("filter state lock poisoned");
        match state
            .entries
            .binary_search_by_key(&original_index, |e| e.original_index)
        {
            Ok(index) => Some(index),
            Err(0) => None,
            Err(insertion) => Some(insertion - 1),
        }
    }
}

impl Drop for FilteredLogSource {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(&self.task);
        self.inner.upstream.remove_listener(&self.forward);
    }
}

impl Inner {
    fn run_once(&self) -> Option<Duration> {
        let modifications = self.drain_pending();
        let busy = self.process(modifications);
        if busy {
            Some(Duration::ZERO)
        } else {
            self.listeners.flush();
            self.caught_up.set();
            None
        }
    }

    fn drain_pending(&self) -> Vec<Modification> {
        let receiver = self.pending.lock().expect("pending queue lock poisoned");
        let mut modifications = Vec::new();
        while let Ok(modification) = receiver.try_recv() {
            modifications.push(modification);
        }
        modifications
    }

    /// Applies queued upstream modifications, then evaluates one batch of
    /// unprocessed upstream lines. Returns whether unprocessed lines remain.
    fn process(&self, modifications: Vec<Modification>) -> bool {
        let mut state = self.state.lock().expect("filter state lock poisoned");
        for modification in modifications {
            match modification {
                Modification::Reset => {
                    debug!(source = %self.id, "upstream reset, discarding view");
                    state.entries.clear();
                    state.cursor = 0;
                    state.full = LogSection::new(0, 0);
                    state.group.clear();
                    state.group_emitted = 0;
                    self.listeners.reset();
                }
                Modification::Appended(section) => {
                    state.full = LogSection::minimum_bounding(state.full, section);
                }
                Modification::Removed(section) => {
                    self.retract(&mut state, section.index);
                }
                Modification::PropertiesChanged => {
                    self.listeners.properties_changed();
                }
            }
        }

        let upstream_count = self.upstream.count();
        let target = state.full.end().min(upstream_count);
        let batch_end = target.min(state.cursor + BATCH_SIZE);
        if state.cursor < batch_end {
            let section = LogSection::new(state.cursor, batch_end - state.cursor);
            // The upstream may shrink between its count and the fetch; a short
            // read leaves the cursor behind and the pending `Removed` catches
            // it up next pass.
            let lines = fetch_section(self.upstream.as_ref(), section);
            state.cursor += lines.len();
            for line in lines {
                self.evaluate(&mut state, line);
            }
        }

        // The trailing group may never be closed by a following entry, so it
        // is evaluated tentatively once the cursor has caught up.
        if state.cursor >= target {
            self.emit_group_tail(&mut state);
        }

        self.listeners.on_read(state.entries.len());
        state.cursor < target
    }

    /// Feeds one upstream line into the trailing group, flushing the group
    /// when the line starts a new logical entry.
    fn evaluate(&self, state: &mut FilterState, line: LogEntry) {
        let starts_new_entry = state
            .group
            .first()
            .is_some_and(|first| first.entry_index != line.entry_index);
        if starts_new_entry {
            self.emit_group_tail(state);
            state.group.clear();
            state.group_emitted = 0;
        }
        state.group.push(line);
    }

    /// Emits the not-yet-emitted lines of the current group when the group
    /// passes the filter as a whole.
    fn emit_group_tail(&self, state: &mut FilterState) {
        if state.group_emitted == state.group.len() {
            return;
        }
        if !self.filter.passes_entry(&state.group) {
            return;
        }
        for offset in state.group_emitted..state.group.len() {
            let mut entry = state.group[offset].clone();
            entry.original_index = entry.index;
            entry.index = state.entries.len();
            state.entries.push(entry);
        }
        state.group_emitted = state.group.len();
    }

    /// Upstream retracted everything from `index` on. The retracted lines are
    /// a suffix of both the view and the trailing group, since upstream
    /// indices only ever grow.
    fn retract(&self, state: &mut FilterState, index: usize) {
        state.full = LogSection::new(0, state.full.end().min(index));
        state.cursor = state.cursor.min(index);
        state.group.retain(|line| line.index < index);
        state.group_emitted = state.group_emitted.min(state.group.len());
        let keep = state
            .entries
            .iter()
            .take_while(|entry| entry.original_index < index)
            .count();
        state.entries.truncate(keep);
        self.listeners.invalidate(keep);
    }
}

impl LogSource for FilteredLogSource {
    fn id(&self) -> SourceId {
        self.inner.id
    }

    fn add_listener(
        &self,
        listener: Arc<dyn SourceListener>,
        max_wait: Duration,
        max_count: usize,
    ) {
        self.inner.listeners.add_listener(listener, max_wait, max_count);
    }

    fn remove_listener(&self, listener: &Arc<dyn SourceListener>) {
        self.inner.listeners.remove_listener(listener);
    }

    fn count(&self) -> usize {
        self.inner.state.lock().expect("filter state lock poisoned").entries.len()
    }

    fn get_entry(&self, index: usize) -> LogEntry {
        let state = self.inner.state.lock().expect("filter state lock poisoned");
        assert_index_in_range(index, state.entries.len());
        state.entries[index].clone()
    }

    fn get_entries(&self, section: LogSection) -> Vec<LogEntry> {
        let state = self.inner.state.lock().expect("filter state lock poisoned");
        assert_section_in_range(section, state.entries.len());
        state.entries[section.index..section.end()].to_vec()
    }

    /// Own progress scaled by the upstream's: both have to be done for the
    /// view to be complete.
    fn progress(&self) -> f64 {
        let own = {
            let state = self.inner.state.lock().expect("filter state lock poisoned");
            if state.full.is_empty() {
                1.0
            } else {
                state.cursor as f64 / state.full.count as f64
            }
        };
        own * self.inner.upstream.progress()
    }

    fn size(&self) -> Option<u64> {
        self.inner.upstream.size()
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        self.inner.upstream.created()
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        self.inner.upstream.modified()
    }

    fn error(&self) -> SourceError {
        self.inner.upstream.error()
    }

    fn wait_until_caught_up(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        if !self.inner.upstream.wait_until_caught_up(timeout) {
            return false;
        }
        self.inner.caught_up.wait(remaining_budget(timeout, started))
    }
}
