use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::entry::LogEntry;
use crate::listener::{ListenerCollection, SourceListener};
use crate::modification::Modification;
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::section::LogSection;
use crate::source::{
    assert_index_in_range, assert_section_in_range, fetch_section, LogSource, SourceError,
    SourceId,
};
use crate::sync::{remaining_budget, CaughtUpFlag};

const BATCH_SIZE: usize = 1000;
const SOURCE_MAX_WAIT: Duration = Duration::from_millis(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Tags each forwarded modification with the position of the source it came
/// from, so the merge loop knows which cursor to touch.
struct ForwardListener {
    source_pos: usize,
    sender: Mutex<Sender<(usize, Modification)>>,
    caught_up: Arc<CaughtUpFlag>,
}

impl SourceListener for ForwardListener {
    fn on_modified(&self, _source: SourceId, modification: Modification) {
        self.caught_up.clear();
        let _ = self
            .sender
            .lock()
            .expect("forward sender lock poisoned")
            .send((self.source_pos, modification));
    }
}

/// Where one merged row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MergedRef {
    source_pos: usize,
    local_index: usize,
    timestamp: DateTime<Utc>,
}

impl MergedRef {
    /// Total order: timestamp first, registration order breaks ties, local
    /// index keeps a single source's equal-timestamp lines stable.
    fn key(&self) -> (DateTime<Utc>, usize, usize) {
        (self.timestamp, self.source_pos, self.local_index)
    }
}

struct MergeState {
    refs: Vec<MergedRef>,
    entries: Vec<LogEntry>,
    /// Per source: how many upstream lines have been considered for merging.
    seen: Vec<usize>,
    /// Per source: upstream count as announced so far.
    known: Vec<usize>,
    /// Lowest merged position whose suffix changed this pass.
    min_invalid: Option<usize>,
    /// Merged length as last announced, so the pass knows what to retract.
    announced: usize,
}

struct Inner {
    id: SourceId,
    sources: Vec<Arc<dyn LogSource>>,
    pending: Mutex<Receiver<(usize, Modification)>>,
    state: Mutex<MergeState>,
    listeners: ListenerCollection,
    caught_up: Arc<CaughtUpFlag>,
}

/// Merges several sources into one view ordered by timestamp.
///
/// Only timestamped entries participate; lines whose timestamp could not be
/// detected have no defined place in the merged order and are skipped. Equal
/// timestamps are broken by source registration order. A late entry (one
/// older than the current merged tail) is inserted at its proper place and
/// the shifted suffix re-announced as `Removed` plus `Appended`.
pub struct MergedLogSource {
    inner: Arc<Inner>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskHandle,
    forwards: Vec<Arc<dyn SourceListener>>,
}

impl MergedLogSource {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, sources: Vec<Arc<dyn LogSource>>) -> Arc<Self> {
        let id = SourceId::next();
        let caught_up = Arc::new(CaughtUpFlag::new());
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(Inner {
            id,
            sources: sources.clone(),
            pending: Mutex::new(receiver),
            state: Mutex::new(MergeState {
                refs: Vec::new(),
                entries: Vec::new(),
                seen: vec![0; sources.len()],
                known: vec![0; sources.len()],
                min_invalid: None,
                announced: 0,
            }),
            listeners: ListenerCollection::new(id),
            caught_up: Arc::clone(&caught_up),
        });

        let mut forwards: Vec<Arc<dyn SourceListener>> = Vec::with_capacity(sources.len());
        for (source_pos, source) in sources.iter().enumerate() {
            let forward: Arc<dyn SourceListener> = Arc::new(ForwardListener {
                source_pos,
                sender: Mutex::new(sender.clone()),
                caught_up: Arc::clone(&caught_up),
            });
            source.add_listener(Arc::clone(&forward), SOURCE_MAX_WAIT, BATCH_SIZE);
            forwards.push(forward);
        }

        let task_inner = Arc::clone(&inner);
        let task = scheduler.start_periodic(
            Box::new(move || task_inner.run_once()),
            POLL_INTERVAL,
            &format!("merge {}", id),
        );
        Arc::new(Self {
            inner,
            scheduler,
            task,
            forwards,
        })
    }

    /// The source and local index a merged row came from.
    ///
    /// # Panics
    /// When `merged_index` is out of range.
    pub fn origin_of(&self, merged_index: usize) -> (SourceId, usize) {
        let state = self.inner.state.lock().expect("merge state lock poisoned");
        assert_index_in_range(merged_index, state.refs.len());
        let reference = state.refs[merged_index];
        (
            self.inner.sources[reference.source_pos].id(),
            reference.local_index,
        )
    }
}

impl Drop for MergedLogSource {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(&self.task);
        for (source, forward) in self.inner.sources.iter().zip(&self.forwards) {
            source.remove_listener(forward);
        }
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

    fn drain_pending(&self) -> Vec<(usize, Modification)> {
        let receiver = self.pending.lock().expect("pending queue lock poisoned");
        let mut modifications = Vec::new();
        while let Ok(modification) = receiver.try_recv() {
            modifications.push(modification);
        }
        modifications
    }

    fn process(&self, modifications: Vec<(usize, Modification)>) -> bool {
        let mut state = self.state.lock().expect("merge state lock poisoned");
        for (source_pos, modification) in modifications {
            match modification {
                Modification::Reset => {
                    debug!(source = %self.id, upstream = source_pos, "upstream reset");
                    self.remove_contribution(&mut state, source_pos, 0);
                }
                Modification::Removed(section) => {
                    self.remove_contribution(&mut state, source_pos, section.index);
                }
                Modification::Appended(section) => {
                    state.known[source_pos] = state.known[source_pos].max(section.end());
                }
                Modification::PropertiesChanged => {
                    self.listeners.properties_changed();
                }
            }
        }

        let mut merged_this_pass = 0;
        let mut remaining = false;
        for source_pos in 0..self.sources.len() {
            let source = &self.sources[source_pos];
            let target = state.known[source_pos].min(source.count());
            let start = state.seen[source_pos];
            if start >= target {
                continue;
            }
            let end = target.min(start + BATCH_SIZE.saturating_sub(merged_this_pass));
            if end > start {
                // The source may shrink between its count and the fetch; the
                // short read is made up for once its `Removed` arrives.
                let lines = fetch_section(source.as_ref(), LogSection::new(start, end - start));
                merged_this_pass += lines.len();
                state.seen[source_pos] = start + lines.len();
                for line in lines {
                    self.merge_line(&mut state, source_pos, line);
                }
            }
            if state.seen[source_pos] < target {
                remaining = true;
            }
        }

        self.announce(&mut state);
        remaining
    }

    /// Merges one upstream line. Lines without a timestamp are skipped, since
    /// the merged order has no place for them.
    fn merge_line(&self, state: &mut MergeState, source_pos: usize, line: LogEntry) {
        let Some(timestamp) = line.timestamp else {
            return;
        };
        let reference = MergedRef {
            source_pos,
            local_index: line.index,
            timestamp,
        };
        let key = reference.key();
        let pos = state.refs.partition_point(|r| r.key() <= key);
        if pos < state.refs.len() {
            state.min_invalid = Some(state.min_invalid.map_or(pos, |m| m.min(pos)));
        }
        state.refs.insert(pos, reference);
        let mut entry = line;
        entry.original_index = entry.index;
        state.entries.insert(pos, entry);
        Self::reindex_from(state, pos);
    }

    /// Removes source `source_pos`'s rows with local index `>= from` and
    /// rewinds the source's cursor.
    fn remove_contribution(&self, state: &mut MergeState, source_pos: usize, from: usize) {
        state.known[source_pos] = state.known[source_pos].min(from);
        state.seen[source_pos] = state.seen[source_pos].min(from);
        let first_affected = state
            .refs
            .iter()
            .position(|r| r.source_pos == source_pos && r.local_index >= from);
        let Some(first_affected) = first_affected else {
            return;
        };
        let mut index = first_affected;
        while index < state.refs.len() {
            let r = state.refs[index];
            if r.source_pos == source_pos && r.local_index >= from {
                state.refs.remove(index);
                state.entries.remove(index);
            } else {
                index += 1;
            }
        }
        state.min_invalid = Some(
            state
                .min_invalid
                .map_or(first_affected, |m| m.min(first_affected)),
        );
        Self::reindex_from(state, first_affected);
    }

    /// Recomputes positional columns from `pos` on: merged index, line number
    /// and the elapsed/delta columns relative to merged neighbors.
    fn reindex_from(state: &mut MergeState, pos: usize) {
        let first_timestamp = state.entries.first().and_then(|e| e.timestamp);
        for index in pos..state.entries.len() {
            let previous_timestamp = if index == 0 {
                None
            } else {
                state.entries[index - 1].timestamp
            };
            let entry = &mut state.entries[index];
            entry.index = index;
            entry.entry_index = index;
            entry.line_number = index + 1;
            entry.elapsed = match (first_timestamp, entry.timestamp) {
                (Some(first), Some(now)) => Some(now - first),
                _ => None,
            };
            entry.delta = match (previous_timestamp, entry.timestamp) {
                (Some(previous), Some(now)) => Some(now - previous),
                _ => None,
            };
        }
    }

    /// Emits the pass's retraction (if any suffix shifted) followed by the
    /// appends that bring listeners up to the new length.
    fn announce(&self, state: &mut MergeState) {
        if let Some(min_invalid) = state.min_invalid.take() {
            if min_invalid < state.announced {
                self.listeners.invalidate(min_invalid);
            }
        }
        let count = state.entries.len();
        self.listeners.on_read(count);
        state.announced = count;
    }
}

impl LogSource for MergedLogSource {
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
        self.inner.state.lock().expect("merge state lock poisoned").entries.len()
    }

    fn get_entry(&self, index: usize) -> LogEntry {
        let state = self.inner.state.lock().expect("merge state lock poisoned");
        assert_index_in_range(index, state.entries.len());
        state.entries[index].clone()
    }

    fn get_entries(&self, section: LogSection) -> Vec<LogEntry> {
        let state = self.inner.state.lock().expect("merge state lock poisoned");
        assert_section_in_range(section, state.entries.len());
        state.entries[section.index..section.end()].to_vec()
    }

    /// The slowest constituent bounds the merged progress.
    fn progress(&self) -> f64 {
        self.inner
            .sources
            .iter()
            .map(|s| s.progress())
            .fold(1.0, f64::min)
    }

    /// Combined size of all constituents with a known size.
    fn size(&self) -> Option<u64> {
        let sizes: Vec<u64> = self.inner.sources.iter().filter_map(|s| s.size()).collect();
        if sizes.is_empty() {
            None
        } else {
            Some(sizes.iter().sum())
        }
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        self.inner.sources.iter().filter_map(|s| s.created()).min()
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        self.inner.sources.iter().filter_map(|s| s.modified()).max()
    }

    /// A merged view exists as long as any constituent does; individual
    /// source errors stay visible on the constituents themselves.
    fn error(&self) -> SourceError {
        SourceError::None
    }

    fn wait_until_caught_up(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        for source in &self.inner.sources {
            if !source.wait_until_caught_up(remaining_budget(timeout, started)) {
                return false;
            }
        }
        self.inner.caught_up.wait(remaining_budget(timeout, started))
    }
}
