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

struct ForwardListener {
    sender: Mutex<Sender<Modification>>,
    caught_up: Arc<CaughtUpFlag>,
}

impl SourceListener for ForwardListener {
    fn on_modified(&self, _source: SourceId, modification: Modification) {
        self.caught_up.clear();
        let _ = self
            .sender
            .lock()
            .expect("forward sender lock poisoned")
            .send(modification);
    }
}

struct GroupState {
    /// One entry per upstream line, with the logical-entry columns rewritten.
    entries: Vec<LogEntry>,
    /// Next upstream index to group.
    cursor: usize,
    /// Minimum bounding section of everything announced upstream.
    full: LogSection,
    first_timestamp: Option<DateTime<Utc>>,
}

struct Inner {
    id: SourceId,
    upstream: Arc<dyn LogSource>,
    pending: Mutex<Receiver<Modification>>,
    state: Mutex<GroupState>,
    listeners: ListenerCollection,
    caught_up: Arc<CaughtUpFlag>,
}

/// Groups a source's lines into logical multi-line entries.
///
/// A line with a detected timestamp starts a new entry; following lines
/// without one (stack frames, wrapped payloads) belong to it and inherit its
/// timestamp and level. Line indices are untouched, only the entry columns
/// change, so the view stays one-to-one with its upstream. Stacked on a
/// [`FileLogSource`] this is what lets a filter see a tailed exception plus
/// its stack trace as one entry.
///
/// [`FileLogSource`]: crate::tail::FileLogSource
pub struct MultiLineLogSource {
    inner: Arc<Inner>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskHandle,
    forward: Arc<dyn SourceListener>,
}

impl MultiLineLogSource {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, upstream: Arc<dyn LogSource>) -> Arc<Self> {
        let id = SourceId::next();
        let caught_up = Arc::new(CaughtUpFlag::new());
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(Inner {
            id,
            upstream: Arc::clone(&upstream),
            pending: Mutex::new(receiver),
            state: Mutex::new(GroupState {
                entries: Vec::new(),
                cursor: 0,
                full: LogSection::new(0, 0),
                first_timestamp: None,
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
            &format!("multiline {}", id),
        );
        Arc::new(Self {
            inner,
            scheduler,
            task,
            forward,
        })
    }
}

impl Drop for MultiLineLogSource {
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

    fn process(&self, modifications: Vec<Modification>) -> bool {
        let mut state = self.state.lock().expect("group state lock poisoned");
        for modification in modifications {
            match modification {
                Modification::Reset => {
                    debug!(source = %self.id, "upstream reset, discarding groups");
                    state.entries.clear();
                    state.cursor = 0;
                    state.full = LogSection::new(0, 0);
                    state.first_timestamp = None;
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

        let target = state.full.end().min(self.upstream.count());
        let batch_end = target.min(state.cursor + BATCH_SIZE);
        if state.cursor < batch_end {
            let section = LogSection::new(state.cursor, batch_end - state.cursor);
            let lines = fetch_section(self.upstream.as_ref(), section);
            state.cursor += lines.len();
            for line in lines {
                Self::group(&mut state, line);
            }
        }

        self.listeners.on_read(state.entries.len());
        state.cursor < target
    }

    /// Appends one upstream line, attaching it to the trailing logical entry
    /// when it carries no timestamp of its own.
    fn group(state: &mut GroupState, line: LogEntry) {
        let head = if line.timestamp.is_some() || state.entries.is_empty() {
            None
        } else {
            let head_index = state.entries[state.entries.len() - 1].entry_index;
            Some(state.entries[head_index].clone())
        };

        let previous_timestamp = state.entries.last().and_then(|e| e.timestamp);
        let mut entry = line;
        entry.original_index = entry.index;
        if let Some(head) = head {
            entry.entry_index = head.entry_index;
            entry.timestamp = head.timestamp;
            entry.level = head.level;
        } else {
            entry.entry_index = entry.index;
        }
        if state.first_timestamp.is_none() {
            state.first_timestamp = entry.timestamp;
        }
        entry.elapsed = match (state.first_timestamp, entry.timestamp) {
            (Some(first), Some(now)) => Some(now - first),
            _ => None,
        };
        entry.delta = match (previous_timestamp, entry.timestamp) {
            (Some(previous), Some(now)) => Some(now - previous),
            _ => None,
        };
        state.entries.push(entry);
    }

    /// Upstream retracted everything from `index` on. Grouping never reaches
    /// forward, so the retained prefix keeps its entries untouched.
    fn retract(&self, state: &mut GroupState, index: usize) {
        state.full = LogSection::new(0, state.full.end().min(index));
        state.cursor = state.cursor.min(index);
        let keep = index.min(state.entries.len());
        state.entries.truncate(keep);
        if state.entries.is_empty() {
            state.first_timestamp = None;
        }
        self.listeners.invalidate(keep);
    }
}

impl LogSource for MultiLineLogSource {
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
        self.inner.state.lock().expect("group state lock poisoned").entries.len()
    }

    fn get_entry(&self, index: usize) -> LogEntry {
        let state = self.inner.state.lock().expect("group state lock poisoned");
        assert_index_in_range(index, state.entries.len());
        state.entries[index].clone()
    }

    fn get_entries(&self, section: LogSection) -> Vec<LogEntry> {
        let state = self.inner.state.lock().expect("group state lock poisoned");
        assert_section_in_range(section, state.entries.len());
        state.entries[section.index..section.end()].to_vec()
    }

    fn progress(&self) -> f64 {
        let own = {
            let state = self.inner.state.lock().expect("group state lock poisoned");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LevelFlags;
    use crate::filter::SubstringFilter;
    use crate::filtered::FilteredLogSource;
    use crate::in_memory::InMemoryLogSource;
    use crate::scheduler::ManualTaskScheduler;
    use crate::tail::FileLogSource;
    use chrono::TimeZone;
    use std::io::Write;

    fn fixture() -> (Arc<ManualTaskScheduler>, Arc<InMemoryLogSource>, Arc<MultiLineLogSource>) {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let upstream = InMemoryLogSource::new();
        let grouped = MultiLineLogSource::new(scheduler.clone(), upstream.clone());
        (scheduler, upstream, grouped)
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 2, 14, 5, second).unwrap()
    }

    #[test]
    fn test_undated_lines_join_the_preceding_entry() {
        let (scheduler, upstream, grouped) = fixture();
        upstream.add_entry_with("ERROR boom", Some(at(6)), LevelFlags::ERROR);
        upstream.add_entry_with("  at foo()", None, LevelFlags::OTHER);
        upstream.add_entry_with("  at bar()", None, LevelFlags::OTHER);
        scheduler.run(2);

        assert_eq!(grouped.count(), 3);
        for index in 0..3 {
            let entry = grouped.get_entry(index);
            assert_eq!(entry.entry_index, 0);
            assert_eq!(entry.timestamp, Some(at(6)));
            assert_eq!(entry.level, LevelFlags::ERROR);
        }
        assert_eq!(grouped.get_entry(1).delta, Some(chrono::Duration::zero()));
    }

    #[test]
    fn test_timestamped_line_starts_a_new_entry() {
        let (scheduler, upstream, grouped) = fixture();
        upstream.add_entry("first", Some(at(1)));
        upstream.add_entry("  detail", None);
        upstream.add_entry("second", Some(at(2)));
        scheduler.run(2);

        assert_eq!(grouped.get_entry(1).entry_index, 0);
        let second = grouped.get_entry(2);
        assert_eq!(second.entry_index, 2);
        assert_eq!(second.timestamp, Some(at(2)));
        assert_eq!(second.elapsed, Some(chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_leading_undated_lines_form_their_own_entry() {
        let (scheduler, upstream, grouped) = fixture();
        upstream.add_entry("banner", None);
        upstream.add_entry("more banner", None);
        upstream.add_entry("dated", Some(at(3)));
        scheduler.run(2);

        assert_eq!(grouped.get_entry(0).entry_index, 0);
        assert_eq!(grouped.get_entry(1).entry_index, 0);
        assert!(grouped.get_entry(1).timestamp.is_none());
        assert_eq!(grouped.get_entry(2).entry_index, 2);
    }

    #[test]
    fn test_retraction_truncates_and_regroups() {
        let (scheduler, upstream, grouped) = fixture();
        upstream.add_entry("head", Some(at(0)));
        upstream.add_entry("  old tail", None);
        scheduler.run(2);
        assert_eq!(grouped.count(), 2);

        upstream.remove_from(1);
        upstream.add_entry("  new tail", None);
        scheduler.run(2);

        assert_eq!(grouped.count(), 2);
        let tail = grouped.get_entry(1);
        assert_eq!(tail.raw, "  new tail");
        assert_eq!(tail.entry_index, 0);
        assert_eq!(tail.timestamp, Some(at(0)));
    }

    #[test]
    fn test_upstream_reset_clears_groups() {
        let (scheduler, upstream, grouped) = fixture();
        upstream.add_entry("a", Some(at(0)));
        scheduler.run(2);
        assert_eq!(grouped.count(), 1);

        upstream.clear();
        scheduler.run(2);
        assert_eq!(grouped.count(), 0);
    }

    #[test]
    fn test_whole_entry_filtering_over_a_tailed_file() {
        let scheduler = Arc::new(ManualTaskScheduler::new());
        let file = tempfile::NamedTempFile::new().unwrap();
        file.reopen()
            .unwrap()
            .write_all(
                b"2021-03-02 14:05:06 ERROR boom\n  at frame()\n2021-03-02 14:05:07 INFO fine\n",
            )
            .unwrap();

        let tail = FileLogSource::new(scheduler.clone(), file.path());
        let grouped = MultiLineLogSource::new(scheduler.clone(), tail.clone());
        let filtered = FilteredLogSource::new(
            scheduler.clone(),
            grouped.clone(),
            Arc::new(SubstringFilter::new("frame", true)),
        );
        scheduler.run(6);

        // The stack frame pulls its whole entry into the view, tailed straight
        // from disk.
        assert_eq!(grouped.get_entry(1).entry_index, 0);
        assert_eq!(filtered.count(), 2);
        assert!(filtered.get_entry(0).raw.contains("boom"));
        assert_eq!(filtered.get_entry(1).raw, "  at frame()");
    }

    #[test]
    fn test_drop_detaches_from_upstream() {
        let (scheduler, upstream, grouped) = fixture();
        assert_eq!(upstream.listener_count(), 1);
        drop(grouped);
        scheduler.run_once();
        assert_eq!(upstream.listener_count(), 0);
        assert_eq!(scheduler.periodic_task_count(), 0);
    }
}
