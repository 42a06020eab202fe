use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::entry::{MatchSpan, SearchMatch};
use crate::filter::{LogEntryFilter, SubstringFilter};
use crate::listener::SourceListener;
use crate::modification::Modification;
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::section::LogSection;
use crate::source::{fetch_section, LogSource, SourceId};
use crate::sync::{remaining_budget, CaughtUpFlag};

const BATCH_SIZE: usize = 1000;
const SOURCE_MAX_WAIT: Duration = Duration::from_millis(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Observes a search's result set as it grows or is rebuilt.
pub trait SearchListener: Send + Sync {
    fn on_search_modified(&self, count: usize);
}

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

struct SearchState {
    /// All matches found so far, ordered by line then span offset.
    matches: Vec<SearchMatch>,
    /// The same matches keyed by line, for per-line highlighting.
    by_line: HashMap<usize, Vec<MatchSpan>>,
    /// Next upstream line to scan.
    cursor: usize,
    /// Upstream count as announced so far.
    known: usize,
}

struct Inner {
    upstream: Arc<dyn LogSource>,
    filter: SubstringFilter,
    pending: Mutex<Receiver<Modification>>,
    state: Mutex<SearchState>,
    listeners: Mutex<Vec<Arc<dyn SearchListener>>>,
    caught_up: Arc<CaughtUpFlag>,
}

/// An incremental case-insensitive substring search over a source.
///
/// A periodic task scans newly appended lines for the needle and accumulates
/// every occurrence as a [`SearchMatch`]. The result set follows the source:
/// retracted lines lose their matches, a reset starts the search over.
/// Consumers read immutable snapshots; listeners are told the new match count
/// whenever the set changes.
pub struct LogSourceSearch {
    inner: Arc<Inner>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskHandle,
    forward: Arc<dyn SourceListener>,
}

impl LogSourceSearch {
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        upstream: Arc<dyn LogSource>,
        needle: &str,
    ) -> Arc<Self> {
        let caught_up = Arc::new(CaughtUpFlag::new());
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(Inner {
            upstream: Arc::clone(&upstream),
            filter: SubstringFilter::new(needle, true),
            pending: Mutex::new(receiver),
            state: Mutex::new(SearchState {
                matches: Vec::new(),
                by_line: HashMap::new(),
                cursor: 0,
                known: 0,
            }),
            listeners: Mutex::new(Vec::new()),
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
            &format!("search {}", upstream.id()),
        );
        Arc::new(Self {
            inner,
            scheduler,
            task,
            forward,
        })
    }

    /// Number of matches found so far.
    pub fn count(&self) -> usize {
        self.inner.state.lock().expect("search state lock poisoned").matches.len()
    }

    /// Snapshot of all matches, ordered by line then offset.
    pub fn matches(&self) -> Vec<SearchMatch> {
        self.inner.state.lock().expect("search state lock poisoned").matches.clone()
    }

    /// Snapshot of the spans found in one line.
    pub fn matches_for_line(&self, line_index: usize) -> Vec<MatchSpan> {
        self.inner
            .state
            .lock()
            .expect("search state lock poisoned")
            .by_line
            .get(&line_index)
            .cloned()
            .unwrap_or_default()
    }

    /// Registers `listener`; it is immediately told the current match count.
    pub fn add_listener(&self, listener: Arc<dyn SearchListener>) {
        let count = self.count();
        listener.on_search_modified(count);
        self.inner
            .listeners
            .lock()
            .expect("search listeners lock poisoned")
            .push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SearchListener>) {
        self.inner
            .listeners
            .lock()
            .expect("search listeners lock poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Blocks until the search has scanned everything the source currently
    /// holds; the budget covers the source catching up first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        if !self.inner.upstream.wait_until_caught_up(timeout) {
            return false;
        }
        self.inner.caught_up.wait(remaining_budget(timeout, started))
    }
}

impl Drop for LogSourceSearch {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(&self.task);
        self.inner.upstream.remove_listener(&self.forward);
    }
}

impl Inner {
    fn run_once(&self) -> Option<Duration> {
        let modifications = self.drain_pending();
        let (busy, changed, count) = self.process(modifications);
        if changed {
            // Listener callbacks run outside the state lock so they may query
            // the search freely.
            let listeners: Vec<Arc<dyn SearchListener>> = self
                .listeners
                .lock()
                .expect("search listeners lock poisoned")
                .clone();
            for listener in listeners {
                listener.on_search_modified(count);
            }
        }
        if busy {
            Some(Duration::ZERO)
        } else {
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

    fn process(&self, modifications: Vec<Modification>) -> (bool, bool, usize) {
        let mut state = self.state.lock().expect("search state lock poisoned");
        let mut changed = false;
        for modification in modifications {
            match modification {
                Modification::Reset => {
                    debug!("source reset, starting search over");
                    changed |= !state.matches.is_empty();
                    state.matches.clear();
                    state.by_line.clear();
                    state.cursor = 0;
                    state.known = 0;
                }
                Modification::Appended(section) => {
                    state.known = state.known.max(section.end());
                }
                Modification::Removed(section) => {
                    let keep = state
                        .matches
                        .iter()
                        .take_while(|m| m.line_index < section.index)
                        .count();
                    changed |= keep < state.matches.len();
                    state.matches.truncate(keep);
                    state.by_line.retain(|line, _| *line < section.index);
                    state.cursor = state.cursor.min(section.index);
                    state.known = state.known.min(section.index);
                }
                Modification::PropertiesChanged => {}
            }
        }

        let target = state.known.min(self.upstream.count());
        let batch_end = target.min(state.cursor + BATCH_SIZE);
        if state.cursor < batch_end {
            let section = LogSection::new(state.cursor, batch_end - state.cursor);
            // Tolerates the source shrinking between its count and the fetch.
            let lines = fetch_section(self.upstream.as_ref(), section);
            state.cursor += lines.len();
            for line in lines {
                let spans = self.filter.find_matches(&line);
                if spans.is_empty() {
                    continue;
                }
                changed = true;
                for span in &spans {
                    state.matches.push(SearchMatch::new(line.index, *span));
                }
                state.by_line.insert(line.index, spans);
            }
        }

        (state.cursor < target, changed, state.matches.len())
    }
}
