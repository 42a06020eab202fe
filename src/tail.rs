use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use memchr::memchr_iter;
use tracing::{debug, info};

use crate::entry::{LevelFlags, LogEntry};
use crate::listener::{ListenerCollection, SourceListener};
use crate::parser::{DefaultEntryParser, EntryParser, NoThrowParser};
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::section::LogSection;
use crate::source::{
    assert_index_in_range, assert_section_in_range, LogSource, SourceError, SourceId,
};
use crate::sync::CaughtUpFlag;

/// How often the file is polled when the previous pass found nothing new.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Progress reported while a pass is still ingesting data. Full progress is
/// only claimed once a pass finds nothing left to read, so a consumer polling
/// [`LogSource::progress`] cannot observe `1.0` while lines from the current
/// pass are still propagating downstream.
const BUSY_PROGRESS_CAP: f64 = 0.99;

struct TailState {
    entries: Vec<LogEntry>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
    /// Byte position of the next read.
    offset: u64,
    /// Bytes of the unterminated last line. When non-empty, the last entry in
    /// `entries` is its tentative decode and will be retracted as soon as more
    /// of the line arrives.
    partial: Vec<u8>,
    progress: f64,
    error: SourceError,
    size: Option<u64>,
    created: Option<DateTime<Utc>>,
    modified: Option<DateTime<Utc>>,
}

/// Listener-facing effects of one pass, emitted after the state lock is
/// released and strictly in order.
enum Note {
    Reset,
    Invalidate(usize),
    Read(usize),
    PropertiesChanged,
}

struct Inner {
    id: SourceId,
    path: PathBuf,
    parser: NoThrowParser,
    state: Mutex<TailState>,
    listeners: ListenerCollection,
    caught_up: CaughtUpFlag,
}

/// Tails a text file on disk.
///
/// A periodic task polls the file, ingests newly appended bytes and announces
/// the resulting lines. Truncation (the file shrinking) resets the source;
/// a missing file clears it and raises [`SourceError::SourceDoesNotExist`]
/// until the file reappears. Content is decoded as UTF-8, with invalid
/// sequences replaced.
///
/// An unterminated last line is exposed tentatively: once more of the line
/// arrives it is retracted (`Removed`) and re-announced with the longer text,
/// so downstream stages never see two versions of the same line at once.
pub struct FileLogSource {
    inner: Arc<Inner>,
    scheduler: Arc<dyn TaskScheduler>,
    task: TaskHandle,
}

impl FileLogSource {
    pub fn new(scheduler: Arc<dyn TaskScheduler>, path: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_parser(scheduler, path, Arc::new(DefaultEntryParser::new()))
    }

    pub fn with_parser(
        scheduler: Arc<dyn TaskScheduler>,
        path: impl Into<PathBuf>,
        parser: Arc<dyn EntryParser>,
    ) -> Arc<Self> {
        let path = path.into();
        let id = SourceId::next();
        info!(%id, path = %path.display(), "tailing file");
        let inner = Arc::new(Inner {
            id,
            path: path.clone(),
            parser: NoThrowParser::new(parser),
            state: Mutex::new(TailState {
                entries: Vec::new(),
                first_timestamp: None,
                last_timestamp: None,
                offset: 0,
                partial: Vec::new(),
                progress: 0.0,
                error: SourceError::None,
                size: None,
                created: None,
                modified: None,
            }),
            listeners: ListenerCollection::new(id),
            caught_up: CaughtUpFlag::new(),
        });
        let task_inner = Arc::clone(&inner);
        let task = scheduler.start_periodic(
            Box::new(move || task_inner.run_once()),
            POLL_INTERVAL,
            &format!("tail {}", path.display()),
        );
        Arc::new(Self {
            inner,
            scheduler,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Drop for FileLogSource {
    fn drop(&mut self) {
        self.scheduler.stop_periodic(&self.task);
    }
}

impl Inner {
    /// One poll of the file. Returns `Some(Duration::ZERO)` when data was
    /// ingested so the scheduler runs the task again immediately.
    fn run_once(&self) -> Option<Duration> {
        let (notes, busy) = self.poll();
        for note in notes {
            match note {
                Note::Reset => self.listeners.reset(),
                Note::Invalidate(index) => self.listeners.invalidate(index),
                Note::Read(count) => self.listeners.on_read(count),
                Note::PropertiesChanged => self.listeners.properties_changed(),
            }
        }
        if busy {
            self.caught_up.clear();
            Some(Duration::ZERO)
        } else {
            self.listeners.flush();
            self.caught_up.set();
            None
        }
    }

    fn poll(&self) -> (Vec<Note>, bool) {
        let mut notes = Vec::new();
        let mut state = self.state.lock().expect("tail state lock poisoned");

        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Self::enter_error(&mut state, SourceError::SourceDoesNotExist, &mut notes);
                return (notes, false);
            }
            Err(_) => {
                Self::enter_error(&mut state, SourceError::SourceCannotBeAccessed, &mut notes);
                return (notes, false);
            }
        };

        if state.error.is_error() {
            debug!(path = %self.path.display(), "file became readable again");
            state.error = SourceError::None;
            notes.push(Note::PropertiesChanged);
        }

        let len = metadata.len();
        let created = metadata.created().ok().map(DateTime::<Utc>::from);
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        if state.size != Some(len) || state.modified != modified {
            state.size = Some(len);
            state.created = created;
            state.modified = modified;
            notes.push(Note::PropertiesChanged);
        }

        if len < state.offset {
            debug!(path = %self.path.display(), "file was truncated, starting over");
            Self::clear_content(&mut state);
            notes.push(Note::Reset);
        }

        let had_partial = !state.partial.is_empty();
        let data = match self.read_new_bytes(&mut state) {
            Ok(data) => data,
            Err(_) => {
                Self::enter_error(&mut state, SourceError::SourceCannotBeAccessed, &mut notes);
                return (notes, false);
            }
        };

        if data.is_empty() {
            state.progress = 1.0;
            return (notes, false);
        }

        self.ingest(&mut state, data, had_partial, &mut notes);
        state.progress = if len == 0 {
            BUSY_PROGRESS_CAP
        } else {
            (state.offset as f64 / len as f64).min(BUSY_PROGRESS_CAP)
        };
        notes.push(Note::Read(state.entries.len()));
        (notes, true)
    }

    /// Reads everything past the current offset. The unterminated tail kept
    /// from the previous pass is prepended so line scanning always sees whole
    /// lines.
    fn read_new_bytes(&self, state: &mut TailState) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.seek(SeekFrom::Start(state.offset))
            .with_context(|| format!("failed to seek {}", self.path.display()))?;
        let mut fresh = Vec::new();
        file.read_to_end(&mut fresh)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if fresh.is_empty() {
            return Ok(fresh);
        }
        state.offset += fresh.len() as u64;

        let mut data = std::mem::take(&mut state.partial);
        data.extend_from_slice(&fresh);
        Ok(data)
    }

    fn ingest(&self, state: &mut TailState, data: Vec<u8>, had_partial: bool, notes: &mut Vec<Note>) {
        // The previous pass exposed the unterminated tail as a tentative
        // entry; retract it before announcing the longer replacement.
        if had_partial {
            let index = state.entries.len() - 1;
            state.entries.pop();
            state.last_timestamp = state.entries.iter().rev().find_map(|e| e.timestamp);
            if state.entries.is_empty() {
                state.first_timestamp = None;
            }
            notes.push(Note::Invalidate(index));
        }

        let mut start = 0;
        for end in memchr_iter(b'\n', &data) {
            let line = strip_carriage_return(&data[start..end]);
            let raw = String::from_utf8_lossy(line).into_owned();
            Self::push_line(state, raw, &self.parser, false);
            start = end + 1;
        }

        if start < data.len() {
            state.partial = data[start..].to_vec();
            let raw = String::from_utf8_lossy(&state.partial).into_owned();
            Self::push_line(state, raw, &self.parser, true);
        } else {
            state.partial.clear();
        }
    }

    fn push_line(state: &mut TailState, raw: String, parser: &NoThrowParser, tentative: bool) {
        let parsed = parser.parse(&raw);
        let index = state.entries.len();
        let timestamp = parsed.timestamp;
        let elapsed = match (state.first_timestamp, timestamp) {
            (Some(first), Some(now)) => Some(now - first),
            (None, Some(_)) => Some(chrono::Duration::zero()),
            _ => None,
        };
        let delta = match (state.last_timestamp, timestamp) {
            (Some(previous), Some(now)) => Some(now - previous),
            _ => None,
        };
        // A tentative line may still grow; its timestamp columns are
        // recomputed when the final version is pushed.
        if timestamp.is_some() && !tentative {
            if state.first_timestamp.is_none() {
                state.first_timestamp = timestamp;
            }
            state.last_timestamp = timestamp;
        }
        state.entries.push(LogEntry {
            index,
            original_index: index,
            entry_index: index,
            line_number: index + 1,
            raw,
            timestamp,
            level: parsed.level.unwrap_or(LevelFlags::OTHER),
            elapsed,
            delta,
        });
    }

    fn enter_error(state: &mut TailState, error: SourceError, notes: &mut Vec<Note>) {
        if state.error != error {
            state.error = error;
            notes.push(Note::PropertiesChanged);
        }
        if error == SourceError::SourceDoesNotExist {
            if !state.entries.is_empty() || state.offset > 0 {
                Self::clear_content(state);
                notes.push(Note::Reset);
            }
            state.size = None;
            state.created = None;
            state.modified = None;
            // A missing file has nothing left to process.
            state.progress = 1.0;
        }
        // An access error keeps the previous progress: the stream may hold
        // data this source cannot currently get at.
    }

    fn clear_content(state: &mut TailState) {
        state.entries.clear();
        state.first_timestamp = None;
        state.last_timestamp = None;
        state.offset = 0;
        state.partial.clear();
    }
}

fn strip_carriage_return(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

impl LogSource for FileLogSource {
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
        self.inner.state.lock().expect("tail state lock poisoned").entries.len()
    }

    fn get_entry(&self, index: usize) -> LogEntry {
        let state = self.inner.state.lock().expect("tail state lock poisoned");
        assert_index_in_range(index, state.entries.len());
        state.entries[index].clone()
    }

    fn get_entries(&self, section: LogSection) -> Vec<LogEntry> {
        let state = self.inner.state.lock().expect("tail state lock poisoned");
        assert_section_in_range(section, state.entries.len());
        state.entries[section.index..section.end()].to_vec()
    }

    fn progress(&self) -> f64 {
        self.inner.state.lock().expect("tail state lock poisoned").progress
    }

    fn size(&self) -> Option<u64> {
        self.inner.state.lock().expect("tail state lock poisoned").size
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().expect("tail state lock poisoned").created
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().expect("tail state lock poisoned").modified
    }

    fn error(&self) -> SourceError {
        self.inner.state.lock().expect("tail state lock poisoned").error
    }

    fn wait_until_caught_up(&self, timeout: Option<Duration>) -> bool {
        self.inner.caught_up.wait(timeout)
    }
}
