use crate::entry::{LevelFlags, LogEntry};
use crate::listener::{ListenerCollection, SourceListener};
use crate::parser::{DefaultEntryParser, EntryParser};
use crate::section::LogSection;
use crate::source::{
    assert_index_in_range, assert_section_in_range, LogSource, SourceError, SourceId,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Buffer {
    entries: Vec<LogEntry>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
}

/// A push-driven source with no periodic task of its own.
///
/// Embedders feed it lines directly; every mutation notifies listeners
/// synchronously. Doubles as the standard upstream for filter, merge and
/// search tests, where file IO would only add noise.
pub struct InMemoryLogSource {
    id: SourceId,
    parser: Arc<dyn EntryParser>,
    buffer: Mutex<Buffer>,
    listeners: ListenerCollection,
}

impl InMemoryLogSource {
    pub fn new() -> Arc<Self> {
        Self::with_parser(Arc::new(DefaultEntryParser::new()))
    }

    pub fn with_parser(parser: Arc<dyn EntryParser>) -> Arc<Self> {
        let id = SourceId::next();
        Arc::new(Self {
            id,
            parser,
            buffer: Mutex::new(Buffer {
                entries: Vec::new(),
                first_timestamp: None,
                last_timestamp: None,
            }),
            listeners: ListenerCollection::new(id),
        })
    }

    /// Appends one line; level and timestamp are detected by the parser.
    pub fn add_line(&self, raw: &str) {
        let parsed = self.parser.parse(raw);
        self.push(raw, parsed.timestamp, parsed.level.unwrap_or(LevelFlags::OTHER), None);
    }

    /// Appends one line with an explicit timestamp, bypassing detection.
    pub fn add_entry(&self, raw: &str, timestamp: Option<DateTime<Utc>>) {
        let parsed = self.parser.parse(raw);
        self.push(raw, timestamp, parsed.level.unwrap_or(LevelFlags::OTHER), None);
    }

    /// Appends one fully specified line.
    pub fn add_entry_with(
        &self,
        raw: &str,
        timestamp: Option<DateTime<Utc>>,
        level: LevelFlags,
    ) {
        self.push(raw, timestamp, level, None);
    }

    /// Appends the lines of one logical multi-line entry: every line shares
    /// the entry index (and timestamp) of the first.
    pub fn add_multiline(&self, lines: &[&str]) {
        if lines.is_empty() {
            return;
        }
        let entry_index = self.buffer.lock().expect("buffer lock poisoned").entries.len();
        let first = self.parser.parse(lines[0]);
        for (offset, raw) in lines.iter().enumerate() {
            let parsed = self.parser.parse(raw);
            let timestamp = if offset == 0 { first.timestamp } else { None };
            self.push(
                raw,
                timestamp,
                parsed.level.unwrap_or(LevelFlags::OTHER),
                Some(entry_index),
            );
        }
    }

    /// Retracts all lines from `index` on.
    pub fn remove_from(&self, index: usize) {
        {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            if index >= buffer.entries.len() {
                return;
            }
            buffer.entries.truncate(index);
            buffer.last_timestamp = buffer.entries.iter().rev().find_map(|e| e.timestamp);
            if buffer.entries.is_empty() {
                buffer.first_timestamp = None;
            }
        }
        self.listeners.invalidate(index);
    }

    /// Drops all content; listeners observe a `Reset`.
    pub fn clear(&self) {
        {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            buffer.entries.clear();
            buffer.first_timestamp = None;
            buffer.last_timestamp = None;
        }
        self.listeners.reset();
    }

    fn push(
        &self,
        raw: &str,
        timestamp: Option<DateTime<Utc>>,
        level: LevelFlags,
        entry_index: Option<usize>,
    ) {
        let count = {
            let mut buffer = self.buffer.lock().expect("buffer lock poisoned");
            let index = buffer.entries.len();
            let elapsed = match (buffer.first_timestamp, timestamp) {
                (Some(first), Some(now)) => Some(now - first),
                _ => None,
            };
            let delta = match (buffer.last_timestamp, timestamp) {
                (Some(previous), Some(now)) => Some(now - previous),
                _ => None,
            };
            if timestamp.is_some() {
                if buffer.first_timestamp.is_none() {
                    buffer.first_timestamp = timestamp;
                }
                buffer.last_timestamp = timestamp;
            }
            buffer.entries.push(LogEntry {
                index,
                original_index: index,
                entry_index: entry_index.unwrap_or(index),
                line_number: index + 1,
                raw: raw.to_string(),
                timestamp,
                level,
                elapsed: elapsed.or(timestamp.map(|_| chrono::Duration::zero())),
                delta,
            });
            buffer.entries.len()
        };
        self.listeners.on_read(count);
        self.listeners.flush();
    }

    /// Appends a continuation line to the last logical entry; behaves like
    /// [`add_line`] when the source is still empty.
    ///
    /// [`add_line`]: InMemoryLogSource::add_line
    pub fn add_continuation(&self, raw: &str) {
        let entry_index = self
            .buffer
            .lock()
            .expect("buffer lock poisoned")
            .entries
            .last()
            .map(|entry| entry.entry_index);
        let parsed = self.parser.parse(raw);
        self.push(raw, None, parsed.level.unwrap_or(LevelFlags::OTHER), entry_index);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.listener_count()
    }
}

impl LogSource for InMemoryLogSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn add_listener(
        &self,
        listener: Arc<dyn SourceListener>,
        max_wait: Duration,
        max_count: usize,
    ) {
        self.listeners.add_listener(listener, max_wait, max_count);
    }

    fn remove_listener(&self, listener: &Arc<dyn SourceListener>) {
        self.listeners.remove_listener(listener);
    }

    fn count(&self) -> usize {
        self.buffer.lock().expect("buffer lock poisoned").entries.len()
    }

    fn get_entry(&self, index: usize) -> LogEntry {
        let buffer = self.buffer.lock().expect("buffer lock poisoned");
        assert_index_in_range(index, buffer.entries.len());
        buffer.entries[index].clone()
    }

    fn get_entries(&self, section: LogSection) -> Vec<LogEntry> {
        let buffer = self.buffer.lock().expect("buffer lock poisoned");
        assert_section_in_range(section, buffer.entries.len());
        buffer.entries[section.index..section.end()].to_vec()
    }

    fn progress(&self) -> f64 {
        1.0
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn error(&self) -> SourceError {
        SourceError::None
    }

    fn wait_until_caught_up(&self, _timeout: Option<Duration>) -> bool {
        true
    }
}
