use crate::entry::LogEntry;
use crate::listener::SourceListener;
use crate::section::LogSection;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Identifies one source instance for the lifetime of the process.
///
/// Ids are plain values: a merged view's back-reference to the source a line
/// came from is `(SourceId, local index)`, never a pointer into the owning
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocates a fresh id from a process-wide counter.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source#{}", self.0)
    }
}

/// Why a source currently has no content.
///
/// Stage-internal failures never cross the listener boundary as panics or
/// errors; they surface here and clear on their own once the underlying
/// condition goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceError {
    #[default]
    None,
    /// The backing stream does not exist (deleted, unmounted, not yet created).
    SourceDoesNotExist,
    /// The backing stream exists but cannot be opened or read.
    SourceCannotBeAccessed,
}

impl SourceError {
    pub fn is_error(self) -> bool {
        self != SourceError::None
    }
}

/// The contract every pipeline stage implements and consumes.
///
/// A stage exposes its buffered entries by index, announces changes through
/// registered listeners, and reports its properties (count, size, timestamps,
/// progress, error state). Dropping a stage stops its periodic task and
/// detaches it from its upstream; in-flight runs may still complete
/// afterwards.
///
/// Index arguments out of the source's current range are programmer errors
/// and panic; runtime conditions (missing file, IO failure) never do.
pub trait LogSource: Send + Sync {
    fn id(&self) -> SourceId;

    /// Registers a listener with its batching parameters. Registration
    /// synchronously delivers `Reset` plus catch-up `Appended` notifications;
    /// afterwards no callback ever carries a section larger than `max_count`.
    fn add_listener(
        &self,
        listener: Arc<dyn SourceListener>,
        max_wait: Duration,
        max_count: usize,
    );

    fn remove_listener(&self, listener: &Arc<dyn SourceListener>);

    /// Number of entries currently visible. Monotonically non-decreasing
    /// between `Reset`s.
    fn count(&self) -> usize;

    /// Returns the entry at `index`.
    ///
    /// # Panics
    /// When `index >= count()`.
    fn get_entry(&self, index: usize) -> LogEntry;

    /// Returns the entries of `section`, in order.
    ///
    /// # Panics
    /// When the section reaches past `count()`.
    fn get_entries(&self, section: LogSection) -> Vec<LogEntry>;

    /// Fraction of the underlying stream processed, `0.0..=1.0`. Pinned below
    /// `1.0` until a pass has consumed everything available.
    fn progress(&self) -> f64;

    /// Size of the underlying stream in bytes, when known.
    fn size(&self) -> Option<u64>;

    fn created(&self) -> Option<DateTime<Utc>>;

    fn modified(&self) -> Option<DateTime<Utc>>;

    fn error(&self) -> SourceError;

    /// Blocks until this source has processed everything its upstream (or
    /// backing stream) currently holds. `None` waits without bound; returns
    /// whether the caught-up state was reached within the budget.
    fn wait_until_caught_up(&self, timeout: Option<Duration>) -> bool;
}

/// Fetches `section` from a source that may shrink concurrently.
///
/// The section is clamped to what the source holds right now, and a fetch
/// that still loses the race returns nothing instead of unwinding into the
/// caller. The retraction itself arrives as a `Removed` notification, so a
/// short read here is made up for on the next pass.
pub(crate) fn fetch_section(source: &dyn LogSource, section: LogSection) -> Vec<LogEntry> {
    let available = source.count();
    if section.index >= available {
        return Vec::new();
    }
    let clamped = LogSection::new(section.index, section.count.min(available - section.index));
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| source.get_entries(clamped))) {
        Ok(entries) => entries,
        Err(_) => {
            warn!(source = %source.id(), section = %clamped, "source shrank during fetch");
            Vec::new()
        }
    }
}

/// Panics unless `section` lies fully within `count` entries.
pub(crate) fn assert_section_in_range(section: LogSection, count: usize) {
    assert!(
        section.end() <= count,
        "section {} out of range (count {})",
        section,
        count
    );
}

/// Panics unless `index` addresses one of `count` entries.
pub(crate) fn assert_index_in_range(index: usize, count: usize) {
    assert!(index < count, "index {} out of range (count {})", index, count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryLogSource;
    use chrono::{DateTime, Utc};

    /// Reports more entries than it can actually hand out, standing in for an
    /// upstream that was truncated between `count` and `get_entries`.
    struct Overstating {
        inner: Arc<InMemoryLogSource>,
    }

    impl LogSource for Overstating {
        fn id(&self) -> SourceId {
            self.inner.id()
        }

        fn add_listener(
            &self,
            listener: Arc<dyn SourceListener>,
            max_wait: Duration,
            max_count: usize,
        ) {
            self.inner.add_listener(listener, max_wait, max_count);
        }

        fn remove_listener(&self, listener: &Arc<dyn SourceListener>) {
            self.inner.remove_listener(listener);
        }

        fn count(&self) -> usize {
            self.inner.count() + 2
        }

        fn get_entry(&self, index: usize) -> LogEntry {
            self.inner.get_entry(index)
        }

        fn get_entries(&self, section: LogSection) -> Vec<LogEntry> {
            self.inner.get_entries(section)
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

    #[test]
    fn test_fetch_section_clamps_to_available() {
        let source = InMemoryLogSource::new();
        source.add_line("a");
        source.add_line("b");
        source.add_line("c");

        let entries = fetch_section(source.as_ref(), LogSection::new(1, 10));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].raw, "b");
    }

    #[test]
    fn test_fetch_section_past_end_is_empty() {
        let source = InMemoryLogSource::new();
        source.add_line("only");
        assert!(fetch_section(source.as_ref(), LogSection::new(5, 3)).is_empty());
    }

    #[test]
    fn test_fetch_section_survives_a_shrinking_source() {
        let inner = InMemoryLogSource::new();
        inner.add_line("a");
        let source = Overstating { inner };

        // count() claims 3 lines, the fetch finds only 1 left; the lost race
        // must return nothing rather than unwind into the calling stage.
        let entries = fetch_section(&source, LogSection::new(0, 3));
        assert!(entries.is_empty());
    }

    #[test]
    fn test_source_ids_are_unique() {
        let a = SourceId::next();
        let b = SourceId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_source_error_default() {
        assert_eq!(SourceError::default(), SourceError::None);
        assert!(!SourceError::None.is_error());
        assert!(SourceError::SourceDoesNotExist.is_error());
        assert!(SourceError::SourceCannotBeAccessed.is_error());
    }

    #[test]
    fn test_section_range_checks() {
        assert_section_in_range(LogSection::new(0, 5), 5);
        assert_section_in_range(LogSection::new(4, 0), 4);
        assert_index_in_range(4, 5);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_section_past_end_panics() {
        assert_section_in_range(LogSection::new(3, 3), 5);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_past_end_panics() {
        assert_index_in_range(5, 5);
    }
}
