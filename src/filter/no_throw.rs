use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use super::LogEntryFilter;
use crate::entry::{LogEntry, MatchSpan};

/// Shields the pipeline from a panicking filter.
///
/// Filters come from user input and third-party code, and a panic while
/// evaluating one must not tear down the view. A panic in `passes` counts as
/// a pass so the entry stays visible, a panic in `find_matches` yields no
/// spans.
pub struct NoThrowFilter {
    inner: Arc<dyn LogEntryFilter>,
}

impl NoThrowFilter {
    pub fn new(inner: Arc<dyn LogEntryFilter>) -> Self {
        Self { inner }
    }
}

impl LogEntryFilter for NoThrowFilter {
    fn passes(&self, entry: &LogEntry) -> bool {
        catch_unwind(AssertUnwindSafe(|| self.inner.passes(entry))).unwrap_or_else(|_| {
            warn!(index = entry.index, "filter panicked, letting entry pass");
            true
        })
    }

    fn passes_entry(&self, lines: &[LogEntry]) -> bool {
        catch_unwind(AssertUnwindSafe(|| self.inner.passes_entry(lines))).unwrap_or_else(|_| {
            warn!("filter panicked on multi-line entry, letting it pass");
            true
        })
    }

    fn find_matches(&self, entry: &LogEntry) -> Vec<MatchSpan> {
        catch_unwind(AssertUnwindSafe(|| self.inner.find_matches(entry))).unwrap_or_else(|_| {
            warn!(index = entry.index, "filter panicked while highlighting");
            Vec::new()
        })
    }
}
