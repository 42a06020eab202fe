use std::sync::Arc;

use super::LogEntryFilter;
use crate::entry::{LogEntry, MatchSpan};

/// Conjunction of several filters.
///
/// A single line passes only when every child passes it. A multi-line entry
/// passes when every child is satisfied somewhere within the entry, not
/// necessarily on the same line. Spans are the concatenation of all children's
/// spans.
pub struct AndFilter {
    filters: Vec<Arc<dyn LogEntryFilter>>,
}

impl AndFilter {
    pub fn new(filters: Vec<Arc<dyn LogEntryFilter>>) -> Self {
        Self { filters }
    }
}

impl LogEntryFilter for AndFilter {
    fn passes(&self, entry: &LogEntry) -> bool {
        self.filters.iter().all(|f| f.passes(entry))
    }

    fn passes_entry(&self, lines: &[LogEntry]) -> bool {
        self.filters.iter().all(|f| f.passes_entry(lines))
    }

    fn find_matches(&self, entry: &LogEntry) -> Vec<MatchSpan> {
        let mut spans = Vec::new();
        for filter in &self.filters {
            spans.extend(filter.find_matches(entry));
        }
        spans
    }
}
