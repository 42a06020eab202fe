use std::sync::Arc;

use super::LogEntryFilter;
use crate::entry::LogEntry;

/// Negates another filter's verdict.
///
/// The negation applies to whole entries: a multi-line entry is hidden when
/// the inner filter would have shown it, and vice versa. Match spans are not
/// reported because a negated filter has no positive match to highlight.
pub struct InvertFilter {
    inner: Arc<dyn LogEntryFilter>,
}

impl InvertFilter {
    pub fn new(inner: Arc<dyn LogEntryFilter>) -> Self {
        Self { inner }
    }
}

impl LogEntryFilter for InvertFilter {
    fn passes(&self, entry: &LogEntry) -> bool {
        !self.inner.passes(entry)
    }

    fn passes_entry(&self, lines: &[LogEntry]) -> bool {
        !self.inner.passes_entry(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::substring::SubstringFilter;

    fn entry(raw: &str) -> LogEntry {
        LogEntry::new(0, raw)
    }

    #[test]
    fn test_inverts_single_line_verdict() {
        let filter = InvertFilter::new(Arc::new(SubstringFilter::new("error", true)));
        assert!(filter.passes(&entry("all good")));
        assert!(!filter.passes(&entry("an ERROR occurred")));
    }

    #[test]
    fn test_inverts_entry_verdict() {
        let filter = InvertFilter::new(Arc::new(SubstringFilter::new("error", true)));
        let lines = [entry("first line"), entry("error on second")];
        assert!(!filter.passes_entry(&lines));

        let clean = [entry("first"), entry("second")];
        assert!(filter.passes_entry(&clean));
    }

    #[test]
    fn test_reports_no_spans() {
        let filter = InvertFilter::new(Arc::new(SubstringFilter::new("error", true)));
        assert!(filter.find_matches(&entry("no match")).is_empty());
    }
}
