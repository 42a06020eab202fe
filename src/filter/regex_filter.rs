use super::LogEntryFilter;
use crate::entry::{LogEntry, MatchSpan};
use anyhow::Result;
use regex::{Regex, RegexBuilder};

/// Matches entries against a regular expression.
pub struct RegexFilter {
    regex: Regex,
}

impl RegexFilter {
    pub fn new(pattern: &str, ignore_case: bool) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(ignore_case)
            .build()?;
        Ok(Self { regex })
    }
}

impl LogEntryFilter for RegexFilter {
    fn passes(&self, entry: &LogEntry) -> bool {
        self.regex.is_match(&entry.raw)
    }

    fn find_matches(&self, entry: &LogEntry) -> Vec<MatchSpan> {
        let raw = &entry.raw;
        self.regex
            .find_iter(raw)
            .filter(|m| !m.as_str().is_empty())
            .map(|m| {
                let offset = raw[..m.start()].chars().count();
                let count = m.as_str().chars().count();
                MatchSpan::new(offset, count)
            })
            .collect()
    }
}
