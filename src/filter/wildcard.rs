use super::LogEntryFilter;
use crate::entry::{LogEntry, MatchSpan};
use anyhow::Result;
use regex::{Regex, RegexBuilder};

/// Matches entries against a wildcard pattern: `*` matches any run of
/// characters, `?` matches exactly one, everything else is literal.
///
/// The pattern is compiled to a regex once at construction.
pub struct WildcardFilter {
    regex: Regex,
}

impl WildcardFilter {
    pub fn new(pattern: &str, ignore_case: bool) -> Result<Self> {
        let mut translated = String::with_capacity(pattern.len() * 2);
        for c in pattern.chars() {
            match c {
                '*' => translated.push_str(".*"),
                '?' => translated.push('.'),
                other => translated.push_str(&regex::escape(&other.to_string())),
            }
        }
        let regex = RegexBuilder::new(&translated)
            .case_insensitive(ignore_case)
            .build()?;
        Ok(Self { regex })
    }
}

impl LogEntryFilter for WildcardFilter {
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
