pub mod and;
pub mod invert;
pub mod level;
pub mod no_throw;
pub mod regex_filter;
pub mod substring;
pub mod time_range;
pub mod wildcard;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::entry::{LogEntry, MatchSpan};

pub use and::AndFilter;
pub use invert::InvertFilter;
pub use level::LevelFilter;
pub use no_throw::NoThrowFilter;
pub use regex_filter::RegexFilter;
pub use substring::SubstringFilter;
pub use time_range::TimeRangeFilter;
pub use wildcard::WildcardFilter;

/// Decides which log entries a filtered view keeps.
pub trait LogEntryFilter: Send + Sync {
    /// Whether a single line passes the filter.
    fn passes(&self, entry: &LogEntry) -> bool;

    /// Whether a multi-line entry passes as a whole.
    ///
    /// The default keeps the entry when any of its lines passes, which is
    /// what every text-matching filter wants.
    fn passes_entry(&self, lines: &[LogEntry]) -> bool {
        lines.iter().any(|line| self.passes(line))
    }

    /// Character spans within the line's text that caused the match.
    ///
    /// Filters without a positive text match (level, time range, inversion)
    /// report none.
    fn find_matches(&self, _entry: &LogEntry) -> Vec<MatchSpan> {
        Vec::new()
    }
}

/// How the `value` of a [`FilterSpec`] is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMatchType {
    Substring,
    Wildcard,
    Regex,
}

/// A declarative text filter, as persisted in user configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub match_type: FilterMatchType,
    pub value: String,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub invert: bool,
}

/// Builds the filter a [`FilterSpec`] describes.
///
/// An empty value yields `None`: an empty filter would pass everything and
/// filtering is cheaper skipped. Regex and wildcard patterns may fail to
/// compile.
pub fn create(spec: &FilterSpec) -> Result<Option<Arc<dyn LogEntryFilter>>> {
    if spec.value.is_empty() {
        return Ok(None);
    }
    let filter: Arc<dyn LogEntryFilter> = match spec.match_type {
        FilterMatchType::Substring => Arc::new(SubstringFilter::new(&spec.value, spec.ignore_case)),
        FilterMatchType::Wildcard => Arc::new(WildcardFilter::new(&spec.value, spec.ignore_case)?),
        FilterMatchType::Regex => Arc::new(RegexFilter::new(&spec.value, spec.ignore_case)?),
    };
    if spec.invert {
        Ok(Some(Arc::new(InvertFilter::new(filter))))
    } else {
        Ok(Some(filter))
    }
}

/// Combines several specs into a single conjunction, skipping empty ones.
///
/// Returns `None` when no spec produced a filter.
pub fn create_all(specs: &[FilterSpec]) -> Result<Option<Arc<dyn LogEntryFilter>>> {
    let mut filters = Vec::new();
    for spec in specs {
        if let Some(filter) = create(spec)? {
            filters.push(filter);
        }
    }
    match filters.len() {
        0 => Ok(None),
        1 => Ok(Some(filters.pop().expect("len checked"))),
        _ => Ok(Some(Arc::new(AndFilter::new(filters)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(raw: &str) -> LogEntry {
        LogEntry::new(0, raw)
    }

    fn spec(match_type: FilterMatchType, value: &str) -> FilterSpec {
        FilterSpec {
            match_type,
            value: value.to_string(),
            ignore_case: true,
            invert: false,
        }
    }

    #[test]
    fn test_create_empty_value_yields_none() {
        let filter = create(&spec(FilterMatchType::Substring, "")).unwrap();
        assert!(filter.is_none());
    }

    #[test]
    fn test_create_substring() {
        let filter = create(&spec(FilterMatchType::Substring, "foo"))
            .unwrap()
            .unwrap();
        assert!(filter.passes(&entry("FOO bar")));
        assert!(!filter.passes(&entry("bar")));
    }

    #[test]
    fn test_create_inverted() {
        let mut s = spec(FilterMatchType::Substring, "foo");
        s.invert = true;
        let filter = create(&s).unwrap().unwrap();
        assert!(!filter.passes(&entry("foo")));
        assert!(filter.passes(&entry("bar")));
    }

    #[test]
    fn test_create_bad_regex_fails() {
        assert!(create(&spec(FilterMatchType::Regex, "[unclosed")).is_err());
    }

    #[test]
    fn test_create_all_skips_empty_and_conjoins() {
        let specs = [
            spec(FilterMatchType::Substring, "foo"),
            spec(FilterMatchType::Substring, ""),
            spec(FilterMatchType::Substring, "bar"),
        ];
        let filter = create_all(&specs).unwrap().unwrap();
        assert!(filter.passes(&entry("foo bar")));
        assert!(!filter.passes(&entry("foo only")));
    }

    #[test]
    fn test_create_all_empty_yields_none() {
        assert!(create_all(&[]).unwrap().is_none());
        assert!(create_all(&[spec(FilterMatchType::Substring, "")])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_spec_round_trips_defaults() {
        let s = spec(FilterMatchType::Wildcard, "*.log");
        let filter = create(&s).unwrap().unwrap();
        assert!(filter.passes(&entry("output.log")));
    }
}
