use super::LogEntryFilter;
use crate::entry::{LogEntry, MatchSpan};

fn fold_case(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Matches entries containing a literal substring, optionally ignoring case.
///
/// Matching and span reporting work on characters, so reported offsets line up
/// with what a renderer counts.
pub struct SubstringFilter {
    needle: Vec<char>,
    ignore_case: bool,
}

impl SubstringFilter {
    pub fn new(pattern: &str, ignore_case: bool) -> Self {
        let needle = if ignore_case {
            pattern.chars().map(fold_case).collect()
        } else {
            pattern.chars().collect()
        };
        Self {
            needle,
            ignore_case,
        }
    }

    fn haystack(&self, raw: &str) -> Vec<char> {
        if self.ignore_case {
            raw.chars().map(fold_case).collect()
        } else {
            raw.chars().collect()
        }
    }

    /// All non-overlapping occurrences, in order, as character spans.
    pub fn spans(&self, raw: &str) -> Vec<MatchSpan> {
        let n = self.needle.len();
        if n == 0 {
            return Vec::new();
        }
        let hay = self.haystack(raw);
        let mut spans = Vec::new();
        let mut i = 0;
        while i + n <= hay.len() {
            if hay[i..i + n] == self.needle[..] {
                spans.push(MatchSpan::new(i, n));
                i += n;
            } else {
                i += 1;
            }
        }
        spans
    }

    fn contains(&self, raw: &str) -> bool {
        let n = self.needle.len();
        if n == 0 {
            return true;
        }
        let hay = self.haystack(raw);
        hay.windows(n).any(|window| *window == self.needle[..])
    }
}

impl LogEntryFilter for SubstringFilter {
    fn passes(&self, entry: &LogEntry) -> bool {
        self.contains(&entry.raw)
    }

    fn find_matches(&self, entry: &LogEntry) -> Vec<MatchSpan> {
        self.spans(&entry.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(raw: &str) -> LogEntry {
        LogEntry::new(0, raw)
    }

    #[test]
    fn test_case_sensitive() {
        let filter = SubstringFilter::new("ERROR", false);
        assert!(filter.passes(&entry("ERROR: boom")));
        assert!(!filter.passes(&entry("error: boom")));
        assert!(!filter.passes(&entry("all fine")));
    }

    #[test]
    fn test_ignore_case() {
        let filter = SubstringFilter::new("foo", true);
        assert!(filter.passes(&entry("FOO bar")));
        assert!(filter.passes(&entry("some Foo here")));
        assert!(!filter.passes(&entry("fo o")));
    }

    #[test]
    fn test_span_for_ignore_case_match() {
        // "foo" against "FOO bar": one match at character 0, length 3.
        let filter = SubstringFilter::new("foo", true);
        let spans = filter.find_matches(&entry("FOO bar"));
        assert_eq!(spans, vec![MatchSpan::new(0, 3)]);
    }

    #[test]
    fn test_multiple_non_overlapping_spans() {
        let filter = SubstringFilter::new("ab", false);
        let spans = filter.find_matches(&entry("ab ab abab"));
        assert_eq!(
            spans,
            vec![
                MatchSpan::new(0, 2),
                MatchSpan::new(3, 2),
                MatchSpan::new(6, 2),
                MatchSpan::new(8, 2),
            ]
        );
    }

    #[test]
    fn test_spans_count_characters_not_bytes() {
        let filter = SubstringFilter::new("log", true);
        // Two multibyte characters precede the match.
        let spans = filter.find_matches(&entry("你好 Log here"));
        assert_eq!(spans, vec![MatchSpan::new(3, 3)]);
    }

    #[test]
    fn test_empty_pattern_passes_without_spans() {
        let filter = SubstringFilter::new("", true);
        assert!(filter.passes(&entry("anything")));
        assert!(filter.find_matches(&entry("anything")).is_empty());
    }
}
