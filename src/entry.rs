use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bit flags describing the severity of a log entry.
///
/// A single entry usually carries exactly one flag; `OTHER` marks entries whose
/// severity could not be detected. Masks used by level filters may combine any
/// number of flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LevelFlags(u8);

impl LevelFlags {
    pub const NONE: LevelFlags = LevelFlags(0);
    pub const TRACE: LevelFlags = LevelFlags(1 << 0);
    pub const DEBUG: LevelFlags = LevelFlags(1 << 1);
    pub const INFO: LevelFlags = LevelFlags(1 << 2);
    pub const WARNING: LevelFlags = LevelFlags(1 << 3);
    pub const ERROR: LevelFlags = LevelFlags(1 << 4);
    pub const FATAL: LevelFlags = LevelFlags(1 << 5);
    /// Severity could not be detected from the entry's text.
    pub const OTHER: LevelFlags = LevelFlags(1 << 6);
    pub const ALL: LevelFlags = LevelFlags(0x7f);

    pub fn contains(self, other: LevelFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether this value shares at least one flag with `other`.
    pub fn intersects(self, other: LevelFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for LevelFlags {
    type Output = LevelFlags;
    fn bitor(self, rhs: LevelFlags) -> LevelFlags {
        LevelFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for LevelFlags {
    fn bitor_assign(&mut self, rhs: LevelFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for LevelFlags {
    type Output = LevelFlags;
    fn bitand(self, rhs: LevelFlags) -> LevelFlags {
        LevelFlags(self.0 & rhs.0)
    }
}

impl Default for LevelFlags {
    fn default() -> Self {
        LevelFlags::OTHER
    }
}

impl fmt::Display for LevelFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(LevelFlags, &str); 7] = [
            (LevelFlags::TRACE, "Trace"),
            (LevelFlags::DEBUG, "Debug"),
            (LevelFlags::INFO, "Info"),
            (LevelFlags::WARNING, "Warning"),
            (LevelFlags::ERROR, "Error"),
            (LevelFlags::FATAL, "Fatal"),
            (LevelFlags::OTHER, "Other"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "None")?;
        }
        Ok(())
    }
}

/// A span of matched characters within a single line.
///
/// Offsets and counts are measured in characters, not bytes, so they can be
/// handed to a renderer for highlighting without re-decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchSpan {
    pub offset: usize,
    pub count: usize,
}

impl MatchSpan {
    pub fn new(offset: usize, count: usize) -> Self {
        Self { offset, count }
    }
}

/// A single sub-line match produced by the search engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchMatch {
    /// Index of the line the match was found in.
    pub line_index: usize,
    pub span: MatchSpan,
}

impl SearchMatch {
    pub fn new(line_index: usize, span: MatchSpan) -> Self {
        Self { line_index, span }
    }
}

/// One positional log row.
///
/// Entries are value snapshots: once handed out they do not observe later
/// changes to the source. After a `Reset` all previously handed-out entries are
/// stale. Unset columns hold their documented defaults (`None`,
/// `LevelFlags::OTHER`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Index of this entry within the source it was fetched from.
    pub index: usize,
    /// Index of this entry within the innermost (pre-filter) source.
    pub original_index: usize,
    /// Index of the logical (possibly multi-line) entry this line belongs to.
    pub entry_index: usize,
    /// One-based line number for display.
    pub line_number: usize,
    /// Raw text of the line, without its terminator.
    pub raw: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub level: LevelFlags,
    /// Time elapsed since the first timestamped entry of the source.
    pub elapsed: Option<Duration>,
    /// Time elapsed since the previous timestamped entry.
    pub delta: Option<Duration>,
}

impl LogEntry {
    /// A minimal entry at the given index with all optional columns unset.
    pub fn new(index: usize, raw: impl Into<String>) -> Self {
        Self {
            index,
            original_index: index,
            entry_index: index,
            line_number: index + 1,
            raw: raw.into(),
            timestamp: None,
            level: LevelFlags::OTHER,
            elapsed: None,
            delta: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_flags_all_is_union() {
        let union = LevelFlags::TRACE
            | LevelFlags::DEBUG
            | LevelFlags::INFO
            | LevelFlags::WARNING
            | LevelFlags::ERROR
            | LevelFlags::FATAL
            | LevelFlags::OTHER;
        assert_eq!(union, LevelFlags::ALL);
    }

    #[test]
    fn test_level_flags_contains() {
        let mask = LevelFlags::WARNING | LevelFlags::ERROR;
        assert!(mask.contains(LevelFlags::ERROR));
        assert!(!mask.contains(LevelFlags::INFO));
        assert!(LevelFlags::ALL.contains(mask));
    }

    #[test]
    fn test_level_flags_intersects() {
        let mask = LevelFlags::ERROR | LevelFlags::FATAL;
        assert!(mask.intersects(LevelFlags::ERROR));
        assert!(!mask.intersects(LevelFlags::DEBUG));
        assert!(!LevelFlags::NONE.intersects(LevelFlags::ALL));
    }

    #[test]
    fn test_level_flags_display() {
        assert_eq!(LevelFlags::ERROR.to_string(), "Error");
        assert_eq!(
            (LevelFlags::INFO | LevelFlags::FATAL).to_string(),
            "Info|Fatal"
        );
        assert_eq!(LevelFlags::NONE.to_string(), "None");
    }

    #[test]
    fn test_default_entry_columns() {
        let entry = LogEntry::new(4, "hello");
        assert_eq!(entry.index, 4);
        assert_eq!(entry.original_index, 4);
        assert_eq!(entry.entry_index, 4);
        assert_eq!(entry.line_number, 5);
        assert_eq!(entry.raw, "hello");
        assert_eq!(entry.level, LevelFlags::OTHER);
        assert!(entry.timestamp.is_none());
        assert!(entry.elapsed.is_none());
        assert!(entry.delta.is_none());
    }
}
