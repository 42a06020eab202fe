use crate::entry::LevelFlags;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Columns detected from a line's raw text at ingest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParsedEntry {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<LevelFlags>,
}

/// Detects timestamp and severity for a raw line.
///
/// Implemented by format plugins; the engine never calls a plugin parser
/// directly but always through [`NoThrowParser`].
pub trait EntryParser: Send + Sync {
    fn parse(&self, raw: &str) -> ParsedEntry;
}

/// Severity tokens, scanned for their leftmost occurrence. The token closest
/// to the start of the line wins; order here breaks ties at equal offsets.
const LEVEL_TOKENS: [(&str, LevelFlags); 7] = [
    ("FATAL", LevelFlags::FATAL),
    ("ERROR", LevelFlags::ERROR),
    ("WARNING", LevelFlags::WARNING),
    ("WARN", LevelFlags::WARNING),
    ("INFO", LevelFlags::INFO),
    ("DEBUG", LevelFlags::DEBUG),
    ("TRACE", LevelFlags::TRACE),
];

/// Timestamp formats tried against a fixed-length prefix of the line.
const TIMESTAMP_FORMATS: [(usize, &str); 6] = [
    (23, "%Y-%m-%d %H:%M:%S%.3f"),
    (23, "%Y-%m-%dT%H:%M:%S%.3f"),
    (19, "%Y-%m-%d %H:%M:%S"),
    (19, "%Y-%m-%dT%H:%M:%S"),
    (20, "%d/%b/%Y %H:%M:%S"),
    (17, "%d.%m.%y %H:%M:%S"),
];

/// Heuristic parser for plain text logs.
///
/// Levels are recognized by their leftmost token occurrence. Timestamps are
/// expected at the start of the line; the first format that ever matches is
/// remembered and tried first on subsequent lines, since a given log rarely
/// mixes formats.
pub struct DefaultEntryParser {
    last_format: AtomicUsize,
}

impl DefaultEntryParser {
    pub fn new() -> Self {
        Self {
            last_format: AtomicUsize::new(0),
        }
    }

    fn detect_level(raw: &str) -> Option<LevelFlags> {
        let mut best: Option<(usize, LevelFlags)> = None;
        for (token, flag) in LEVEL_TOKENS {
            if let Some(pos) = raw.find(token) {
                match best {
                    Some((best_pos, _)) if best_pos <= pos => {}
                    _ => best = Some((pos, flag)),
                }
            }
        }
        best.map(|(_, flag)| flag)
    }

    fn try_format(raw: &str, len: usize, format: &str) -> Option<DateTime<Utc>> {
        if raw.len() < len || !raw.is_char_boundary(len) {
            return None;
        }
        NaiveDateTime::parse_from_str(&raw[..len], format)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    fn detect_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        let preferred = self.last_format.load(Ordering::Relaxed);
        let (len, format) = TIMESTAMP_FORMATS[preferred];
        if let Some(timestamp) = Self::try_format(raw, len, format) {
            return Some(timestamp);
        }

        for (i, (len, format)) in TIMESTAMP_FORMATS.iter().enumerate() {
            if i == preferred {
                continue;
            }
            if let Some(timestamp) = Self::try_format(raw, *len, format) {
                self.last_format.store(i, Ordering::Relaxed);
                return Some(timestamp);
            }
        }
        None
    }
}

impl Default for DefaultEntryParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryParser for DefaultEntryParser {
    fn parse(&self, raw: &str) -> ParsedEntry {
        ParsedEntry {
            timestamp: self.detect_timestamp(raw),
            level: Self::detect_level(raw),
        }
    }
}

/// Wraps an externally supplied parser so that a panic inside it cannot take
/// down the stage that ingests with it. A panicking parse is logged and
/// yields an empty [`ParsedEntry`].
pub struct NoThrowParser {
    inner: Arc<dyn EntryParser>,
}

impl NoThrowParser {
    pub fn new(inner: Arc<dyn EntryParser>) -> Self {
        Self { inner }
    }
}

impl EntryParser for NoThrowParser {
    fn parse(&self, raw: &str) -> ParsedEntry {
        match catch_unwind(AssertUnwindSafe(|| self.inner.parse(raw))) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("entry parser panicked, treating line as unparsed");
                ParsedEntry::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_detect_level_simple() {
        let parser = DefaultEntryParser::new();
        assert_eq!(parser.parse("INFO starting up").level, Some(LevelFlags::INFO));
        assert_eq!(
            parser.parse("2021-01-01 00:00:00 ERROR boom").level,
            Some(LevelFlags::ERROR)
        );
        assert_eq!(parser.parse("WARN low disk").level, Some(LevelFlags::WARNING));
        assert_eq!(parser.parse("nothing to see here").level, None);
    }

    #[test]
    fn test_leftmost_level_wins() {
        let parser = DefaultEntryParser::new();
        // DEBUG appears before ERROR, so the line counts as debug.
        assert_eq!(
            parser.parse("DEBUG retrying after ERROR").level,
            Some(LevelFlags::DEBUG)
        );
    }

    #[test]
    fn test_detect_timestamp_formats() {
        let parser = DefaultEntryParser::new();

        let with_millis = parser.parse("2021-03-02 14:05:06.123 INFO hello");
        let ts = with_millis.timestamp.expect("timestamp detected");
        assert_eq!(ts.time().nanosecond(), 123_000_000);

        let iso = parser.parse("2021-03-02T14:05:06 something");
        assert!(iso.timestamp.is_some());

        let none = parser.parse("no timestamp here");
        assert!(none.timestamp.is_none());
    }

    #[test]
    fn test_format_caching_does_not_break_other_lines() {
        let parser = DefaultEntryParser::new();
        assert!(parser.parse("2021-03-02T14:05:06.500 a").timestamp.is_some());
        // A different format still parses after the cache locked onto ISO.
        assert!(parser.parse("2021-03-02 14:05:06 b").timestamp.is_some());
    }

    #[test]
    fn test_multibyte_prefix_does_not_panic() {
        let parser = DefaultEntryParser::new();
        let parsed = parser.parse("日本語のログ行です、タイムスタンプなし");
        assert!(parsed.timestamp.is_none());
    }

    struct PanickingParser;

    impl EntryParser for PanickingParser {
        fn parse(&self, _raw: &str) -> ParsedEntry {
            panic!("plugin bug")
        }
    }

    #[test]
    fn test_no_throw_swallows_panic() {
        let parser = NoThrowParser::new(Arc::new(PanickingParser));
        assert_eq!(parser.parse("anything"), ParsedEntry::default());
    }

    #[test]
    fn test_no_throw_passes_through() {
        let parser = NoThrowParser::new(Arc::new(DefaultEntryParser::new()));
        assert_eq!(parser.parse("ERROR x").level, Some(LevelFlags::ERROR));
    }
}
