use chrono::{DateTime, Utc};

use super::LogEntryFilter;
use crate::entry::LogEntry;

/// Passes entries whose timestamp falls inside an inclusive range.
///
/// Either bound may be open. Entries without a timestamp never pass, since
/// nothing can place them inside the range.
pub struct TimeRangeFilter {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl TimeRangeFilter {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }
}

impl LogEntryFilter for TimeRangeFilter {
    fn passes(&self, entry: &LogEntry) -> bool {
        let Some(timestamp) = entry.timestamp else {
            return false;
        };
        if let Some(start) = self.start {
            if timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if timestamp > end {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry_at(hour: u32, minute: u32) -> LogEntry {
        let mut entry = LogEntry::new(0, "line");
        entry.timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap());
        entry
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_inside_range_passes() {
        let filter = TimeRangeFilter::new(Some(at(10, 0)), Some(at(11, 0)));
        assert!(filter.passes(&entry_at(10, 30)));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let filter = TimeRangeFilter::new(Some(at(10, 0)), Some(at(11, 0)));
        assert!(filter.passes(&entry_at(10, 0)));
        assert!(filter.passes(&entry_at(11, 0)));
    }

    #[test]
    fn test_outside_range_is_hidden() {
        let filter = TimeRangeFilter::new(Some(at(10, 0)), Some(at(11, 0)));
        assert!(!filter.passes(&entry_at(9, 59)));
        assert!(!filter.passes(&entry_at(11, 1)));
    }

    #[test]
    fn test_open_bounds() {
        let after = TimeRangeFilter::new(Some(at(10, 0)), None);
        assert!(after.passes(&entry_at(23, 0)));
        assert!(!after.passes(&entry_at(9, 0)));

        let before = TimeRangeFilter::new(None, Some(at(10, 0)));
        assert!(before.passes(&entry_at(9, 0)));
        assert!(!before.passes(&entry_at(23, 0)));
    }

    #[test]
    fn test_missing_timestamp_never_passes() {
        let filter = TimeRangeFilter::new(None, None);
        assert!(!filter.passes(&LogEntry::new(0, "no timestamp here")));
    }
}
