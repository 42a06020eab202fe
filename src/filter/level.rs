use super::LogEntryFilter;
use crate::entry::{LevelFlags, LogEntry};

/// Passes entries whose severity intersects the given mask.
///
/// Entries whose severity was never detected (`OTHER`) always pass, regardless
/// of the mask. That matches long-observed behavior consumers depend on: a
/// level filter hides known-but-unwanted severities, it does not hide lines
/// the parser could not classify.
///
/// Reports no match spans: there is no positive span for "this severity
/// passed".
pub struct LevelFilter {
    mask: LevelFlags,
}

impl LevelFilter {
    pub fn new(mask: LevelFlags) -> Self {
        Self { mask }
    }
}

impl LogEntryFilter for LevelFilter {
    fn passes(&self, entry: &LogEntry) -> bool {
        if entry.level.contains(LevelFlags::OTHER) || entry.level.is_empty() {
            return true;
        }
        entry.level.intersects(self.mask)
    }
}
