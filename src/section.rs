use std::fmt;

/// A contiguous range of log lines: `[index, index + count)`.
///
/// Sections are handles into a source's index space; call
/// [`crate::source::LogSource::get_entries`] to obtain the data they refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogSection {
    /// Index of the first line in this section.
    pub index: usize,
    /// Number of lines in this section.
    pub count: usize,
}

impl LogSection {
    pub fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// The first index past the end of this section.
    pub fn end(&self) -> usize {
        self.index + self.count
    }

    /// The last valid index of this section, or `None` when the section is empty.
    pub fn last_index(&self) -> Option<usize> {
        if self.count == 0 {
            None
        } else {
            Some(self.index + self.count - 1)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Tests if the given index is part of this section.
    pub fn contains(&self, index: usize) -> bool {
        index >= self.index && index < self.end()
    }

    /// Tests if the given index lies at or past the end of this section.
    pub fn is_end_of_section(&self, index: usize) -> bool {
        index >= self.end()
    }

    /// The smallest section containing both `a` and `b`:
    /// index is the minimum of the two indices, end is the maximum of the two ends.
    pub fn minimum_bounding(a: LogSection, b: LogSection) -> LogSection {
        let index = a.index.min(b.index);
        let end = a.end().max(b.end());
        LogSection::new(index, end - index)
    }
}

impl fmt::Display for LogSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, #{}]", self.index, self.count)
    }
}
