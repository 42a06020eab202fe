use crate::section::LogSection;
use std::fmt;

/// Describes how a source's content changed since the last observation.
///
/// Modifications are produced and consumed in FIFO order. A `Reset` invalidates
/// every index handed out before it; `Appended` and `Removed` carry the section
/// that was added or retracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    /// The source was cleared (truncated, rotated or deleted); all previously
    /// observed indices are invalid.
    Reset,
    /// The given section was appended to the source.
    Appended(LogSection),
    /// The given section was retracted from the source. Retractions only ever
    /// affect the tail of the index space.
    Removed(LogSection),
    /// One or more source properties (size, timestamps, error state) changed.
    PropertiesChanged,
}

impl Modification {
    pub fn appended(index: usize, count: usize) -> Self {
        Modification::Appended(LogSection::new(index, count))
    }

    pub fn removed(index: usize, count: usize) -> Self {
        Modification::Removed(LogSection::new(index, count))
    }

    /// Splits an `Appended` modification into contiguous chunks of at most
    /// `max_count` lines, in order, covering the same range. Every other
    /// variant is yielded unchanged.
    pub fn split(self, max_count: usize) -> Vec<Modification> {
        assert!(max_count > 0, "max_count must be positive");

        match self {
            Modification::Appended(section) if section.count > max_count => {
                let mut chunks = Vec::with_capacity(section.count.div_ceil(max_count));
                let mut index = section.index;
                let mut remaining = section.count;
                while remaining > 0 {
                    let count = remaining.min(max_count);
                    chunks.push(Modification::appended(index, count));
                    index += count;
                    remaining -= count;
                }
                chunks
            }
            other => vec![other],
        }
    }
}

impl fmt::Display for Modification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modification::Reset => write!(f, "Reset"),
            Modification::Appended(section) => write!(f, "Appended {}", section),
            Modification::Removed(section) => write!(f, "Removed {}", section),
            Modification::PropertiesChanged => write!(f, "Properties Changed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_below_limit() {
        let m = Modification::appended(0, 5);
        assert_eq!(m.split(10), vec![m]);
        assert_eq!(m.split(5), vec![m]);
    }

    #[test]
    fn test_split_exact_chunks() {
        let m = Modification::appended(0, 6);
        assert_eq!(
            m.split(2),
            vec![
                Modification::appended(0, 2),
                Modification::appended(2, 2),
                Modification::appended(4, 2),
            ]
        );
    }

    #[test]
    fn test_split_with_remainder() {
        let m = Modification::appended(10, 7);
        assert_eq!(
            m.split(3),
            vec![
                Modification::appended(10, 3),
                Modification::appended(13, 3),
                Modification::appended(16, 1),
            ]
        );
    }

    #[test]
    fn test_split_preserves_contiguity() {
        let m = Modification::appended(42, 1000);
        let chunks = m.split(64);
        assert_eq!(chunks.len(), 1000usize.div_ceil(64));

        let mut next = 42;
        let mut total = 0;
        for chunk in &chunks {
            let Modification::Appended(section) = chunk else {
                panic!("expected Appended, got {:?}", chunk);
            };
            assert_eq!(section.index, next);
            assert!(section.count <= 64);
            next = section.end();
            total += section.count;
        }
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_split_leaves_other_variants_alone() {
        assert_eq!(Modification::Reset.split(1), vec![Modification::Reset]);
        assert_eq!(
            Modification::removed(0, 100).split(10),
            vec![Modification::removed(0, 100)]
        );
        assert_eq!(
            Modification::PropertiesChanged.split(1),
            vec![Modification::PropertiesChanged]
        );
    }

    #[test]
    #[should_panic(expected = "max_count must be positive")]
    fn test_split_zero_panics() {
        Modification::appended(0, 3).split(0);
    }
}
