//! Incremental log tailing with live filtered, merged and searched views.
//!
//! Sources form a pipeline: a [`tail::FileLogSource`] (or an
//! [`in_memory::InMemoryLogSource`]) at the bottom, with any number of
//! [`multiline::MultiLineLogSource`], [`filtered::FilteredLogSource`],
//! [`merged::MergedLogSource`] and [`search::LogSourceSearch`] stages stacked
//! on top. Every stage implements
//! the same [`source::LogSource`] contract and does its work inside one
//! periodic task, so views update while the underlying files keep growing.

pub mod entry;
pub mod filter;
pub mod filtered;
pub mod in_memory;
pub mod listener;
pub mod merged;
pub mod modification;
pub mod multiline;
pub mod parser;
pub mod scheduler;
pub mod search;
pub mod section;
pub mod source;
pub mod sync;
pub mod tail;

pub use entry::{LevelFlags, LogEntry, MatchSpan, SearchMatch};
pub use filtered::FilteredLogSource;
pub use in_memory::InMemoryLogSource;
pub use listener::SourceListener;
pub use merged::MergedLogSource;
pub use modification::Modification;
pub use multiline::MultiLineLogSource;
pub use scheduler::{ManualTaskScheduler, TaskScheduler, ThreadTaskScheduler};
pub use search::{LogSourceSearch, SearchListener};
pub use section::LogSection;
pub use source::{LogSource, SourceError, SourceId};
pub use tail::FileLogSource;
