//! Segments: bounded append-only files of framed records.
//!
//! Each segment file looks like:
//!
//! ```text
//! | header (64) | record | record | ... | EOL (8 zero bytes) | footer |
//! ```
//!
//! The live (level 0) segment has no EOL or footer yet; rolling writes
//! both, freezes the header and truncates the file to its used length.
//!
//! Three layouts exist, unified by [`LogSegment`]: plain records
//! ([`Segment`]), and variable or fixed-size entries packed into
//! compressed blocks ([`BlockSegment`]).

pub mod block;
mod block_segment;
mod factory;
mod header;
mod plain;

pub use block::{Block, BlockCodec, BlockFormat, BlockPacking};
pub use block_segment::{BlockIterator, BlockObserver, BlockSegment};
pub use factory::{LogSegment, LogSegmentFactory, SegmentFactory, SegmentInit};
pub use header::{Header, SegmentType, EOL, HEADER_SIZE, LOG_START};
pub use plain::{Checkpoint, Segment, SegmentIterator, SegmentState};

use crate::error::CoreResult;

/// Iteration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Oldest to newest.
    Forward,
    /// Newest to oldest.
    Backward,
}

/// A resumable record iterator.
///
/// Returning `None` means "nothing more right now": on a live segment a
/// later call may yield records appended in the meantime.
pub trait LogIterator<T>: Iterator<Item = CoreResult<T>> + Send {
    /// Address of the next record this iterator will read.
    fn address(&self) -> u64;
}

/// Record-type independent view of a segment.
pub trait SegmentInfo: Send + Sync {
    /// Unique, monotonically assigned segment id.
    fn id(&self) -> u64;

    /// File name.
    fn name(&self) -> &str;

    /// Current level; 0 is the live segment.
    fn level(&self) -> u32;

    /// Creation time in milliseconds since the Unix epoch.
    fn created(&self) -> u64;

    /// Number of records.
    fn entries(&self) -> u64;

    /// Address the next appended record will get.
    fn position(&self) -> u64;

    /// Bytes of record data.
    fn size(&self) -> u64;

    /// True once rolled.
    fn is_read_only(&self) -> bool;

    /// Forces pending data to storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or sync fails.
    fn flush(&self) -> CoreResult<()>;

    /// Freezes the segment at `level`.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is already read-only or I/O fails.
    fn roll(&self, level: u32) -> CoreResult<()>;

    /// Schedules the segment files for removal once the last handle to
    /// the segment is dropped.
    fn delete(&self);

    /// Flushes and releases the storage. Double close is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while releasing.
    fn close(&self) -> CoreResult<()>;
}

/// A segment holding records of type `T`.
pub trait Log<T>: SegmentInfo {
    /// Appends a record and returns its address within the segment.
    ///
    /// # Errors
    ///
    /// Fails if the segment is read-only or closed, or on I/O errors.
    fn append(&self, record: &T) -> CoreResult<u64>;

    /// Reads the record at `position`, `None` if there is no data there.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the record is damaged.
    fn get(&self, position: u64) -> CoreResult<Option<T>>;

    /// Iterates from the start (forward) or end (backward).
    ///
    /// # Errors
    ///
    /// Returns an error if the segment is closed.
    fn iter(&self, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>>;

    /// Iterates from `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is outside the segment.
    fn iter_from(&self, position: u64, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>>;
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
