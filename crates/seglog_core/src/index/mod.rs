//! Disk index: sorted `(stream, version) -> position` entries stored in
//! a leveled log of block segments.
//!
//! Every index segment carries two accelerators, persisted next to the
//! segment file once it is rolled:
//!
//! ```text
//! index-00000007-1a2b3c4d.log             # blocks of sorted IndexEntry
//! index-00000007-1a2b3c4d-MIDPOINT.dat    # first key + position of every block
//! index-00000007-1a2b3c4d-FILTER.dat      # bloom filter over the streams
//! ```
//!
//! A lookup asks the bloom filter first, then binary-searches the
//! midpoints and scans only the blocks that can hold the key.

mod appender;
mod block;
mod bloom;
mod entry;
mod midpoints;
mod segment;

pub use appender::{IndexAppender, IndexIter};
pub use block::GroupedPacking;
pub use bloom::BloomFilter;
pub use entry::{IndexEntry, IndexEntrySerializer, Range};
pub use midpoints::{Midpoint, Midpoints};
pub use segment::{IndexRangeIter, IndexSegment, IndexSegmentFactory};

use crate::error::CoreResult;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Replaces `path` with `data` through a synced temp file and a rename.
fn write_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = Path::new(&temp);

    let mut file = File::create(temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp, path)?;
    Ok(())
}
