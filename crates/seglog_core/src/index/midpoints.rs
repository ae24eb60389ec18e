use super::entry::{IndexEntry, Range};
use super::write_atomic;
use crate::error::{CoreError, CoreResult};
use bytes::{BufMut, BytesMut};
use std::fs;
use std::path::Path;

const RECORD_SIZE: usize = IndexEntry::BYTES + 8;
const TAIL_POSITION: u64 = u64::MAX;

/// First key of one written index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Midpoint {
    /// Smallest key in the block.
    pub key: IndexEntry,
    /// Block position in the segment.
    pub position: u64,
}

/// Sparse, sorted map from keys to the blocks holding them.
///
/// Stored as fixed-size `[entry (20)][position u64]` records, one per
/// block, followed by a tail record carrying the segment's largest key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Midpoints {
    blocks: Vec<Midpoint>,
    last: Option<IndexEntry>,
}

impl Midpoints {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// True before the first block was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Smallest key of the segment.
    #[must_use]
    pub fn first(&self) -> Option<IndexEntry> {
        self.blocks.first().map(|m| m.key)
    }

    /// Largest key of the segment.
    #[must_use]
    pub fn last(&self) -> Option<IndexEntry> {
        self.last
    }

    /// Registers a block spanning `first..=last` written at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfOrder`] if the block starts below the
    /// previous block's last key.
    pub fn push_block(&mut self, first: IndexEntry, last: IndexEntry, position: u64) -> CoreResult<()> {
        if let Some(previous) = self.last {
            if first < previous {
                return Err(CoreError::out_of_order(format!(
                    "block at {position} starts at {first:?}, previous block ended at {previous:?}"
                )));
            }
        }
        if last < first {
            return Err(CoreError::out_of_order(format!(
                "block at {position} ends at {last:?} below its first key {first:?}"
            )));
        }
        self.blocks.push(Midpoint { key: first, position });
        self.last = Some(last);
        Ok(())
    }

    /// Position of the first block that may contain `key`.
    #[must_use]
    pub fn midpoint_for(&self, key: &IndexEntry) -> Option<u64> {
        // A run of equal keys may start in the block before the one whose
        // first key equals `key`.
        let idx = self.blocks.partition_point(|m| m.key < *key);
        self.blocks.get(idx.saturating_sub(1)).map(|m| m.position)
    }

    /// Position of the last block whose first key is at most `key`.
    #[must_use]
    pub fn last_block_for(&self, key: &IndexEntry) -> Option<u64> {
        let idx = self.blocks.partition_point(|m| m.key <= *key);
        idx.checked_sub(1).map(|idx| self.blocks[idx].position)
    }

    /// False if no written block can hold an entry of `range`.
    #[must_use]
    pub fn in_range(&self, range: &Range) -> bool {
        match (self.first(), self.last) {
            (Some(first), Some(last)) => range.start_key() <= last && first < range.end_key(),
            _ => false,
        }
    }

    /// Serialized form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity((self.blocks.len() + 1) * RECORD_SIZE);
        for midpoint in &self.blocks {
            midpoint.key.write_to(&mut buf);
            buf.put_u64_le(midpoint.position);
        }
        if let Some(last) = self.last {
            last.write_to(&mut buf);
            buf.put_u64_le(TAIL_POSITION);
        }
        buf.to_vec()
    }

    /// Parses a serialized table.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a malformed table.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() % RECORD_SIZE != 0 {
            return Err(CoreError::corrupted(format!(
                "midpoint file of {} bytes is not a multiple of {RECORD_SIZE}",
                data.len()
            )));
        }
        let mut records = Vec::with_capacity(data.len() / RECORD_SIZE);
        for chunk in data.chunks_exact(RECORD_SIZE) {
            let key = IndexEntry::read_from(chunk)?;
            let mut position = [0u8; 8];
            position.copy_from_slice(&chunk[IndexEntry::BYTES..]);
            records.push((key, u64::from_le_bytes(position)));
        }

        let mut midpoints = Self::new();
        let Some((last, tail)) = records.pop() else {
            return Ok(midpoints);
        };
        if tail != TAIL_POSITION || records.is_empty() {
            return Err(CoreError::corrupted("midpoint file has no tail record"));
        }
        for window in records.windows(2) {
            if window[1].0 < window[0].0 || window[1].1 <= window[0].1 {
                return Err(CoreError::corrupted("midpoint records are not sorted"));
            }
        }
        if records.last().is_some_and(|(key, _)| last < *key) {
            return Err(CoreError::corrupted("midpoint tail is below the last block"));
        }
        midpoints.blocks = records
            .into_iter()
            .map(|(key, position)| Midpoint { key, position })
            .collect();
        midpoints.last = Some(last);
        Ok(midpoints)
    }

    /// Writes the table to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write(&self, path: &Path) -> CoreResult<()> {
        write_atomic(path, &self.encode())
    }

    /// Reads a table written by [`Midpoints::write`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(path: &Path) -> CoreResult<Self> {
        Self::decode(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(stream: i64, version: i32) -> IndexEntry {
        IndexEntry::key(stream, version)
    }

    fn sample() -> Midpoints {
        let mut midpoints = Midpoints::new();
        midpoints.push_block(key(1, 1), key(3, 2), 64).unwrap();
        midpoints.push_block(key(3, 3), key(5, 1), 200).unwrap();
        midpoints.push_block(key(7, 1), key(9, 4), 400).unwrap();
        midpoints
    }

    #[test]
    fn midpoint_for_finds_covering_block() {
        let midpoints = sample();
        assert_eq!(midpoints.midpoint_for(&key(0, 1)), Some(64));
        assert_eq!(midpoints.midpoint_for(&key(2, 9)), Some(64));
        assert_eq!(midpoints.midpoint_for(&key(3, 3)), Some(64));
        assert_eq!(midpoints.midpoint_for(&key(4, 1)), Some(200));
        assert_eq!(midpoints.midpoint_for(&key(100, 1)), Some(400));
        assert_eq!(Midpoints::new().midpoint_for(&key(1, 1)), None);
    }

    #[test]
    fn last_block_for_seeks_upper_bound() {
        let midpoints = sample();
        assert_eq!(midpoints.last_block_for(&key(3, i32::MAX)), Some(200));
        assert_eq!(midpoints.last_block_for(&key(7, 1)), Some(400));
        assert_eq!(midpoints.last_block_for(&key(0, 5)), None);
    }

    #[test]
    fn in_range_rejects_disjoint_ranges() {
        let midpoints = sample();
        assert!(midpoints.in_range(&Range::all_of(4)));
        assert!(midpoints.in_range(&Range::all_of(9)));
        assert!(!midpoints.in_range(&Range::all_of(0)));
        assert!(!midpoints.in_range(&Range::all_of(10)));
        assert!(!midpoints.in_range(&Range::of(9, 5, 10).unwrap()));
        assert!(!Midpoints::new().in_range(&Range::all_of(1)));
    }

    #[test]
    fn unsorted_blocks_are_rejected() {
        let mut midpoints = sample();
        let result = midpoints.push_block(key(8, 1), key(8, 2), 600);
        assert!(matches!(result, Err(CoreError::OutOfOrder { .. })));
    }

    #[test]
    fn persisted_table_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg-MIDPOINT.dat");
        let midpoints = sample();
        midpoints.write(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * RECORD_SIZE as u64);

        let loaded = Midpoints::load(&path).unwrap();
        assert_eq!(loaded, midpoints);
        assert_eq!(loaded.last(), Some(key(9, 4)));
        assert!(Midpoints::decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn damaged_table_is_rejected() {
        let encoded = sample().encode();
        assert!(Midpoints::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Midpoints::decode(&encoded[..encoded.len() - RECORD_SIZE]).is_err());
    }
}
