use crate::error::{CoreError, CoreResult};
use bytes::{BufMut, BytesMut};
use seglog_codec::{CodecError, CodecResult, Serializer};
use std::cmp::Ordering;

/// One index record: where version `version` of stream `stream` lives in
/// the indexed log.
///
/// Entries are ordered and compared by `(stream, version)` only; the
/// position is payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexEntry {
    /// Stream hash.
    pub stream: i64,
    /// Version within the stream, starting at 1.
    pub version: i32,
    /// Address of the record in the indexed log.
    pub position: i64,
}

impl IndexEntry {
    /// Encoded size.
    pub const BYTES: usize = 20;

    /// Version reported for streams without entries.
    pub const NO_VERSION: i32 = 0;

    /// Creates an entry.
    #[must_use]
    pub fn new(stream: i64, version: i32, position: i64) -> Self {
        Self {
            stream,
            version,
            position,
        }
    }

    /// A search key for `(stream, version)`.
    #[must_use]
    pub fn key(stream: i64, version: i32) -> Self {
        Self::new(stream, version, 0)
    }

    /// Appends the little-endian encoding to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.put_i64_le(self.stream);
        dst.put_i32_le(self.version);
        dst.put_i64_le(self.position);
    }

    /// Decodes an entry from the first [`IndexEntry::BYTES`] of `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is too short.
    pub fn read_from(data: &[u8]) -> CodecResult<Self> {
        if data.len() < Self::BYTES {
            return Err(CodecError::UnexpectedEof {
                needed: Self::BYTES,
                available: data.len(),
            });
        }
        let mut stream = [0u8; 8];
        let mut version = [0u8; 4];
        let mut position = [0u8; 8];
        stream.copy_from_slice(&data[0..8]);
        version.copy_from_slice(&data[8..12]);
        position.copy_from_slice(&data[12..20]);
        Ok(Self {
            stream: i64::from_le_bytes(stream),
            version: i32::from_le_bytes(version),
            position: i64::from_le_bytes(position),
        })
    }
}

impl PartialEq for IndexEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexEntry {}

impl PartialOrd for IndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stream
            .cmp(&other.stream)
            .then(self.version.cmp(&other.version))
    }
}

/// Fixed-size [`IndexEntry`] encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexEntrySerializer;

impl Serializer<IndexEntry> for IndexEntrySerializer {
    fn write_to(&self, value: &IndexEntry, dst: &mut BytesMut) -> CodecResult<()> {
        value.write_to(dst);
        Ok(())
    }

    fn from_bytes(&self, data: &[u8]) -> CodecResult<IndexEntry> {
        if data.len() != IndexEntry::BYTES {
            return Err(CodecError::decoding(format!(
                "index entry must be {} bytes, got {}",
                IndexEntry::BYTES,
                data.len()
            )));
        }
        IndexEntry::read_from(data)
    }
}

/// Versions `[start, end)` of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    stream: i64,
    start: i32,
    end: i32,
}

impl Range {
    /// Versions `start..end` of `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error unless `0 < start < end`.
    pub fn of(stream: i64, start: i32, end: i32) -> CoreResult<Self> {
        if start <= 0 {
            return Err(CoreError::invalid_argument(format!(
                "range start must be positive, got {start}"
            )));
        }
        if end <= start {
            return Err(CoreError::invalid_argument(format!(
                "range end {end} must be greater than start {start}"
            )));
        }
        Ok(Self { stream, start, end })
    }

    /// Every version of `stream`.
    #[must_use]
    pub fn all_of(stream: i64) -> Self {
        Self {
            stream,
            start: 1,
            end: i32::MAX,
        }
    }

    /// The single version `version` of `stream`.
    pub(crate) fn exactly(stream: i64, version: i32) -> Self {
        Self {
            stream,
            start: version,
            end: version.saturating_add(1),
        }
    }

    /// Stream hash.
    #[must_use]
    pub fn stream(&self) -> i64 {
        self.stream
    }

    /// First version, inclusive.
    #[must_use]
    pub fn start(&self) -> i32 {
        self.start
    }

    /// Last version, exclusive.
    #[must_use]
    pub fn end(&self) -> i32 {
        self.end
    }

    /// Smallest key in the range.
    #[must_use]
    pub fn start_key(&self) -> IndexEntry {
        IndexEntry::key(self.stream, self.start)
    }

    /// Smallest key past the range.
    #[must_use]
    pub fn end_key(&self) -> IndexEntry {
        IndexEntry::key(self.stream, self.end)
    }

    /// True if `entry` falls in the range.
    #[must_use]
    pub fn contains(&self, entry: &IndexEntry) -> bool {
        entry.stream == self.stream && entry.version >= self.start && entry.version < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_twenty_bytes() {
        let entry = IndexEntry::new(-7, 3, 1 << 40);
        let bytes = IndexEntrySerializer.to_bytes(&entry).unwrap();
        assert_eq!(bytes.len(), IndexEntry::BYTES);
        let decoded = IndexEntrySerializer.from_bytes(&bytes).unwrap();
        assert_eq!(decoded.position, 1 << 40);
        assert_eq!(decoded, entry);
        assert!(IndexEntrySerializer.from_bytes(&bytes[..19]).is_err());
    }

    #[test]
    fn ordering_ignores_position() {
        let a = IndexEntry::new(1, 2, 100);
        let b = IndexEntry::new(1, 2, 5);
        assert_eq!(a, b);
        assert!(IndexEntry::new(1, 3, 0) > a);
        assert!(IndexEntry::new(2, 1, 0) > IndexEntry::new(1, i32::MAX, 0));
        assert!(IndexEntry::new(-1, 9, 0) < IndexEntry::new(0, 1, 0));
    }

    #[test]
    fn range_bounds() {
        assert!(Range::of(1, 0, 5).is_err());
        assert!(Range::of(1, 5, 5).is_err());
        let range = Range::of(1, 2, 4).unwrap();
        assert!(!range.contains(&IndexEntry::new(1, 1, 0)));
        assert!(range.contains(&IndexEntry::new(1, 2, 0)));
        assert!(range.contains(&IndexEntry::new(1, 3, 0)));
        assert!(!range.contains(&IndexEntry::new(1, 4, 0)));
        assert!(!range.contains(&IndexEntry::new(2, 3, 0)));

        let all = Range::all_of(9);
        assert_eq!(all.start(), 1);
        assert_eq!(all.end(), i32::MAX);
        assert!(all.start_key() < all.end_key());
    }
}
