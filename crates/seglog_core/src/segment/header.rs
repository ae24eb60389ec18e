use super::now_millis;
use crate::error::{CoreError, CoreResult};
use crate::record;
use seglog_storage::Storage;

/// Size of the fixed segment header.
pub const HEADER_SIZE: u64 = 64;

/// Offset of the first record.
pub const LOG_START: u64 = HEADER_SIZE;

/// End-of-log marker written when a segment is rolled.
pub const EOL: [u8; 8] = [0; 8];

const MAGIC: [u8; 4] = *b"SGLG";
const FORMAT_VERSION: u16 = 1;

/// Lifecycle state recorded in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentType {
    /// The live, writable segment.
    LogHead,
    /// A compaction target being written.
    MergeOut,
    /// A rolled segment.
    ReadOnly,
}

impl SegmentType {
    fn to_byte(self) -> u8 {
        match self {
            Self::LogHead => 0,
            Self::MergeOut => 1,
            Self::ReadOnly => 2,
        }
    }

    fn from_byte(byte: u8) -> CoreResult<Self> {
        match byte {
            0 => Ok(Self::LogHead),
            1 => Ok(Self::MergeOut),
            2 => Ok(Self::ReadOnly),
            other => Err(CoreError::corrupted(format!("unknown segment type {other}"))),
        }
    }
}

/// Fixed segment header.
///
/// ```text
/// | magic (4) | version (2) | type (1) | reserved (1) | id (8) | level (4) |
/// | created (8) | entries (8) | log_end (8) | footer_start (8) |
/// | footer_len (8) | crc32 (4) |
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Lifecycle state.
    pub segment_type: SegmentType,
    /// Segment id.
    pub id: u64,
    /// Level.
    pub level: u32,
    /// Creation time (ms since epoch).
    pub created: u64,
    /// Record count, valid once rolled.
    pub entries: u64,
    /// End of record data, valid once rolled.
    pub log_end: u64,
    /// Footer offset, 0 without footer.
    pub footer_start: u64,
    /// Footer length.
    pub footer_len: u64,
}

impl Header {
    /// Creates a header for a new segment.
    #[must_use]
    pub fn new(id: u64, level: u32, segment_type: SegmentType) -> Self {
        Self {
            segment_type,
            id,
            level,
            created: now_millis(),
            entries: 0,
            log_end: LOG_START,
            footer_start: 0,
            footer_len: 0,
        }
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[6] = self.segment_type.to_byte();
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.level.to_le_bytes());
        buf[20..28].copy_from_slice(&self.created.to_le_bytes());
        buf[28..36].copy_from_slice(&self.entries.to_le_bytes());
        buf[36..44].copy_from_slice(&self.log_end.to_le_bytes());
        buf[44..52].copy_from_slice(&self.footer_start.to_le_bytes());
        buf[52..60].copy_from_slice(&self.footer_len.to_le_bytes());
        let crc = record::checksum(&buf[..60]);
        buf[60..64].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes a header.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a bad magic, version or checksum.
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < HEADER_SIZE as usize {
            return Err(CoreError::corrupted(format!(
                "segment header needs {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        if buf[0..4] != MAGIC {
            return Err(CoreError::corrupted("bad segment magic"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != FORMAT_VERSION {
            return Err(CoreError::corrupted(format!(
                "unsupported segment format version {version}"
            )));
        }
        let expected = record::read_u32(buf, 60);
        let actual = record::checksum(&buf[..60]);
        if expected != actual {
            return Err(CoreError::corrupted("segment header checksum mismatch"));
        }
        Ok(Self {
            segment_type: SegmentType::from_byte(buf[6])?,
            id: read_u64(buf, 8),
            level: record::read_u32(buf, 16),
            created: read_u64(buf, 20),
            entries: read_u64(buf, 28),
            log_end: read_u64(buf, 36),
            footer_start: read_u64(buf, 44),
            footer_len: read_u64(buf, 52),
        })
    }

    /// Reads the header at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is missing or damaged.
    pub fn read_from(storage: &dyn Storage) -> CoreResult<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        let read = storage.read_at(0, &mut buf)?;
        Self::decode(&buf[..read])
    }

    /// Writes the header at offset 0 without moving the write cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_to(&self, storage: &mut dyn Storage) -> CoreResult<()> {
        storage.write_at(0, &self.encode())?;
        Ok(())
    }
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use seglog_storage::InMemoryStorage;

    #[test]
    fn header_survives_storage() {
        let mut header = Header::new(7, 2, SegmentType::ReadOnly);
        header.entries = 42;
        header.log_end = 4096;
        header.footer_start = 4104;
        header.footer_len = 8;

        let mut storage = InMemoryStorage::new();
        header.write_to(&mut storage).unwrap();
        assert_eq!(storage.position(), 0);
        assert_eq!(Header::read_from(&storage).unwrap(), header);
    }

    #[test]
    fn damaged_header_rejected() {
        let mut bytes = Header::new(1, 0, SegmentType::LogHead).encode();
        bytes[9] ^= 0x01;
        assert!(Header::decode(&bytes).unwrap_err().is_corruption());

        let mut bad_magic = Header::new(1, 0, SegmentType::LogHead).encode();
        bad_magic[0] = b'X';
        assert!(Header::decode(&bad_magic).is_err());

        assert!(Header::decode(&[0u8; 10]).is_err());
    }
}
