//! Blocks: batches of serialized entries stored as one segment record.
//!
//! An encoded block is:
//!
//! ```text
//! | count (4) | compression tag (1) | compressed payload |
//! ```
//!
//! The variable-size payload is the per-entry length table followed by
//! the concatenated entries. The fixed-size payload is just the entries,
//! unless a [`BlockPacking`] rewrites it.

use crate::record;
use bytes::{BufMut, Bytes, BytesMut};
use seglog_codec::{CodecError, CodecResult, Compression, Serializer};
use std::sync::Arc;

/// Address bits used for the entry index inside a block.
pub const ENTRY_BITS: u32 = 12;

/// Maximum entries per block.
pub const MAX_BLOCK_ENTRIES: usize = 1 << ENTRY_BITS;

const BLOCK_HEADER_SIZE: usize = 5;

/// Entry layout inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFormat {
    /// Entries of any size, with a length table.
    Variable,
    /// Entries of exactly `entry_size` bytes.
    FixedSize {
        /// Size of every entry.
        entry_size: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Contents {
    Open(BytesMut),
    Sealed(Bytes),
}

impl Contents {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Open(buf) => buf,
            Self::Sealed(buf) => buf,
        }
    }
}

/// A batch of entries.
///
/// Blocks built with [`Block::new`] accept entries until their byte
/// budget or the entry cap is reached. Decoded blocks are immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    format: BlockFormat,
    contents: Contents,
    /// Start offset of each entry; unused for fixed-size blocks.
    offsets: Vec<u32>,
    count: usize,
    max_size: usize,
}

impl Block {
    /// Creates an empty, writable block with a `max_size` byte budget.
    #[must_use]
    pub fn new(format: BlockFormat, max_size: usize) -> Self {
        Self {
            format,
            // +10% so the entry that crosses the budget rarely reallocates
            contents: Contents::Open(BytesMut::with_capacity(max_size + max_size / 10)),
            offsets: Vec::new(),
            count: 0,
            max_size: max_size.max(1),
        }
    }

    /// Adds one serialized entry and returns true once the block is full.
    ///
    /// An entry larger than the remaining budget is still accepted.
    ///
    /// # Errors
    ///
    /// Fails on a decoded block, a full block, or an entry of the wrong
    /// size for a fixed-size block.
    pub fn add(&mut self, entry: &[u8]) -> CodecResult<bool> {
        if self.count >= MAX_BLOCK_ENTRIES {
            return Err(CodecError::encoding(format!(
                "block already holds {MAX_BLOCK_ENTRIES} entries"
            )));
        }
        let Contents::Open(buf) = &mut self.contents else {
            return Err(CodecError::encoding("decoded blocks are read-only"));
        };
        match self.format {
            BlockFormat::FixedSize { entry_size } if entry.len() != entry_size => {
                return Err(CodecError::encoding(format!(
                    "entry of {} bytes in a {entry_size} byte block",
                    entry.len()
                )));
            }
            BlockFormat::FixedSize { .. } => {}
            BlockFormat::Variable => {
                let offset = u32::try_from(buf.len())
                    .map_err(|_| CodecError::encoding("block exceeds 4 GiB"))?;
                self.offsets.push(offset);
            }
        }
        buf.put_slice(entry);
        self.count += 1;
        Ok(self.is_full())
    }

    /// Takes back the newest entry of a writable block.
    pub(crate) fn pop(&mut self) -> bool {
        let Contents::Open(buf) = &mut self.contents else {
            return false;
        };
        let Some(last) = self.count.checked_sub(1) else {
            return false;
        };
        let start = match self.format {
            BlockFormat::FixedSize { entry_size } => last * entry_size,
            BlockFormat::Variable => self.offsets.pop().map_or(0, |offset| offset as usize),
        };
        buf.truncate(start);
        self.count = last;
        true
    }

    /// True once the byte budget or entry cap is reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count >= MAX_BLOCK_ENTRIES || self.len() >= self.max_size
    }

    /// Number of entries.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.count
    }

    /// True without entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Bytes of entry data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contents.as_slice().len()
    }

    /// Entry at `idx`.
    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        if idx >= self.count {
            return None;
        }
        let data = self.contents.as_slice();
        let (start, end) = match self.format {
            BlockFormat::FixedSize { entry_size } => (idx * entry_size, (idx + 1) * entry_size),
            BlockFormat::Variable => {
                let start = self.offsets[idx] as usize;
                let end = self
                    .offsets
                    .get(idx + 1)
                    .map_or(data.len(), |next| *next as usize);
                (start, end)
            }
        };
        data.get(start..end)
    }

    /// First entry.
    #[must_use]
    pub fn first(&self) -> Option<&[u8]> {
        self.get(0)
    }

    /// Last entry.
    #[must_use]
    pub fn last(&self) -> Option<&[u8]> {
        self.count.checked_sub(1).and_then(|idx| self.get(idx))
    }

    /// Entries in order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &[u8]> + '_ {
        (0..self.count).filter_map(move |idx| self.get(idx))
    }

    /// Entry format.
    #[must_use]
    pub fn format(&self) -> BlockFormat {
        self.format
    }

    fn sealed(format: BlockFormat, data: Bytes, offsets: Vec<u32>, count: usize) -> Self {
        Self {
            format,
            max_size: data.len().max(1),
            contents: Contents::Sealed(data),
            offsets,
            count,
        }
    }
}

/// Rewrites fixed-size block payloads into a denser layout.
pub trait BlockPacking: Send + Sync {
    /// Encodes the entries of `block` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be packed.
    fn pack(&self, block: &Block, dst: &mut BytesMut) -> CodecResult<()>;

    /// Decodes a packed payload of `count` entries back to concatenated
    /// fixed-size entries.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed payload.
    fn unpack(&self, payload: &[u8], count: usize) -> CodecResult<Vec<u8>>;
}

/// Serializer turning blocks into compressed segment records.
#[derive(Clone)]
pub struct BlockCodec {
    format: BlockFormat,
    compression: Compression,
    packing: Option<Arc<dyn BlockPacking>>,
}

impl std::fmt::Debug for BlockCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCodec")
            .field("format", &self.format)
            .field("compression", &self.compression)
            .field("packed", &self.packing.is_some())
            .finish()
    }
}

impl BlockCodec {
    /// Creates a codec for blocks of `format`.
    #[must_use]
    pub fn new(format: BlockFormat, compression: Compression) -> Self {
        Self {
            format,
            compression,
            packing: None,
        }
    }

    /// Uses `packing` for the block payload.
    #[must_use]
    pub fn with_packing(mut self, packing: Arc<dyn BlockPacking>) -> Self {
        self.packing = Some(packing);
        self
    }

    /// Block format.
    #[must_use]
    pub fn format(&self) -> BlockFormat {
        self.format
    }
}

impl Serializer<Block> for BlockCodec {
    fn write_to(&self, block: &Block, dst: &mut BytesMut) -> CodecResult<()> {
        let mut payload = BytesMut::with_capacity(block.len() + block.entries() * 4);
        match (&self.packing, self.format) {
            (Some(packing), _) => packing.pack(block, &mut payload)?,
            (None, BlockFormat::Variable) => {
                for entry in block.iter() {
                    payload.put_u32_le(entry.len() as u32);
                }
                payload.put_slice(block.contents.as_slice());
            }
            (None, BlockFormat::FixedSize { .. }) => payload.put_slice(block.contents.as_slice()),
        }
        let compressed = self.compression.compress(&payload)?;
        dst.reserve(BLOCK_HEADER_SIZE + compressed.len());
        dst.put_u32_le(block.entries() as u32);
        dst.put_u8(self.compression.tag());
        dst.put_slice(&compressed);
        Ok(())
    }

    fn from_bytes(&self, data: &[u8]) -> CodecResult<Block> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(CodecError::UnexpectedEof {
                needed: BLOCK_HEADER_SIZE,
                available: data.len(),
            });
        }
        let count = record::read_u32(data, 0) as usize;
        if count > MAX_BLOCK_ENTRIES {
            return Err(CodecError::decoding(format!("block claims {count} entries")));
        }
        let compression = Compression::from_tag(data[4])?;
        let mut payload = compression.decompress(&data[BLOCK_HEADER_SIZE..])?;
        if let Some(packing) = &self.packing {
            payload = packing.unpack(&payload, count)?;
        }

        match self.format {
            BlockFormat::FixedSize { entry_size } => {
                if payload.len() != count * entry_size {
                    return Err(CodecError::decoding(format!(
                        "fixed block of {count} x {entry_size} bytes has {} bytes",
                        payload.len()
                    )));
                }
                Ok(Block::sealed(self.format, Bytes::from(payload), Vec::new(), count))
            }
            BlockFormat::Variable => {
                let table = count * 4;
                if payload.len() < table {
                    return Err(CodecError::UnexpectedEof {
                        needed: table,
                        available: payload.len(),
                    });
                }
                let mut offsets = Vec::with_capacity(count);
                let mut offset = 0u32;
                for idx in 0..count {
                    offsets.push(offset);
                    offset = offset.saturating_add(record::read_u32(&payload, idx * 4));
                }
                let data = Bytes::from(payload).slice(table..);
                if offset as usize != data.len() {
                    return Err(CodecError::decoding(format!(
                        "block length table sums to {offset}, data has {} bytes",
                        data.len()
                    )));
                }
                Ok(Block::sealed(self.format, data, offsets, count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variable_block(entries: &[&[u8]]) -> Block {
        let mut block = Block::new(BlockFormat::Variable, 1024);
        for entry in entries {
            block.add(entry).unwrap();
        }
        block
    }

    #[test]
    fn variable_entries_random_access() {
        let block = variable_block(&[b"a", b"", b"ccc"]);
        assert_eq!(block.entries(), 3);
        assert_eq!(block.get(0), Some(&b"a"[..]));
        assert_eq!(block.get(1), Some(&b""[..]));
        assert_eq!(block.last(), Some(&b"ccc"[..]));
        assert_eq!(block.get(3), None);
    }

    #[test]
    fn add_reports_full_at_budget() {
        let mut block = Block::new(BlockFormat::Variable, 10);
        assert!(!block.add(b"12345").unwrap());
        assert!(block.add(b"123456789").unwrap());
        assert_eq!(block.len(), 14);
    }

    #[test]
    fn pop_takes_back_newest_entry() {
        let mut block = variable_block(&[b"a", b"bb"]);
        assert!(block.pop());
        assert_eq!(block.entries(), 1);
        assert_eq!(block.len(), 1);
        block.add(b"cc").unwrap();
        assert_eq!(block.last(), Some(&b"cc"[..]));

        assert!(block.pop());
        assert!(block.pop());
        assert!(!block.pop());
        assert!(block.is_empty());
    }

    #[test]
    fn oversized_entry_is_kept() {
        let mut block = Block::new(BlockFormat::Variable, 4);
        let big = vec![7u8; 100];
        assert!(block.add(&big).unwrap());
        assert_eq!(block.first(), Some(&big[..]));
    }

    #[test]
    fn entry_cap_fills_block() {
        let mut block = Block::new(BlockFormat::FixedSize { entry_size: 1 }, 1 << 20);
        for _ in 0..MAX_BLOCK_ENTRIES - 1 {
            assert!(!block.add(b"x").unwrap());
        }
        assert!(block.add(b"x").unwrap());
        assert!(block.add(b"x").is_err());
    }

    #[test]
    fn fixed_size_rejects_wrong_length() {
        let mut block = Block::new(BlockFormat::FixedSize { entry_size: 4 }, 64);
        block.add(b"abcd").unwrap();
        assert!(block.add(b"abc").is_err());
        assert_eq!(block.get(0), Some(&b"abcd"[..]));
    }

    #[test]
    fn codec_restores_variable_block() {
        let codec = BlockCodec::new(BlockFormat::Variable, Compression::Snappy);
        let block = variable_block(&[b"first", b"second", b"third"]);
        let bytes = codec.to_bytes(&block).unwrap();

        let decoded = codec.from_bytes(&bytes).unwrap();
        let entries: Vec<&[u8]> = decoded.iter().collect();
        assert_eq!(entries, vec![&b"first"[..], b"second", b"third"]);
    }

    #[test]
    fn decoded_block_is_read_only() {
        let codec = BlockCodec::new(BlockFormat::FixedSize { entry_size: 2 }, Compression::None);
        let mut block = Block::new(BlockFormat::FixedSize { entry_size: 2 }, 64);
        block.add(b"ab").unwrap();
        let mut decoded = codec.from_bytes(&codec.to_bytes(&block).unwrap()).unwrap();
        assert!(decoded.add(b"cd").is_err());
    }

    #[test]
    fn codec_rejects_inconsistent_fixed_block() {
        let codec = BlockCodec::new(BlockFormat::FixedSize { entry_size: 4 }, Compression::None);
        let mut bytes = BytesMut::new();
        bytes.put_u32_le(3);
        bytes.put_u8(Compression::None.tag());
        bytes.put_slice(b"too short");
        assert!(codec.from_bytes(&bytes).is_err());
        assert!(codec.from_bytes(&[1, 0]).is_err());
    }
}
