use super::entry::IndexEntry;
use crate::segment::{Block, BlockPacking};
use bytes::{BufMut, BytesMut};
use seglog_codec::{CodecError, CodecResult};

const GROUP_HEADER: usize = 12;
const VERSION_SIZE: usize = 12;

/// Packs index blocks per stream:
///
/// ```text
/// | stream i64 | count u32 | (version i32, position i64) x count | ...
/// ```
///
/// Runs of entries of one stream store the stream hash once.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupedPacking;

impl BlockPacking for GroupedPacking {
    fn pack(&self, block: &Block, dst: &mut BytesMut) -> CodecResult<()> {
        let entries = block
            .iter()
            .map(IndexEntry::read_from)
            .collect::<CodecResult<Vec<_>>>()?;
        for group in entries.chunk_by(|a, b| a.stream == b.stream) {
            dst.put_i64_le(group[0].stream);
            dst.put_u32_le(group.len() as u32);
            for entry in group {
                dst.put_i32_le(entry.version);
                dst.put_i64_le(entry.position);
            }
        }
        Ok(())
    }

    fn unpack(&self, payload: &[u8], count: usize) -> CodecResult<Vec<u8>> {
        let mut out = BytesMut::with_capacity(count * IndexEntry::BYTES);
        let mut rest = payload;
        let mut unpacked = 0;
        while !rest.is_empty() {
            if rest.len() < GROUP_HEADER {
                return Err(CodecError::UnexpectedEof {
                    needed: GROUP_HEADER,
                    available: rest.len(),
                });
            }
            let stream = i64::from_le_bytes(take(rest, 0));
            let versions = u32::from_le_bytes(take(rest, 8)) as usize;
            rest = &rest[GROUP_HEADER..];

            let needed = versions * VERSION_SIZE;
            if rest.len() < needed {
                return Err(CodecError::UnexpectedEof {
                    needed,
                    available: rest.len(),
                });
            }
            for version in rest[..needed].chunks_exact(VERSION_SIZE) {
                out.put_i64_le(stream);
                out.put_slice(version);
            }
            rest = &rest[needed..];
            unpacked += versions;
        }
        if unpacked != count {
            return Err(CodecError::decoding(format!(
                "grouped block holds {unpacked} entries, header says {count}"
            )));
        }
        Ok(out.to_vec())
    }
}

fn take<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[at..at + N]);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{BlockCodec, BlockFormat};
    use seglog_codec::{Compression, Serializer};
    use std::sync::Arc;

    fn format() -> BlockFormat {
        BlockFormat::FixedSize {
            entry_size: IndexEntry::BYTES,
        }
    }

    fn block(entries: &[IndexEntry]) -> Block {
        let mut block = Block::new(format(), 4096);
        for entry in entries {
            let mut buf = BytesMut::new();
            entry.write_to(&mut buf);
            block.add(&buf).unwrap();
        }
        block
    }

    fn sample() -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(1, 1, 10),
            IndexEntry::new(1, 2, 20),
            IndexEntry::new(1, 3, 30),
            IndexEntry::new(4, 1, 40),
            IndexEntry::new(9, 7, 50),
            IndexEntry::new(9, 8, 60),
        ]
    }

    #[test]
    fn grouping_stores_stream_once_per_run() {
        let mut packed = BytesMut::new();
        GroupedPacking.pack(&block(&sample()), &mut packed).unwrap();
        assert_eq!(packed.len(), 3 * GROUP_HEADER + 6 * VERSION_SIZE);
        assert!(packed.len() < sample().len() * IndexEntry::BYTES);
    }

    #[test]
    fn codec_with_grouping_restores_entries() {
        let codec = BlockCodec::new(format(), Compression::Snappy).with_packing(Arc::new(GroupedPacking));
        let decoded = codec.from_bytes(&codec.to_bytes(&block(&sample())).unwrap()).unwrap();
        let entries: Vec<IndexEntry> = decoded
            .iter()
            .map(|e| IndexEntry::read_from(e).unwrap())
            .collect();
        assert_eq!(entries, sample());
        assert_eq!(entries[4].position, 50);
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let mut packed = BytesMut::new();
        GroupedPacking.pack(&block(&sample()), &mut packed).unwrap();
        assert!(GroupedPacking.unpack(&packed, 5).is_err());
        assert!(GroupedPacking.unpack(&packed[..packed.len() - 1], 6).is_err());
    }
}
