//! Single-owner record reader with one reusable buffer.

use super::ChecksumPolicy;
use crate::error::{CoreError, CoreResult};
use crate::record::{self, HEADER_SIZE, OVERHEAD, TRAILER_SIZE};
use bytes::Bytes;
use seglog_storage::Storage;

/// A single-owner reader with a fixed working buffer.
///
/// Records that fit the buffer are decoded from one positioned read.
/// Larger records fall back to an extending read of exactly the record
/// size; in growing mode the working buffer is replaced by that
/// allocation so the next large record reads in one go.
#[derive(Debug, Default)]
pub struct BufferedReader {
    buffer: Vec<u8>,
    checksum: ChecksumPolicy,
    growing: bool,
}

impl BufferedReader {
    /// Creates a reader with a fixed working buffer.
    #[must_use]
    pub fn new(buffer_size: usize, checksum: ChecksumPolicy) -> Self {
        Self {
            buffer: vec![0; buffer_size.max(OVERHEAD)],
            checksum,
            growing: false,
        }
    }

    /// Creates a reader whose working buffer grows to the largest record
    /// seen.
    #[must_use]
    pub fn growing(initial_size: usize, checksum: ChecksumPolicy) -> Self {
        Self {
            growing: true,
            ..Self::new(initial_size, checksum)
        }
    }

    /// Current working buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Reads the record starting at `position`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a bad checksum, mismatched trailing
    /// length, or a record cut short by the end of the storage.
    pub fn read_forward(&mut self, storage: &dyn Storage, position: u64) -> CoreResult<Bytes> {
        let read = storage.read_at(position, &mut self.buffer)?;
        if read < HEADER_SIZE {
            return Ok(Bytes::new());
        }
        let len = record::read_u32(&self.buffer, 0) as usize;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let total = len + OVERHEAD;
        if position + total as u64 > storage.length() {
            return Err(CoreError::corrupted(format!(
                "record at {position} of {len} bytes runs past the end of the storage"
            )));
        }

        if total <= read {
            return self.decode(position, 0, len);
        }
        let frame = self.extending_read(storage, position, total)?;
        decode_frame(&frame, position, len, self.checksum)
    }

    /// Reads the record that ends right before `position`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`BufferedReader::read_forward`].
    pub fn read_backward(&mut self, storage: &dyn Storage, position: u64) -> CoreResult<Bytes> {
        if position < OVERHEAD as u64 {
            return Ok(Bytes::new());
        }
        // Read the block that ends at `position`; the last four bytes are
        // the trailing length of the previous record.
        let window = (self.buffer.len() as u64).min(position) as usize;
        let block_start = position - window as u64;
        let read = storage.read_at(block_start, &mut self.buffer[..window])?;
        if read < window {
            return Err(CoreError::corrupted(format!(
                "short read of {read} bytes before position {position}"
            )));
        }
        let len = record::read_u32(&self.buffer, window - TRAILER_SIZE) as usize;
        if len == 0 {
            return Err(CoreError::corrupted(format!(
                "zero trailing length before position {position}"
            )));
        }
        let total = len + OVERHEAD;
        if total as u64 > position {
            return Err(CoreError::corrupted(format!(
                "trailing length {len} before position {position} points before the file start"
            )));
        }
        let start = position - total as u64;

        if total <= window {
            return self.decode(start, window - total, len);
        }
        let frame = self.extending_read(storage, start, total)?;
        decode_frame(&frame, start, len, self.checksum)
    }

    fn decode(&self, position: u64, offset: usize, len: usize) -> CoreResult<Bytes> {
        decode_frame(
            &self.buffer[offset..offset + len + OVERHEAD],
            position,
            len,
            self.checksum,
        )
    }

    fn extending_read(
        &mut self,
        storage: &dyn Storage,
        position: u64,
        total: usize,
    ) -> CoreResult<Vec<u8>> {
        let mut frame = vec![0u8; total];
        let read = storage.read_at(position, &mut frame)?;
        if read < total {
            return Err(CoreError::corrupted(format!(
                "record at {position} truncated: {read} of {total} bytes"
            )));
        }
        if self.growing {
            self.buffer = frame.clone();
        }
        Ok(frame)
    }
}

/// Validates one complete frame and copies its payload out.
fn decode_frame(frame: &[u8], position: u64, len: usize, checksum: ChecksumPolicy) -> CoreResult<Bytes> {
    let leading = record::read_u32(frame, 0) as usize;
    let trailing = record::read_u32(frame, HEADER_SIZE + len) as usize;
    if leading != len || trailing != len {
        return Err(CoreError::corrupted(format!(
            "record at {position}: length {leading} does not match trailing length {trailing}"
        )));
    }
    let payload = &frame[HEADER_SIZE..HEADER_SIZE + len];
    if checksum.should_verify() {
        let expected = record::read_u32(frame, 4);
        let actual = record::checksum(payload);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                position,
                expected,
                actual,
            });
        }
    }
    Ok(Bytes::copy_from_slice(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use seglog_storage::InMemoryStorage;

    fn storage_with(records: &[&[u8]]) -> (InMemoryStorage, Vec<u64>) {
        let mut storage = InMemoryStorage::new();
        let mut positions = Vec::new();
        for payload in records {
            let mut frame = BytesMut::new();
            record::encode(payload, &mut frame).unwrap();
            positions.push(storage.position());
            storage.write(&frame).unwrap();
        }
        (storage, positions)
    }

    #[test]
    fn forward_reads_each_record() {
        let (storage, positions) = storage_with(&[b"one", b"two", b"three"]);
        let mut reader = BufferedReader::new(64, ChecksumPolicy::always());

        assert_eq!(&reader.read_forward(&storage, positions[0]).unwrap()[..], b"one");
        assert_eq!(&reader.read_forward(&storage, positions[2]).unwrap()[..], b"three");
        assert!(reader.read_forward(&storage, storage.position()).unwrap().is_empty());
    }

    #[test]
    fn backward_reads_previous_record() {
        let (storage, positions) = storage_with(&[b"one", b"two"]);
        let mut reader = BufferedReader::new(64, ChecksumPolicy::always());

        let end = storage.position();
        assert_eq!(&reader.read_backward(&storage, end).unwrap()[..], b"two");
        assert_eq!(&reader.read_backward(&storage, positions[1]).unwrap()[..], b"one");
        assert!(reader.read_backward(&storage, 0).unwrap().is_empty());
    }

    #[test]
    fn oversized_record_uses_extending_read() {
        let big = vec![42u8; 1000];
        let (storage, positions) = storage_with(&[b"small", &big]);
        let mut reader = BufferedReader::new(32, ChecksumPolicy::always());

        assert_eq!(reader.read_forward(&storage, positions[1]).unwrap().len(), 1000);
        assert_eq!(reader.read_backward(&storage, storage.position()).unwrap().len(), 1000);
        assert_eq!(reader.capacity(), 32);
    }

    #[test]
    fn growing_reader_keeps_larger_buffer() {
        let big = vec![1u8; 500];
        let (storage, positions) = storage_with(&[&big]);
        let mut reader = BufferedReader::growing(32, ChecksumPolicy::always());

        reader.read_forward(&storage, positions[0]).unwrap();
        assert_eq!(reader.capacity(), 500 + OVERHEAD);
    }

    #[test]
    fn zero_length_header_is_end_of_data() {
        let storage = InMemoryStorage::with_length(64);
        let mut reader = BufferedReader::new(64, ChecksumPolicy::always());
        assert!(reader.read_forward(&storage, 0).unwrap().is_empty());
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let (storage, positions) = storage_with(&[b"payload"]);
        let mut data = storage.data();
        data[HEADER_SIZE + 2] ^= 0xFF;
        let corrupted = InMemoryStorage::with_data(data);

        let mut strict = BufferedReader::new(64, ChecksumPolicy::always());
        assert!(matches!(
            strict.read_forward(&corrupted, positions[0]),
            Err(CoreError::ChecksumMismatch { .. })
        ));

        let mut lax = BufferedReader::new(64, ChecksumPolicy::never());
        assert!(lax.read_forward(&corrupted, positions[0]).is_ok());
    }

    #[test]
    fn truncated_record_is_corruption() {
        let (storage, _) = storage_with(&[b"0123456789"]);
        let mut data = storage.data();
        data.truncate(data.len() - 3);
        let truncated = InMemoryStorage::with_data(data);

        let mut reader = BufferedReader::new(64, ChecksumPolicy::always());
        let err = reader.read_forward(&truncated, 0).unwrap_err();
        assert!(err.is_corruption());
    }
}
