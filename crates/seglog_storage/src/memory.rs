//! In-memory storage for testing.

use crate::backend::Storage;
use crate::error::{StorageError, StorageResult};

/// An in-memory store.
///
/// Suitable for unit tests and ephemeral logs that do not need
/// persistence. `delete` simply drops the contents.
///
/// # Example
///
/// ```rust
/// use seglog_storage::{InMemoryStorage, Storage};
///
/// let mut storage = InMemoryStorage::new();
/// storage.write(b"test data").unwrap();
/// assert_eq!(storage.position(), 9);
/// assert_eq!(storage.length(), 9);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    data: Vec<u8>,
    position: u64,
    read_only: bool,
    closed: bool,
}

impl InMemoryStorage {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a zero-filled store of `length` bytes, cursor at 0.
    #[must_use]
    pub fn with_length(length: usize) -> Self {
        Self {
            data: vec![0; length],
            ..Self::default()
        }
    }

    /// Creates a store with pre-existing data, cursor at 0.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Returns a copy of all data in the store.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn check_writable(&self, data: &[u8]) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if data.is_empty() {
            return Err(StorageError::EmptyWrite);
        }
        Ok(())
    }
}

impl Storage for InMemoryStorage {
    fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        let written = self.write_at(self.position, data)?;
        self.position += written as u64;
        Ok(written)
    }

    fn write_at(&mut self, position: u64, data: &[u8]) -> StorageResult<usize> {
        self.check_writable(data)?;
        let start = position as usize;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> StorageResult<usize> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let start = position as usize;
        if start >= self.data.len() {
            return Ok(0);
        }
        let count = (self.data.len() - start).min(buf.len());
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> StorageResult<()> {
        if position > self.length() {
            return Err(StorageError::PositionOutOfBounds {
                position,
                length: self.length(),
            });
        }
        self.position = position;
        Ok(())
    }

    fn truncate(&mut self, length: u64) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.data.resize(length as usize, 0);
        self.position = self.position.min(length);
        Ok(())
    }

    fn mark_read_only(&mut self) {
        self.read_only = true;
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn delete(&mut self) -> StorageResult<()> {
        self.closed = true;
        self.data.clear();
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_write_and_read() {
        let mut storage = InMemoryStorage::new();
        storage.write(b"hello").unwrap();
        storage.write(b" world").unwrap();

        let mut buf = [0u8; 11];
        assert_eq!(storage.read_at(0, &mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn memory_with_length_reads_zeros() {
        let storage = InMemoryStorage::with_length(8);
        let mut buf = [0xAAu8; 4];
        assert_eq!(storage.read_at(4, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0u8; 4]);
        assert_eq!(storage.position(), 0);
    }

    #[test]
    fn memory_cursor_bounds() {
        let mut storage = InMemoryStorage::with_data(vec![1, 2, 3]);
        assert!(storage.set_position(3).is_ok());
        assert!(matches!(
            storage.set_position(4),
            Err(StorageError::PositionOutOfBounds { .. })
        ));
    }

    #[test]
    fn memory_closed_rejects_io() {
        let mut storage = InMemoryStorage::new();
        storage.close().unwrap();
        storage.close().unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(storage.read_at(0, &mut buf), Err(StorageError::Closed)));
    }

    proptest! {
        #[test]
        fn memory_reads_back_every_write(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..16)
        ) {
            let mut storage = InMemoryStorage::new();
            let mut offsets = Vec::new();
            for chunk in &chunks {
                offsets.push(storage.position());
                storage.write(chunk).unwrap();
            }
            for (offset, chunk) in offsets.iter().zip(&chunks) {
                let mut buf = vec![0u8; chunk.len()];
                prop_assert_eq!(storage.read_at(*offset, &mut buf).unwrap(), chunk.len());
                prop_assert_eq!(&buf, chunk);
            }
        }
    }
}
