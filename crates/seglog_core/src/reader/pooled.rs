use super::{BufferedReader, ChecksumPolicy, DataReader};
use crate::error::{CoreError, CoreResult};
use bytes::Bytes;
use parking_lot::Mutex;
use seglog_storage::Storage;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc::{self, Receiver, SyncSender};

/// A fixed pool of [`BufferedReader`]s shared across threads.
///
/// Readers live in a bounded channel. [`PooledReader::acquire`] blocks
/// until one is free and returns a guard that puts it back on drop, on
/// every exit path.
#[derive(Debug)]
pub struct PooledReader {
    home: SyncSender<BufferedReader>,
    available: Mutex<Receiver<BufferedReader>>,
    size: usize,
}

impl PooledReader {
    /// Creates a pool of `size` readers with `buffer_size` working buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero.
    pub fn new(size: usize, buffer_size: usize, checksum: ChecksumPolicy) -> CoreResult<Self> {
        if size == 0 {
            return Err(CoreError::invalid_config("reader pool size must be at least 1"));
        }
        let (home, available) = mpsc::sync_channel(size);
        for _ in 0..size {
            home.try_send(BufferedReader::new(buffer_size, checksum))
                .map_err(|_| CoreError::invalid_config("reader pool is over capacity"))?;
        }
        Ok(Self {
            home,
            available: Mutex::new(available),
            size,
        })
    }

    /// Number of readers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Checks a reader out, blocking until one is free.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] if the pool was torn down.
    pub fn acquire(&self) -> CoreResult<ReaderGuard<'_>> {
        let reader = self.available.lock().recv().map_err(|_| CoreError::Closed)?;
        Ok(ReaderGuard {
            reader,
            home: &self.home,
        })
    }
}

impl DataReader for PooledReader {
    fn read_forward(&self, storage: &dyn Storage, position: u64) -> CoreResult<Bytes> {
        self.acquire()?.read_forward(storage, position)
    }

    fn read_backward(&self, storage: &dyn Storage, position: u64) -> CoreResult<Bytes> {
        self.acquire()?.read_backward(storage, position)
    }
}

/// A checked-out reader; returned to its pool on drop.
#[derive(Debug)]
pub struct ReaderGuard<'a> {
    reader: BufferedReader,
    home: &'a SyncSender<BufferedReader>,
}

impl Deref for ReaderGuard<'_> {
    type Target = BufferedReader;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl DerefMut for ReaderGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reader
    }
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        // The channel holds exactly `size` slots, so this never blocks.
        let _ = self.home.try_send(std::mem::take(&mut self.reader));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use bytes::BytesMut;
    use seglog_storage::InMemoryStorage;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_returns_reader_to_pool() {
        let pool = PooledReader::new(1, 64, ChecksumPolicy::always()).unwrap();
        {
            let _guard = pool.acquire().unwrap();
        }
        // Would block forever if the first guard had leaked its reader.
        let _again = pool.acquire().unwrap();
    }

    #[test]
    fn zero_sized_pool_rejected() {
        assert!(PooledReader::new(0, 64, ChecksumPolicy::always()).is_err());
    }

    #[test]
    fn concurrent_reads_share_pool() {
        let mut storage = InMemoryStorage::new();
        let mut frame = BytesMut::new();
        record::encode(b"shared", &mut frame).unwrap();
        storage.write(&frame).unwrap();

        let storage = Arc::new(storage);
        let pool = Arc::new(PooledReader::new(2, 64, ChecksumPolicy::always()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = Arc::clone(&storage);
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let payload = pool.read_forward(storage.as_ref(), 0).unwrap();
                        assert_eq!(&payload[..], b"shared");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
