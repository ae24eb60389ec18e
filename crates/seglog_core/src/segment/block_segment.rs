use super::block::{Block, BlockCodec, ENTRY_BITS};
use super::header::{SegmentType, LOG_START};
use super::plain::Segment;
use super::{Direction, Log, LogIterator, SegmentInfo};
use crate::error::{CoreError, CoreResult};
use crate::reader::DataReader;
use parking_lot::Mutex;
use seglog_codec::Serializer;
use seglog_storage::Storage;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const ENTRY_MASK: u64 = (1 << ENTRY_BITS) - 1;

fn address(block_position: u64, idx: usize) -> u64 {
    (block_position << ENTRY_BITS) | idx as u64
}

fn split(address: u64) -> (u64, usize) {
    (address >> ENTRY_BITS, (address & ENTRY_MASK) as usize)
}

/// Gets told about every block written to a [`BlockSegment`].
pub trait BlockObserver: Send + Sync {
    /// Called after `block` was stored at `position`.
    ///
    /// # Errors
    ///
    /// An error fails the append or flush that wrote the block.
    fn on_block(&self, position: u64, block: &Block) -> CoreResult<()>;
}

/// A segment that packs entries into compressed blocks.
///
/// Entries collect in an in-memory block that is written as one segment
/// record once full, on flush and on roll. Entry addresses are
/// `(block_position << 12) | index`.
pub struct BlockSegment<T> {
    delegate: Segment<Block>,
    pending: Mutex<Block>,
    codec: BlockCodec,
    max_block_size: usize,
    serializer: Arc<dyn Serializer<T>>,
    entries: AtomicU64,
    observer: Option<Arc<dyn BlockObserver>>,
}

impl<T> fmt::Debug for BlockSegment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockSegment")
            .field("delegate", &self.delegate)
            .field("codec", &self.codec)
            .field("entries", &self.entries.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send + 'static> BlockSegment<T> {
    /// Creates an empty block segment in `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        storage: Box<dyn Storage>,
        serializer: Arc<dyn Serializer<T>>,
        codec: BlockCodec,
        max_block_size: usize,
        reader: Arc<dyn DataReader>,
        id: u64,
        level: u32,
        segment_type: SegmentType,
    ) -> CoreResult<Self> {
        let delegate = Segment::create(
            storage,
            Arc::new(codec.clone()),
            reader,
            id,
            level,
            segment_type,
        )?;
        Ok(Self::from_parts(delegate, serializer, codec, max_block_size, 0))
    }

    /// Opens a block segment written earlier.
    ///
    /// # Errors
    ///
    /// Returns an error if the segment or one of its blocks is damaged.
    pub fn open(
        storage: Box<dyn Storage>,
        serializer: Arc<dyn Serializer<T>>,
        codec: BlockCodec,
        max_block_size: usize,
        reader: Arc<dyn DataReader>,
    ) -> CoreResult<Self> {
        let delegate = Segment::open(storage, Arc::new(codec.clone()), reader)?;
        let from_footer = if delegate.is_read_only() {
            delegate.footer()?.and_then(|footer| {
                <[u8; 8]>::try_from(footer.as_ref())
                    .ok()
                    .map(u64::from_le_bytes)
            })
        } else {
            None
        };
        let entries = match from_footer {
            Some(entries) => entries,
            None => {
                let mut entries = 0;
                for block in delegate.iter(Direction::Forward)? {
                    entries += block?.entries() as u64;
                }
                entries
            }
        };
        Ok(Self::from_parts(delegate, serializer, codec, max_block_size, entries))
    }

    fn from_parts(
        delegate: Segment<Block>,
        serializer: Arc<dyn Serializer<T>>,
        codec: BlockCodec,
        max_block_size: usize,
        entries: u64,
    ) -> Self {
        Self {
            pending: Mutex::new(Block::new(codec.format(), max_block_size)),
            delegate,
            codec,
            max_block_size,
            serializer,
            entries: AtomicU64::new(entries),
            observer: None,
        }
    }

    /// Registers the observer notified of every written block.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn BlockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Feeds every written block to `observer`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns the first read or observer error.
    pub fn replay(&self, observer: &dyn BlockObserver) -> CoreResult<()> {
        let mut blocks = self.delegate.iter(Direction::Forward)?;
        loop {
            let position = blocks.address();
            match blocks.next() {
                Some(block) => observer.on_block(position, &block?)?,
                None => return Ok(()),
            }
        }
    }

    /// Reads the written block at `position`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a damaged block.
    pub fn read_block(&self, position: u64) -> CoreResult<Option<Block>> {
        self.delegate.get(position)
    }

    /// Iterates written blocks from `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is outside the segment.
    pub fn blocks_from(
        &self,
        position: u64,
        direction: Direction,
    ) -> CoreResult<Box<dyn LogIterator<Block>>> {
        self.delegate.iter_from(position, direction)
    }

    /// Runs `f` on the not yet written block and the position it will be
    /// written at.
    pub fn with_pending<R>(&self, f: impl FnOnce(u64, &Block) -> R) -> R {
        let pending = self.pending.lock();
        f(self.delegate.position(), &pending)
    }

    /// Number of entries not yet written to storage.
    #[must_use]
    pub fn pending_entries(&self) -> usize {
        self.pending.lock().entries()
    }

    /// Decodes one block entry.
    ///
    /// # Errors
    ///
    /// Returns a codec error for a malformed entry.
    pub fn decode(&self, entry: &[u8]) -> CoreResult<T> {
        Ok(self.serializer.from_bytes(entry)?)
    }

    /// Footer blob of the underlying segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the footer cannot be read.
    pub fn footer(&self) -> CoreResult<Option<bytes::Bytes>> {
        self.delegate.footer()
    }

    fn write_pending(&self, pending: &mut Block) -> CoreResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let position = self.delegate.append(pending)?;
        let block = std::mem::replace(pending, Block::new(self.codec.format(), self.max_block_size));
        if let Some(observer) = &self.observer {
            observer.on_block(position, &block)?;
        }
        Ok(())
    }

    fn entry_at(&self, block: &Block, idx: usize) -> CoreResult<Option<T>> {
        block.get(idx).map(|entry| self.decode(entry)).transpose()
    }

    fn iterator(&self, direction: Direction) -> CoreResult<BlockIterator<T>> {
        Ok(BlockIterator {
            blocks: self.delegate.iter(direction)?,
            serializer: Arc::clone(&self.serializer),
            direction,
            current: None,
            start: None,
            failed: false,
        })
    }
}

impl<T: Send + 'static> SegmentInfo for BlockSegment<T> {
    fn id(&self) -> u64 {
        self.delegate.id()
    }

    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn level(&self) -> u32 {
        self.delegate.level()
    }

    fn created(&self) -> u64 {
        self.delegate.created()
    }

    fn entries(&self) -> u64 {
        self.entries.load(Ordering::Acquire)
    }

    fn position(&self) -> u64 {
        let pending = self.pending.lock();
        address(self.delegate.position(), pending.entries())
    }

    fn size(&self) -> u64 {
        self.delegate.size() + self.pending.lock().len() as u64
    }

    fn is_read_only(&self) -> bool {
        self.delegate.is_read_only()
    }

    fn flush(&self) -> CoreResult<()> {
        let mut pending = self.pending.lock();
        self.write_pending(&mut pending)?;
        self.delegate.flush()
    }

    fn roll(&self, level: u32) -> CoreResult<()> {
        let mut pending = self.pending.lock();
        self.write_pending(&mut pending)?;
        let footer = self.entries().to_le_bytes();
        self.delegate.roll_with_footer(level, Some(&footer))
    }

    fn delete(&self) {
        self.delegate.delete();
    }

    fn close(&self) -> CoreResult<()> {
        if !self.delegate.is_read_only() {
            let mut pending = self.pending.lock();
            if let Err(e) = self.write_pending(&mut pending) {
                tracing::warn!(segment = %self.name(), error = %e, "failed to write pending block on close");
            }
        }
        self.delegate.close()
    }
}

impl<T: Send + 'static> Log<T> for BlockSegment<T> {
    fn append(&self, record: &T) -> CoreResult<u64> {
        let entry = self.serializer.to_bytes(record)?;
        let mut pending = self.pending.lock();
        if self.delegate.is_read_only() {
            return Err(CoreError::read_only(self.name().to_string()));
        }
        let address = address(self.delegate.position(), pending.entries());
        let full = pending.add(&entry)?;
        let written = if full { self.write_pending(&mut pending) } else { Ok(()) };
        if written.is_err() && !pending.is_empty() {
            // the block never reached storage
            pending.pop();
        } else {
            self.entries.fetch_add(1, Ordering::AcqRel);
        }
        written.map(|()| address)
    }

    fn get(&self, position: u64) -> CoreResult<Option<T>> {
        let (block_position, idx) = split(position);
        if block_position < self.delegate.position() {
            return match self.delegate.get(block_position)? {
                Some(block) => self.entry_at(&block, idx),
                None => Ok(None),
            };
        }
        let pending = self.pending.lock();
        // The pending block may have been written since the check above.
        if block_position < self.delegate.position() {
            drop(pending);
            return self.get(position);
        }
        if block_position == self.delegate.position() {
            return self.entry_at(&pending, idx);
        }
        Ok(None)
    }

    fn iter(&self, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>> {
        Ok(Box::new(self.iterator(direction)?))
    }

    fn iter_from(&self, position: u64, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>> {
        let (block_position, idx) = split(position);
        let frontier = self.delegate.position();
        if block_position < LOG_START || block_position > frontier {
            return Err(CoreError::invalid_argument(format!(
                "address {position} outside of segment {}",
                self.name()
            )));
        }
        let blocks = self.delegate.iter_from(block_position, direction)?;
        let mut iter = BlockIterator {
            blocks,
            serializer: Arc::clone(&self.serializer),
            direction,
            current: None,
            start: None,
            failed: false,
        };
        match direction {
            Direction::Forward => iter.start = Some((block_position, idx)),
            Direction::Backward => {
                if idx > 0 && block_position < frontier {
                    if let Some(block) = self.delegate.get(block_position)? {
                        iter.current = Some(CurrentBlock {
                            position: block_position,
                            next: idx.min(block.entries()),
                            block,
                        });
                    }
                }
            }
        }
        Ok(Box::new(iter))
    }
}

struct CurrentBlock {
    position: u64,
    block: Block,
    /// Forward: index of the next entry. Backward: entries left.
    next: usize,
}

/// Iterator over the entries of a [`BlockSegment`].
///
/// Only written blocks are visible; entries still in the pending block
/// show up once it is flushed.
pub struct BlockIterator<T> {
    blocks: Box<dyn LogIterator<Block>>,
    serializer: Arc<dyn Serializer<T>>,
    direction: Direction,
    current: Option<CurrentBlock>,
    /// Entry to start at once the block at that position is loaded.
    start: Option<(u64, usize)>,
    failed: bool,
}

impl<T> BlockIterator<T> {
    fn next_entry(&mut self) -> CoreResult<Option<T>> {
        loop {
            if let Some(current) = &mut self.current {
                let idx = match self.direction {
                    Direction::Forward if current.next < current.block.entries() => {
                        current.next += 1;
                        Some(current.next - 1)
                    }
                    Direction::Backward if current.next > 0 => {
                        current.next -= 1;
                        Some(current.next)
                    }
                    _ => None,
                };
                if let Some(idx) = idx {
                    let entry = current.block.get(idx).ok_or_else(|| {
                        CoreError::corrupted(format!(
                            "block at {} has no entry {idx}",
                            current.position
                        ))
                    })?;
                    return Ok(Some(self.serializer.from_bytes(entry)?));
                }
            }

            let before = self.blocks.address();
            let Some(block) = self.blocks.next().transpose()? else {
                return Ok(None);
            };
            self.current = Some(match self.direction {
                Direction::Forward => {
                    let next = match self.start.take() {
                        Some((position, idx)) if position == before => idx,
                        _ => 0,
                    };
                    CurrentBlock {
                        position: before,
                        block,
                        next,
                    }
                }
                Direction::Backward => CurrentBlock {
                    position: self.blocks.address(),
                    next: block.entries(),
                    block,
                },
            });
        }
    }
}

impl<T> Iterator for BlockIterator<T> {
    type Item = CoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.next_entry().transpose();
        if matches!(result, Some(Err(_))) {
            self.failed = true;
        }
        result
    }
}

impl<T: Send> LogIterator<T> for BlockIterator<T> {
    fn address(&self) -> u64 {
        if let Some(current) = &self.current {
            let remaining = match self.direction {
                Direction::Forward => current.next < current.block.entries(),
                Direction::Backward => current.next > 0,
            };
            if remaining {
                return address(current.position, current.next);
            }
        }
        match self.start {
            Some((position, idx)) => address(position, idx),
            None => address(self.blocks.address(), 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{ChecksumPolicy, PooledReader};
    use crate::segment::BlockFormat;
    use seglog_codec::{Compression, StringSerializer, U64Serializer};
    use seglog_storage::{DirectStorage, InMemoryStorage, MmapStorage, StorageError};
    use std::path::Path;

    fn reader() -> Arc<dyn DataReader> {
        Arc::new(PooledReader::new(2, 256, ChecksumPolicy::always()).unwrap())
    }

    fn codec() -> BlockCodec {
        BlockCodec::new(BlockFormat::Variable, Compression::Snappy)
    }

    fn memory_segment(max_block_size: usize) -> BlockSegment<String> {
        BlockSegment::create(
            Box::new(InMemoryStorage::new()),
            Arc::new(StringSerializer),
            codec(),
            max_block_size,
            reader(),
            1,
            0,
            SegmentType::LogHead,
        )
        .unwrap()
    }

    fn open(path: &Path) -> BlockSegment<String> {
        BlockSegment::open(
            Box::new(DirectStorage::open(path).unwrap()),
            Arc::new(StringSerializer),
            codec(),
            32,
            reader(),
        )
        .unwrap()
    }

    fn records(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("entry-{i:03}")).collect()
    }

    fn collect(iter: Box<dyn LogIterator<String>>) -> Vec<String> {
        iter.map(Result::unwrap).collect()
    }

    #[test]
    fn entries_readable_before_and_after_block_write() {
        let segment = memory_segment(32);
        let first = segment.append(&"a".to_string()).unwrap();
        assert_eq!(segment.get(first).unwrap().as_deref(), Some("a"));
        assert_eq!(segment.pending_entries(), 1);

        let addresses: Vec<u64> = records(10)
            .iter()
            .map(|r| segment.append(r).unwrap())
            .collect();
        segment.flush().unwrap();
        assert_eq!(segment.pending_entries(), 0);
        assert_eq!(segment.get(first).unwrap().as_deref(), Some("a"));
        for (address, record) in addresses.iter().zip(records(10)) {
            assert_eq!(segment.get(*address).unwrap(), Some(record));
        }
        assert_eq!(segment.entries(), 11);
    }

    #[test]
    fn addresses_pack_block_position_and_index() {
        let segment = memory_segment(1024);
        let a = segment.append(&"a".to_string()).unwrap();
        let b = segment.append(&"b".to_string()).unwrap();
        assert_eq!(split(a), (LOG_START, 0));
        assert_eq!(split(b), (LOG_START, 1));
    }

    #[test]
    fn pending_entries_not_iterated_until_flushed() {
        let segment = memory_segment(1024);
        segment.append(&"a".to_string()).unwrap();
        assert!(collect(segment.iter(Direction::Forward).unwrap()).is_empty());
        segment.flush().unwrap();
        assert_eq!(collect(segment.iter(Direction::Forward).unwrap()), vec!["a"]);
    }

    #[test]
    fn forward_and_backward_are_mirrors() {
        let segment = memory_segment(40);
        for record in records(50) {
            segment.append(&record).unwrap();
        }
        segment.flush().unwrap();

        let forward = collect(segment.iter(Direction::Forward).unwrap());
        let mut backward = collect(segment.iter(Direction::Backward).unwrap());
        backward.reverse();
        assert_eq!(forward, records(50));
        assert_eq!(backward, records(50));
    }

    #[test]
    fn iter_from_mid_block() {
        let segment = memory_segment(1024);
        let addresses: Vec<u64> = records(5)
            .iter()
            .map(|r| segment.append(r).unwrap())
            .collect();
        segment.flush().unwrap();

        let forward = collect(segment.iter_from(addresses[2], Direction::Forward).unwrap());
        assert_eq!(forward, records(5)[2..].to_vec());

        let backward = collect(segment.iter_from(addresses[2], Direction::Backward).unwrap());
        assert_eq!(backward, vec!["entry-001", "entry-000"]);
    }

    #[test]
    fn iterator_position_resumes() {
        let segment = memory_segment(30);
        for record in records(12) {
            segment.append(&record).unwrap();
        }
        segment.flush().unwrap();

        let mut iter = segment.iter(Direction::Forward).unwrap();
        let head: Vec<String> = iter.by_ref().take(5).map(Result::unwrap).collect();
        let resumed = collect(segment.iter_from(iter.address(), Direction::Forward).unwrap());
        assert_eq!(head, records(12)[..5].to_vec());
        assert_eq!(resumed, records(12)[5..].to_vec());
    }

    #[test]
    fn roll_and_reopen_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.log");
        let segment = BlockSegment::create(
            Box::new(DirectStorage::create(&path, 0).unwrap()),
            Arc::new(StringSerializer),
            codec(),
            32,
            reader(),
            3,
            0,
            SegmentType::LogHead,
        )
        .unwrap();
        let addresses: Vec<u64> = records(20)
            .iter()
            .map(|r| segment.append(r).unwrap())
            .collect();
        segment.roll(1).unwrap();
        drop(segment);

        let reopened = open(&path);
        assert!(reopened.is_read_only());
        assert_eq!(reopened.entries(), 20);
        assert_eq!(reopened.get(addresses[7]).unwrap(), Some(records(20)[7].clone()));
        assert_eq!(collect(reopened.iter(Direction::Forward).unwrap()), records(20));
    }

    #[test]
    fn reopened_head_counts_written_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.log");
        let segment = BlockSegment::create(
            Box::new(DirectStorage::create(&path, 0).unwrap()),
            Arc::new(StringSerializer),
            codec(),
            32,
            reader(),
            3,
            0,
            SegmentType::LogHead,
        )
        .unwrap();
        for record in records(9) {
            segment.append(&record).unwrap();
        }
        segment.close().unwrap();
        drop(segment);

        let reopened = open(&path);
        assert!(!reopened.is_read_only());
        assert_eq!(reopened.entries(), 9);
    }

    #[test]
    fn fixed_size_entries() {
        let segment = BlockSegment::create(
            Box::new(InMemoryStorage::new()),
            Arc::new(U64Serializer),
            BlockCodec::new(BlockFormat::FixedSize { entry_size: 8 }, Compression::None),
            64,
            reader(),
            1,
            0,
            SegmentType::LogHead,
        )
        .unwrap();
        let addresses: Vec<u64> = (0..100u64).map(|v| segment.append(&v).unwrap()).collect();
        segment.flush().unwrap();
        assert_eq!(segment.get(addresses[42]).unwrap(), Some(42));
        let values: Vec<u64> = segment
            .iter(Direction::Backward)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(values, (0..100u64).rev().collect::<Vec<_>>());
    }

    #[test]
    fn failed_block_write_leaves_entry_uncounted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MmapStorage::create(&dir.path().join("seg-1.dat"), 128 * 1024, Some(64 * 1024)).unwrap();
        let segment = BlockSegment::create(
            Box::new(storage),
            Arc::new(StringSerializer),
            BlockCodec::new(BlockFormat::Variable, Compression::None),
            65_000,
            reader(),
            1,
            0,
            SegmentType::LogHead,
        )
        .unwrap();
        let records: Vec<String> = (0..7).map(|i| i.to_string().repeat(10_000)).collect();
        for record in &records[..6] {
            segment.append(record).unwrap();
        }

        // the seventh entry fills a block too large for one mapping window
        let result = segment.append(&records[6]);
        assert!(matches!(
            result,
            Err(CoreError::Storage(StorageError::SplitRecord { .. }))
        ));
        assert_eq!(segment.entries(), 6);
        assert_eq!(segment.pending_entries(), 6);

        segment.flush().unwrap();
        assert_eq!(segment.entries(), 6);
        assert_eq!(collect(segment.iter(Direction::Forward).unwrap()), records[..6].to_vec());
    }

    struct Recorder(Mutex<Vec<(u64, usize)>>);

    impl BlockObserver for Recorder {
        fn on_block(&self, position: u64, block: &Block) -> CoreResult<()> {
            self.0.lock().push((position, block.entries()));
            Ok(())
        }
    }

    #[test]
    fn observer_sees_every_block() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let segment = memory_segment(32).with_observer(recorder.clone());
        for record in records(10) {
            segment.append(&record).unwrap();
        }
        segment.flush().unwrap();

        let seen = recorder.0.lock().clone();
        assert_eq!(seen.iter().map(|(_, n)| n).sum::<usize>(), 10);
        assert_eq!(seen[0].0, LOG_START);

        let replayed = Recorder(Mutex::new(Vec::new()));
        segment.replay(&replayed).unwrap();
        assert_eq!(*replayed.0.lock(), seen);
    }
}
