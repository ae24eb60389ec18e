use super::block::GroupedPacking;
use super::bloom::BloomFilter;
use super::entry::{IndexEntry, IndexEntrySerializer, Range};
use super::midpoints::Midpoints;
use crate::appender::segment_stem;
use crate::config::{IndexBlockLayout, IndexConfig, StorageMode};
use crate::error::{CoreError, CoreResult};
use crate::reader::{ChecksumPolicy, DataReader, PooledReader};
use crate::segment::{
    Block, BlockCodec, BlockFormat, BlockObserver, BlockSegment, Direction, Log, LogIterator,
    SegmentFactory, SegmentInfo, SegmentInit,
};
use parking_lot::{Mutex, RwLock};
use seglog_codec::Serializer;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const MIDPOINT_SUFFIX: &str = "-MIDPOINT.dat";
const FILTER_SUFFIX: &str = "-FILTER.dat";

/// Paths of the midpoint and bloom filter files of the segment at `path`.
fn side_files(path: &Path) -> (PathBuf, PathBuf) {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let stem = segment_stem(name);
    (
        path.with_file_name(format!("{stem}{MIDPOINT_SUFFIX}")),
        path.with_file_name(format!("{stem}{FILTER_SUFFIX}")),
    )
}

struct Accelerators {
    midpoints: RwLock<Midpoints>,
    filter: RwLock<BloomFilter>,
}

impl Accelerators {
    fn new(filter: BloomFilter) -> Self {
        Self {
            midpoints: RwLock::new(Midpoints::new()),
            filter: RwLock::new(filter),
        }
    }

    fn load(midpoint_path: &Path, filter_path: &Path) -> CoreResult<Self> {
        Ok(Self {
            midpoints: RwLock::new(Midpoints::load(midpoint_path)?),
            filter: RwLock::new(BloomFilter::load(filter_path)?),
        })
    }
}

impl BlockObserver for Accelerators {
    fn on_block(&self, position: u64, block: &Block) -> CoreResult<()> {
        let (Some(first), Some(last)) = (block.first(), block.last()) else {
            return Ok(());
        };
        let first = IndexEntry::read_from(first)?;
        let last = IndexEntry::read_from(last)?;
        self.midpoints.write().push_block(first, last, position)?;

        let mut filter = self.filter.write();
        for entry in block.iter() {
            filter.add(IndexEntry::read_from(entry)?.stream);
        }
        Ok(())
    }
}

/// Last entry of `stream` in the sorted `entries`.
fn last_of<'a>(
    entries: impl DoubleEndedIterator<Item = &'a [u8]>,
    stream: i64,
) -> CoreResult<Option<IndexEntry>> {
    for raw in entries.rev() {
        let entry = IndexEntry::read_from(raw)?;
        if entry.stream == stream {
            return Ok(Some(entry));
        }
        if entry.stream < stream {
            break;
        }
    }
    Ok(None)
}

/// A block segment of sorted [`IndexEntry`]s with a midpoint table and
/// a bloom filter over its streams.
///
/// Entries must be appended in non-decreasing `(stream, version)` order.
/// Lookups see the not yet written block as well. Rolling persists the
/// midpoints and filter next to the segment file.
pub struct IndexSegment {
    inner: BlockSegment<IndexEntry>,
    accel: Arc<Accelerators>,
    midpoint_path: PathBuf,
    filter_path: PathBuf,
    last_key: Mutex<Option<IndexEntry>>,
    deleted: AtomicBool,
}

impl fmt::Debug for IndexSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSegment")
            .field("inner", &self.inner)
            .field("blocks", &self.accel.midpoints.read().len())
            .finish()
    }
}

impl IndexSegment {
    fn new(inner: BlockSegment<IndexEntry>, accel: Arc<Accelerators>, path: &Path) -> Self {
        let (midpoint_path, filter_path) = side_files(path);
        let last_key = accel.midpoints.read().last();
        Self {
            inner: inner.with_observer(Arc::clone(&accel) as Arc<dyn BlockObserver>),
            accel,
            midpoint_path,
            filter_path,
            last_key: Mutex::new(last_key),
            deleted: AtomicBool::new(false),
        }
    }

    /// False if the segment certainly holds no entry of `stream`.
    #[must_use]
    pub fn might_contain(&self, stream: i64) -> bool {
        self.accel.filter.read().contains(stream)
    }

    /// Number of written blocks.
    #[must_use]
    pub fn blocks(&self) -> usize {
        self.accel.midpoints.read().len()
    }

    /// Entry for version `version` of `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read.
    pub fn find(&self, stream: i64, version: i32) -> CoreResult<Option<IndexEntry>> {
        self.range(Range::exactly(stream, version))?.next().transpose()
    }

    /// Latest version of `stream`, [`IndexEntry::NO_VERSION`] if the
    /// segment holds none.
    ///
    /// # Errors
    ///
    /// Returns an error if a block cannot be read.
    pub fn version(&self, stream: i64) -> CoreResult<i32> {
        if !self.might_contain(stream) {
            return Ok(IndexEntry::NO_VERSION);
        }
        let upper = IndexEntry::key(stream, i32::MAX);
        let (pending, block) = self.inner.with_pending(|_, pending| {
            let block = self.accel.midpoints.read().last_block_for(&upper);
            last_of(pending.iter(), stream).map(|found| (found, block))
        })?;
        if let Some(entry) = pending {
            return Ok(entry.version);
        }
        let Some(position) = block else {
            return Ok(IndexEntry::NO_VERSION);
        };
        let block = self.inner.read_block(position)?.ok_or_else(|| {
            CoreError::corrupted(format!("{}: no block at midpoint {position}", self.name()))
        })?;
        Ok(last_of(block.iter(), stream)?.map_or(IndexEntry::NO_VERSION, |e| e.version))
    }

    /// Entries of `range` in key order.
    ///
    /// The iterator covers the blocks written when it was created plus a
    /// snapshot of the unwritten block.
    ///
    /// # Errors
    ///
    /// Returns an error if the blocks cannot be read.
    pub fn range(&self, range: Range) -> CoreResult<IndexRangeIter> {
        if !self.might_contain(range.stream()) {
            return Ok(IndexRangeIter::empty(range));
        }
        let (frontier, start, pending) = self.inner.with_pending(|frontier, pending| {
            let midpoints = self.accel.midpoints.read();
            let start = if midpoints.in_range(&range) {
                midpoints.midpoint_for(&range.start_key())
            } else {
                None
            };
            let mut entries = Vec::new();
            for raw in pending.iter() {
                let entry = IndexEntry::read_from(raw)?;
                if range.contains(&entry) {
                    entries.push(entry);
                }
            }
            Ok::<_, CoreError>((frontier, start, entries))
        })?;
        let blocks = match start {
            Some(position) => Some(self.inner.blocks_from(position, Direction::Forward)?),
            None => None,
        };
        Ok(IndexRangeIter {
            range,
            blocks,
            frontier,
            current: Vec::new().into_iter(),
            pending: pending.into_iter(),
            failed: false,
        })
    }

    fn write_side_files(&self) -> CoreResult<()> {
        self.accel.midpoints.read().write(&self.midpoint_path)?;
        self.accel.filter.write().write(&self.filter_path)
    }
}

impl SegmentInfo for IndexSegment {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn level(&self) -> u32 {
        self.inner.level()
    }

    fn created(&self) -> u64 {
        self.inner.created()
    }

    fn entries(&self) -> u64 {
        self.inner.entries()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn flush(&self) -> CoreResult<()> {
        self.inner.flush()
    }

    fn roll(&self, level: u32) -> CoreResult<()> {
        self.inner.roll(level)?;
        self.write_side_files()
    }

    fn delete(&self) {
        self.deleted.store(true, Ordering::Release);
        self.inner.delete();
    }

    fn close(&self) -> CoreResult<()> {
        self.inner.close()
    }
}

impl Log<IndexEntry> for IndexSegment {
    fn append(&self, record: &IndexEntry) -> CoreResult<u64> {
        let mut last = self.last_key.lock();
        if let Some(previous) = *last {
            if *record < previous {
                return Err(CoreError::out_of_order(format!(
                    "{:?} appended after {:?} in {}",
                    record,
                    previous,
                    self.name()
                )));
            }
        }
        let address = self.inner.append(record)?;
        *last = Some(*record);
        self.accel.filter.write().add(record.stream);
        Ok(address)
    }

    fn get(&self, position: u64) -> CoreResult<Option<IndexEntry>> {
        self.inner.get(position)
    }

    fn iter(&self, direction: Direction) -> CoreResult<Box<dyn LogIterator<IndexEntry>>> {
        self.inner.iter(direction)
    }

    fn iter_from(
        &self,
        position: u64,
        direction: Direction,
    ) -> CoreResult<Box<dyn LogIterator<IndexEntry>>> {
        self.inner.iter_from(position, direction)
    }
}

impl Drop for IndexSegment {
    fn drop(&mut self) {
        if !self.deleted.load(Ordering::Acquire) {
            return;
        }
        for path in [&self.midpoint_path, &self.filter_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove index side file"),
            }
        }
    }
}

/// Lazy iterator over the entries of one [`IndexSegment`] in a range.
pub struct IndexRangeIter {
    range: Range,
    blocks: Option<Box<dyn LogIterator<Block>>>,
    frontier: u64,
    current: std::vec::IntoIter<IndexEntry>,
    pending: std::vec::IntoIter<IndexEntry>,
    failed: bool,
}

impl IndexRangeIter {
    fn empty(range: Range) -> Self {
        Self {
            range,
            blocks: None,
            frontier: 0,
            current: Vec::new().into_iter(),
            pending: Vec::new().into_iter(),
            failed: false,
        }
    }

    /// Loads the matches of the next written block; false once the
    /// written blocks are exhausted or past the range.
    fn next_block(&mut self) -> CoreResult<bool> {
        let block = match self.blocks.as_mut() {
            Some(blocks) if blocks.address() < self.frontier => blocks.next().transpose()?,
            _ => None,
        };
        let Some(block) = block else {
            self.blocks = None;
            return Ok(false);
        };

        let end = self.range.end_key();
        let mut matches = Vec::new();
        for raw in block.iter() {
            let entry = IndexEntry::read_from(raw)?;
            if entry >= end {
                self.blocks = None;
                break;
            }
            if self.range.contains(&entry) {
                matches.push(entry);
            }
        }
        self.current = matches.into_iter();
        Ok(true)
    }
}

impl Iterator for IndexRangeIter {
    type Item = CoreResult<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some(entry) = self.current.next() {
                return Some(Ok(entry));
            }
            match self.next_block() {
                Ok(true) => {}
                Ok(false) => return self.pending.next().map(Ok),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Creates and opens [`IndexSegment`]s.
pub struct IndexSegmentFactory {
    storage_mode: StorageMode,
    codec: BlockCodec,
    block_size: usize,
    serializer: Arc<dyn Serializer<IndexEntry>>,
    reader: Arc<dyn DataReader>,
    expected_entries: u64,
    false_positive_rate: f64,
}

impl fmt::Debug for IndexSegmentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSegmentFactory")
            .field("codec", &self.codec)
            .field("block_size", &self.block_size)
            .field("expected_entries", &self.expected_entries)
            .finish()
    }
}

impl IndexSegmentFactory {
    /// Creates a factory from index settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &IndexConfig) -> CoreResult<Self> {
        config.validate()?;
        let appender = &config.appender;
        let checksum = ChecksumPolicy::new(appender.checksum_probability)?;
        let reader = PooledReader::new(appender.reader_pool_size, appender.read_buffer_size, checksum)?;
        let format = BlockFormat::FixedSize {
            entry_size: IndexEntry::BYTES,
        };
        let codec = match config.layout {
            IndexBlockLayout::Flat => BlockCodec::new(format, config.compression),
            IndexBlockLayout::StreamGrouped => {
                BlockCodec::new(format, config.compression).with_packing(Arc::new(GroupedPacking))
            }
        };
        Ok(Self {
            storage_mode: appender.storage_mode,
            codec,
            block_size: config.block_size,
            serializer: Arc::new(IndexEntrySerializer),
            reader: Arc::new(reader),
            expected_entries: config.expected_entries,
            false_positive_rate: config.false_positive_rate,
        })
    }

    fn rebuild(&self, inner: &BlockSegment<IndexEntry>) -> CoreResult<Accelerators> {
        let accel = Accelerators::new(BloomFilter::new(self.expected_entries, self.false_positive_rate)?);
        inner.replay(&accel)?;
        Ok(accel)
    }
}

impl SegmentFactory<IndexEntry> for IndexSegmentFactory {
    type Segment = IndexSegment;

    fn create(&self, path: &Path, init: SegmentInit) -> CoreResult<IndexSegment> {
        let storage = self.storage_mode.create(path, init.length)?;
        let inner = BlockSegment::create(
            storage,
            Arc::clone(&self.serializer),
            self.codec.clone(),
            self.block_size,
            Arc::clone(&self.reader),
            init.id,
            init.level,
            init.segment_type,
        )?;
        let accel = Accelerators::new(BloomFilter::new(self.expected_entries, self.false_positive_rate)?);
        Ok(IndexSegment::new(inner, Arc::new(accel), path))
    }

    fn open(&self, path: &Path) -> CoreResult<IndexSegment> {
        let storage = self.storage_mode.open(path)?;
        let inner = BlockSegment::open(
            storage,
            Arc::clone(&self.serializer),
            self.codec.clone(),
            self.block_size,
            Arc::clone(&self.reader),
        )?;
        let accel = if inner.is_read_only() {
            let (midpoint_path, filter_path) = side_files(path);
            match Accelerators::load(&midpoint_path, &filter_path) {
                Ok(accel) => accel,
                Err(e) => {
                    warn!(segment = %inner.name(), error = %e, "index side files unusable, rebuilding");
                    self.rebuild(&inner)?
                }
            }
        } else {
            debug!(segment = %inner.name(), "rebuilding midpoints of live index segment");
            self.rebuild(&inner)?
        };
        Ok(IndexSegment::new(inner, Arc::new(accel), path))
    }
}
