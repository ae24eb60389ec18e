use super::block::{BlockCodec, BlockFormat};
use super::block_segment::BlockSegment;
use super::header::SegmentType;
use super::plain::{Checkpoint, Segment};
use super::{Direction, Log, LogIterator, SegmentInfo};
use crate::config::{AppenderConfig, SegmentKind, StorageMode};
use crate::error::CoreResult;
use crate::reader::{ChecksumPolicy, DataReader, PooledReader};
use seglog_codec::Serializer;
use std::path::Path;
use std::sync::Arc;

/// Parameters of a segment about to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInit {
    /// Segment id.
    pub id: u64,
    /// Level the segment starts at.
    pub level: u32,
    /// Header type.
    pub segment_type: SegmentType,
    /// Bytes to preallocate.
    pub length: u64,
}

/// Creates and opens the segments of one log.
pub trait SegmentFactory<T>: Send + Sync + 'static {
    /// Segment type produced.
    type Segment: Log<T> + 'static;

    /// Creates a new segment file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be written.
    fn create(&self, path: &Path, init: SegmentInit) -> CoreResult<Self::Segment>;

    /// Opens the segment file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or damaged.
    fn open(&self, path: &Path) -> CoreResult<Self::Segment>;

    /// Opens the live head at `path`, scanning only past `checkpoint`
    /// where the layout allows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or damaged.
    fn open_head(&self, path: &Path, _checkpoint: Checkpoint) -> CoreResult<Self::Segment> {
        self.open(path)
    }
}

/// One of the built-in segment layouts.
#[derive(Debug)]
pub enum LogSegment<T> {
    /// Plain framed records.
    Plain(Segment<T>),
    /// Variable-size entries in compressed blocks.
    Block(BlockSegment<T>),
    /// Fixed-size entries in compressed blocks.
    FixedSizeBlock(BlockSegment<T>),
}

macro_rules! dispatch {
    ($self:expr, $segment:ident => $body:expr) => {
        match $self {
            LogSegment::Plain($segment) => $body,
            LogSegment::Block($segment) | LogSegment::FixedSizeBlock($segment) => $body,
        }
    };
}

impl<T: Send + 'static> SegmentInfo for LogSegment<T> {
    fn id(&self) -> u64 {
        dispatch!(self, s => s.id())
    }

    fn name(&self) -> &str {
        dispatch!(self, s => s.name())
    }

    fn level(&self) -> u32 {
        dispatch!(self, s => s.level())
    }

    fn created(&self) -> u64 {
        dispatch!(self, s => s.created())
    }

    fn entries(&self) -> u64 {
        dispatch!(self, s => s.entries())
    }

    fn position(&self) -> u64 {
        dispatch!(self, s => s.position())
    }

    fn size(&self) -> u64 {
        dispatch!(self, s => s.size())
    }

    fn is_read_only(&self) -> bool {
        dispatch!(self, s => s.is_read_only())
    }

    fn flush(&self) -> CoreResult<()> {
        dispatch!(self, s => s.flush())
    }

    fn roll(&self, level: u32) -> CoreResult<()> {
        dispatch!(self, s => s.roll(level))
    }

    fn delete(&self) {
        dispatch!(self, s => s.delete());
    }

    fn close(&self) -> CoreResult<()> {
        dispatch!(self, s => s.close())
    }
}

impl<T: Send + 'static> Log<T> for LogSegment<T> {
    fn append(&self, record: &T) -> CoreResult<u64> {
        dispatch!(self, s => s.append(record))
    }

    fn get(&self, position: u64) -> CoreResult<Option<T>> {
        dispatch!(self, s => s.get(position))
    }

    fn iter(&self, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>> {
        dispatch!(self, s => s.iter(direction))
    }

    fn iter_from(&self, position: u64, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>> {
        dispatch!(self, s => s.iter_from(position, direction))
    }
}

/// Factory for [`LogSegment`]s of the configured [`SegmentKind`].
pub struct LogSegmentFactory<T> {
    kind: SegmentKind,
    storage_mode: StorageMode,
    serializer: Arc<dyn Serializer<T>>,
    reader: Arc<dyn DataReader>,
}

impl<T> std::fmt::Debug for LogSegmentFactory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSegmentFactory")
            .field("kind", &self.kind)
            .field("storage_mode", &self.storage_mode)
            .finish()
    }
}

impl<T: Send + 'static> LogSegmentFactory<T> {
    /// Creates a factory from appender settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader pool settings are invalid.
    pub fn new(config: &AppenderConfig, serializer: Arc<dyn Serializer<T>>) -> CoreResult<Self> {
        let checksum = ChecksumPolicy::new(config.checksum_probability)?;
        let reader = PooledReader::new(config.reader_pool_size, config.read_buffer_size, checksum)?;
        Ok(Self {
            kind: config.segment_kind,
            storage_mode: config.storage_mode,
            serializer,
            reader: Arc::new(reader),
        })
    }

    fn block_codec(&self) -> Option<(BlockCodec, usize)> {
        match self.kind {
            SegmentKind::Plain => None,
            SegmentKind::Block {
                max_block_size,
                compression,
            } => Some((BlockCodec::new(BlockFormat::Variable, compression), max_block_size)),
            SegmentKind::FixedSizeBlock {
                max_block_size,
                entry_size,
                compression,
            } => Some((
                BlockCodec::new(BlockFormat::FixedSize { entry_size }, compression),
                max_block_size,
            )),
        }
    }

    fn wrap(&self, segment: BlockSegment<T>) -> LogSegment<T> {
        match self.kind {
            SegmentKind::FixedSizeBlock { .. } => LogSegment::FixedSizeBlock(segment),
            _ => LogSegment::Block(segment),
        }
    }
}

impl<T: Send + 'static> SegmentFactory<T> for LogSegmentFactory<T> {
    type Segment = LogSegment<T>;

    fn create(&self, path: &Path, init: SegmentInit) -> CoreResult<LogSegment<T>> {
        let storage = self.storage_mode.create(path, init.length)?;
        let serializer = Arc::clone(&self.serializer);
        let reader = Arc::clone(&self.reader);
        Ok(match self.block_codec() {
            None => LogSegment::Plain(Segment::create(
                storage,
                serializer,
                reader,
                init.id,
                init.level,
                init.segment_type,
            )?),
            Some((codec, max_block_size)) => self.wrap(BlockSegment::create(
                storage,
                serializer,
                codec,
                max_block_size,
                reader,
                init.id,
                init.level,
                init.segment_type,
            )?),
        })
    }

    fn open(&self, path: &Path) -> CoreResult<LogSegment<T>> {
        self.open_segment(path, None)
    }

    // block heads recount their blocks: the checkpoint has no block count
    fn open_head(&self, path: &Path, checkpoint: Checkpoint) -> CoreResult<LogSegment<T>> {
        self.open_segment(path, Some(checkpoint))
    }
}

impl<T: Send + 'static> LogSegmentFactory<T> {
    fn open_segment(&self, path: &Path, checkpoint: Option<Checkpoint>) -> CoreResult<LogSegment<T>> {
        let storage = self.storage_mode.open(path)?;
        let serializer = Arc::clone(&self.serializer);
        let reader = Arc::clone(&self.reader);
        Ok(match self.block_codec() {
            None => LogSegment::Plain(Segment::open_at(storage, serializer, reader, checkpoint)?),
            Some((codec, max_block_size)) => self.wrap(BlockSegment::open(
                storage,
                serializer,
                codec,
                max_block_size,
                reader,
            )?),
        })
    }
}
