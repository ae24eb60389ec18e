use super::entry::{IndexEntry, Range};
use super::segment::{IndexRangeIter, IndexSegment, IndexSegmentFactory};
use crate::appender::{AppenderBuilder, LogAppender, MergeCombiner};
use crate::config::{IndexConfig, SegmentKind};
use crate::error::{CoreError, CoreResult};
use crate::segment::Direction;
use std::path::Path;
use std::sync::Arc;

/// A leveled, compacting disk index from `(stream, version)` to log
/// positions.
///
/// Each segment holds entries in key order, so callers append sorted
/// batches. Compaction merges segments, keeping the newest entry for
/// duplicate keys.
///
/// # Example
///
/// ```no_run
/// use seglog_core::index::{IndexAppender, IndexEntry, Range};
/// use seglog_core::IndexConfig;
///
/// let mut index = IndexAppender::open("/tmp/index", IndexConfig::default())?;
/// index.append(IndexEntry::new(42, 1, 1024))?;
/// index.append(IndexEntry::new(42, 2, 2048))?;
/// assert_eq!(index.version(42)?, 2);
/// assert_eq!(index.get(42, 1)?.map(|e| e.position), Some(1024));
/// assert_eq!(index.iter(Range::all_of(42))?.len(), 2);
/// index.close()?;
/// # Ok::<(), seglog_core::CoreError>(())
/// ```
pub struct IndexAppender {
    log: LogAppender<IndexEntry, IndexSegmentFactory>,
}

impl std::fmt::Debug for IndexAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexAppender")
            .field("path", &self.log.path())
            .field("entries", &self.log.entries())
            .finish()
    }
}

impl IndexAppender {
    /// Opens or creates the index in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the directory is
    /// locked, or existing segments cannot be recovered.
    pub fn open(path: impl AsRef<Path>, config: IndexConfig) -> CoreResult<Self> {
        let factory = IndexSegmentFactory::new(&config)?;
        let appender = config.appender.clone().segment_kind(SegmentKind::FixedSizeBlock {
            max_block_size: config.block_size,
            entry_size: IndexEntry::BYTES,
            compression: config.compression,
        });
        let log = AppenderBuilder::new(path, appender, factory)
            .combiner(Arc::new(MergeCombiner::unique()))
            .open()?;
        Ok(Self { log })
    }

    /// Appends an entry to the head segment.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OutOfOrder`] if `entry` sorts below the last
    /// entry of the head segment.
    pub fn append(&mut self, entry: IndexEntry) -> CoreResult<u64> {
        self.log.append(&entry)
    }

    /// Entry for version `version` of `stream`, newest segment first.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed or a block is damaged.
    pub fn get(&self, stream: i64, version: i32) -> CoreResult<Option<IndexEntry>> {
        for segment in self.segments(Direction::Backward)? {
            if let Some(entry) = segment.find(stream, version)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Latest version of `stream`, [`IndexEntry::NO_VERSION`] if unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed or a block is damaged.
    pub fn version(&self, stream: i64) -> CoreResult<i32> {
        for segment in self.segments(Direction::Backward)? {
            let version = segment.version(stream)?;
            if version != IndexEntry::NO_VERSION {
                return Ok(version);
            }
        }
        Ok(IndexEntry::NO_VERSION)
    }

    /// All entries of `range`, sorted, one per key.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed or a block is damaged.
    pub fn iter(&self, range: Range) -> CoreResult<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for segment in self.segments(Direction::Backward)? {
            for entry in segment.range(range)? {
                entries.push(entry?);
            }
        }
        // stable: among equal keys the newest segment's entry stays first
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    /// Lazily streams the entries of `range` in key order, one per key.
    ///
    /// Every segment is read in step; for a key held by several segments
    /// the newest one wins, as in [`IndexAppender::iter`].
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed or a segment cannot be
    /// queried.
    pub fn stream(&self, range: Range) -> CoreResult<IndexIter> {
        let sources = self
            .segments(Direction::Backward)?
            .iter()
            .map(|segment| {
                Ok(MergeSource {
                    entries: segment.range(range)?,
                    head: None,
                })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(IndexIter {
            sources,
            last: None,
            failed: false,
        })
    }

    /// Forces the head's pending block to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed or the write fails.
    pub fn flush(&mut self) -> CoreResult<()> {
        self.log.flush()
    }

    /// Rolls the head segment, persisting its midpoints and filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed or the roll fails.
    pub fn roll(&mut self) -> CoreResult<()> {
        self.log.roll()
    }

    /// Asks the compactor to check every level.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed.
    pub fn compact(&self) -> CoreResult<()> {
        self.log.compact()
    }

    /// Blocks until no compaction is running or pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is closed.
    pub fn await_compaction(&self) -> CoreResult<()> {
        self.log.await_compaction()
    }

    /// Total entries, duplicates included.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.log.entries()
    }

    /// Number of levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.log.depth()
    }

    /// Names of the segments of `level`, oldest first.
    #[must_use]
    pub fn level_segments(&self, level: u32) -> Vec<String> {
        self.log.level_segments(level)
    }

    /// The index directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.log.path()
    }

    /// Closes the index. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first flush or state error.
    pub fn close(&mut self) -> CoreResult<()> {
        self.log.close()
    }

    fn segments(&self, direction: Direction) -> CoreResult<Vec<Arc<IndexSegment>>> {
        if self.log.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(self.log.segments(direction))
    }
}

/// Lazy merge of a range across every index segment.
pub struct IndexIter {
    // newest segment first
    sources: Vec<MergeSource>,
    last: Option<IndexEntry>,
    failed: bool,
}

struct MergeSource {
    entries: IndexRangeIter,
    head: Option<IndexEntry>,
}

impl IndexIter {
    /// Pulls the next entry of every source that has none buffered and
    /// drops exhausted sources.
    fn fill(&mut self) -> CoreResult<()> {
        let mut index = 0;
        while index < self.sources.len() {
            let source = &mut self.sources[index];
            if source.head.is_none() {
                match source.entries.next() {
                    Some(entry) => source.head = Some(entry?),
                    None => {
                        self.sources.remove(index);
                        continue;
                    }
                }
            }
            index += 1;
        }
        Ok(())
    }
}

impl Iterator for IndexIter {
    type Item = CoreResult<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Err(e) = self.fill() {
                self.failed = true;
                return Some(Err(e));
            }
            let lowest = self.sources.iter().filter_map(|s| s.head).min()?;
            let mut winner = None;
            for source in &mut self.sources {
                if source.head == Some(lowest) {
                    let entry = source.head.take();
                    winner = winner.or(entry);
                }
            }
            // equal keys compare equal whatever their position
            if winner == self.last {
                continue;
            }
            self.last = winner;
            return winner.map(Ok);
        }
    }
}
