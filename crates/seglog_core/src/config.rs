//! Appender and index configuration.

use crate::error::{CoreError, CoreResult};
use crate::record;
use crate::segment::block::ENTRY_BITS;
use seglog_codec::Compression;
use seglog_storage::{DirectStorage, MmapStorage, Storage};
use std::path::Path;
use std::time::Duration;

/// Which storage backend segment files use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Positioned read/write syscalls.
    #[default]
    Direct,
    /// Memory-mapped file, optionally split into fixed windows.
    Mmap {
        /// Window size; `None` maps the whole file as one window.
        window_size: Option<u64>,
    },
}

impl StorageMode {
    /// Creates a new backing file of `length` bytes.
    pub(crate) fn create(self, path: &Path, length: u64) -> CoreResult<Box<dyn Storage>> {
        Ok(match self {
            Self::Direct => Box::new(DirectStorage::create(path, length)?),
            Self::Mmap { window_size } => Box::new(MmapStorage::create(path, length, window_size)?),
        })
    }

    /// Opens an existing backing file.
    pub(crate) fn open(self, path: &Path) -> CoreResult<Box<dyn Storage>> {
        Ok(match self {
            Self::Direct => Box::new(DirectStorage::open(path)?),
            Self::Mmap { window_size } => Box::new(MmapStorage::open(path, window_size)?),
        })
    }
}

/// The closed set of segment layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentKind {
    /// One framed record per entry.
    #[default]
    Plain,
    /// Entries grouped into compressed blocks of variable-size entries.
    Block {
        /// Uncompressed block budget in bytes.
        max_block_size: usize,
        /// Block codec.
        compression: Compression,
    },
    /// Entries of one fixed size grouped into compressed blocks.
    FixedSizeBlock {
        /// Uncompressed block budget in bytes.
        max_block_size: usize,
        /// Serialized size of every entry.
        entry_size: usize,
        /// Block codec.
        compression: Compression,
    },
}

impl SegmentKind {
    fn is_block(self) -> bool {
        !matches!(self, Self::Plain)
    }
}

/// Configuration for a [`crate::LogAppender`].
#[derive(Debug, Clone)]
pub struct AppenderConfig {
    /// Log bytes per segment before the head is rolled.
    pub segment_size: u64,

    /// Address bits reserved for the segment id; the rest address bytes
    /// within a segment.
    pub segment_bits: u32,

    /// Segments a level may hold before it is compacted.
    pub max_segments_per_level: usize,

    /// Fraction of reads (0.0 to 1.0) that verify the record checksum.
    pub checksum_probability: f64,

    /// Number of pooled readers shared by concurrent reads.
    pub reader_pool_size: usize,

    /// Working buffer of each pooled reader.
    pub read_buffer_size: usize,

    /// Segment storage backend.
    pub storage_mode: StorageMode,

    /// Segment layout.
    pub segment_kind: SegmentKind,

    /// Whether to flush the head after every append.
    pub flush_after_write: bool,

    /// Whether background compaction is disabled.
    pub compaction_disabled: bool,

    /// Roll the head once this much time has passed since the last roll.
    pub roll_frequency: Option<Duration>,

    /// How long a poller parks before re-checking for close.
    pub poll_timeout: Duration,

    /// File name prefix of segment files.
    pub name_prefix: String,
}

impl Default for AppenderConfig {
    fn default() -> Self {
        Self {
            segment_size: 10 * 1024 * 1024, // 10 MB
            segment_bits: 18,
            max_segments_per_level: 3,
            checksum_probability: 1.0,
            reader_pool_size: 4,
            read_buffer_size: 4096,
            storage_mode: StorageMode::Direct,
            segment_kind: SegmentKind::Plain,
            flush_after_write: false,
            compaction_disabled: false,
            roll_frequency: None,
            poll_timeout: Duration::from_millis(500),
            name_prefix: "segment".to_string(),
        }
    }
}

impl AppenderConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment size.
    #[must_use]
    pub fn segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Sets the number of segment-id address bits.
    #[must_use]
    pub fn segment_bits(mut self, bits: u32) -> Self {
        self.segment_bits = bits;
        self
    }

    /// Sets the per-level compaction threshold.
    #[must_use]
    pub fn max_segments_per_level(mut self, max: usize) -> Self {
        self.max_segments_per_level = max;
        self
    }

    /// Sets the checksum verification probability.
    #[must_use]
    pub fn checksum_probability(mut self, probability: f64) -> Self {
        self.checksum_probability = probability;
        self
    }

    /// Sets the reader pool size.
    #[must_use]
    pub fn reader_pool_size(mut self, size: usize) -> Self {
        self.reader_pool_size = size;
        self
    }

    /// Sets the reader working buffer size.
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Sets the storage backend.
    #[must_use]
    pub fn storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    /// Sets the segment layout.
    #[must_use]
    pub fn segment_kind(mut self, kind: SegmentKind) -> Self {
        self.segment_kind = kind;
        self
    }

    /// Sets whether every append is flushed.
    #[must_use]
    pub fn flush_after_write(mut self, value: bool) -> Self {
        self.flush_after_write = value;
        self
    }

    /// Disables background compaction.
    #[must_use]
    pub fn compaction_disabled(mut self, value: bool) -> Self {
        self.compaction_disabled = value;
        self
    }

    /// Sets the time-based roll interval.
    #[must_use]
    pub fn roll_frequency(mut self, frequency: Duration) -> Self {
        self.roll_frequency = Some(frequency);
        self
    }

    /// Sets the poller park timeout.
    #[must_use]
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the segment file name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Bits left for the offset within a segment.
    #[must_use]
    pub fn offset_bits(&self) -> u32 {
        64 - self.segment_bits
    }

    /// Checks the configuration for usage errors.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        if self.segment_size == 0 {
            return Err(CoreError::invalid_config("segment_size must be greater than zero"));
        }
        if !(1..=40).contains(&self.segment_bits) {
            return Err(CoreError::invalid_config(format!(
                "segment_bits must be within 1..=40, got {}",
                self.segment_bits
            )));
        }
        if self.max_segments_per_level < 2 {
            return Err(CoreError::invalid_config(
                "max_segments_per_level must be at least 2",
            ));
        }
        if !(0.0..=1.0).contains(&self.checksum_probability) {
            return Err(CoreError::invalid_config(format!(
                "checksum_probability must be within 0.0..=1.0, got {}",
                self.checksum_probability
            )));
        }
        if self.reader_pool_size == 0 {
            return Err(CoreError::invalid_config("reader_pool_size must be at least 1"));
        }
        if self.read_buffer_size < record::OVERHEAD {
            return Err(CoreError::invalid_config(format!(
                "read_buffer_size must be at least {} bytes",
                record::OVERHEAD
            )));
        }
        if self.name_prefix.is_empty() || self.name_prefix.contains(['/', '\\']) {
            return Err(CoreError::invalid_config(format!(
                "invalid name prefix {:?}",
                self.name_prefix
            )));
        }

        // A segment may overshoot segment_size by one record, so leave 2x headroom.
        let mut offset_bits = self.offset_bits();
        match self.segment_kind {
            SegmentKind::Plain => {}
            SegmentKind::Block { max_block_size, .. } => {
                if max_block_size == 0 {
                    return Err(CoreError::invalid_config("max_block_size must be greater than zero"));
                }
            }
            SegmentKind::FixedSizeBlock {
                max_block_size,
                entry_size,
                ..
            } => {
                if max_block_size == 0 || entry_size == 0 {
                    return Err(CoreError::invalid_config(
                        "max_block_size and entry_size must be greater than zero",
                    ));
                }
            }
        }
        if self.segment_kind.is_block() {
            offset_bits -= ENTRY_BITS;
        }
        let max_offset = 1u64 << offset_bits;
        if self.segment_size.saturating_mul(2) >= max_offset {
            return Err(CoreError::invalid_config(format!(
                "segment_size {} does not fit {} offset bits",
                self.segment_size, offset_bits
            )));
        }
        Ok(())
    }
}

/// Layout of index block payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexBlockLayout {
    /// A flat array of fixed-size entries.
    #[default]
    Flat,
    /// Entries grouped per stream: `[stream][count]{[version][position]}`.
    StreamGrouped,
}

/// Configuration for a [`crate::index::IndexAppender`].
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Settings of the underlying appender.
    pub appender: AppenderConfig,

    /// Expected entries per segment, used to size bloom filters.
    pub expected_entries: u64,

    /// Target bloom filter false-positive rate.
    pub false_positive_rate: f64,

    /// Uncompressed bytes per index block.
    pub block_size: usize,

    /// Index block codec.
    pub compression: Compression,

    /// Index block payload layout.
    pub layout: IndexBlockLayout,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            appender: AppenderConfig::default().name_prefix("index"),
            expected_entries: 100_000,
            false_positive_rate: 0.01,
            block_size: 4096, // ~204 entries
            compression: Compression::Snappy,
            layout: IndexBlockLayout::Flat,
        }
    }
}

impl IndexConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the appender settings.
    #[must_use]
    pub fn appender(mut self, appender: AppenderConfig) -> Self {
        self.appender = appender;
        self
    }

    /// Sets the expected entries per segment.
    #[must_use]
    pub fn expected_entries(mut self, entries: u64) -> Self {
        self.expected_entries = entries;
        self
    }

    /// Sets the bloom filter false-positive rate.
    #[must_use]
    pub fn false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }

    /// Sets the index block size.
    #[must_use]
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the block codec.
    #[must_use]
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the block payload layout.
    #[must_use]
    pub fn layout(mut self, layout: IndexBlockLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Checks the configuration for usage errors.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> CoreResult<()> {
        let appender = self
            .appender
            .clone()
            .segment_kind(SegmentKind::FixedSizeBlock {
                max_block_size: self.block_size,
                entry_size: crate::index::IndexEntry::BYTES,
                compression: self.compression,
            });
        appender.validate()?;
        if self.expected_entries == 0 {
            return Err(CoreError::invalid_config("expected_entries must be greater than zero"));
        }
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(CoreError::invalid_config(format!(
                "false_positive_rate must be within (0, 1), got {}",
                self.false_positive_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AppenderConfig::default();
        assert_eq!(config.segment_bits, 18);
        assert_eq!(config.offset_bits(), 46);
        assert_eq!(config.max_segments_per_level, 3);
        assert!(config.validate().is_ok());
        assert!(IndexConfig::default().validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = AppenderConfig::new()
            .segment_size(1024)
            .max_segments_per_level(4)
            .compaction_disabled(true)
            .storage_mode(StorageMode::Mmap { window_size: None });

        assert_eq!(config.segment_size, 1024);
        assert_eq!(config.max_segments_per_level, 4);
        assert!(config.compaction_disabled);
        assert_eq!(config.storage_mode, StorageMode::Mmap { window_size: None });
    }

    #[test]
    fn zero_segment_size_rejected() {
        let result = AppenderConfig::new().segment_size(0).validate();
        assert!(matches!(result, Err(CoreError::InvalidConfig { .. })));
    }

    #[test]
    fn checksum_probability_bounds() {
        assert!(AppenderConfig::new().checksum_probability(0.0).validate().is_ok());
        assert!(AppenderConfig::new().checksum_probability(1.5).validate().is_err());
    }

    #[test]
    fn segment_size_must_fit_offset_bits() {
        let config = AppenderConfig::new().segment_bits(40).segment_size(1 << 30);
        assert!(matches!(config.validate(), Err(CoreError::InvalidConfig { .. })));

        let block = AppenderConfig::new()
            .segment_bits(34)
            .segment_size(1 << 20)
            .segment_kind(SegmentKind::Block {
                max_block_size: 4096,
                compression: Compression::None,
            });
        assert!(block.validate().is_err());
    }
}
