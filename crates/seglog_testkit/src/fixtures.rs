//! Test fixtures and log helpers.
//!
//! Provides temp directories that clean up after themselves, small
//! configurations that roll often, and shortcuts for opening logs.

use seglog_codec::{BytesSerializer, StringSerializer, U64Serializer};
use seglog_core::{AppenderConfig, CoreResult, IndexConfig, LogAppender};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A temporary log directory, removed on drop.
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    /// Creates a fresh temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}

/// A record type with a creation time, for expiry tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Creation time, in arbitrary ticks.
    pub created: u64,
    /// Event body.
    pub body: String,
}

impl Event {
    /// Creates an event.
    pub fn new(created: u64, body: impl Into<String>) -> Self {
        Self {
            created,
            body: body.into(),
        }
    }
}

/// Segments of 4 KiB with compaction off.
pub fn small_config() -> AppenderConfig {
    AppenderConfig::new()
        .segment_size(4096)
        .compaction_disabled(true)
}

/// Index settings with 10-entry blocks and small bloom filters.
pub fn small_index_config() -> IndexConfig {
    IndexConfig::new()
        .appender(AppenderConfig::new().segment_size(1 << 20))
        .block_size(200)
        .expected_entries(1_000)
}

/// Opens a log of strings.
pub fn open_string_log(path: &Path, config: AppenderConfig) -> CoreResult<LogAppender<String>> {
    LogAppender::open(path, config, Arc::new(StringSerializer))
}

/// Opens a log of raw byte records.
pub fn open_bytes_log(path: &Path, config: AppenderConfig) -> CoreResult<LogAppender<Vec<u8>>> {
    LogAppender::open(path, config, Arc::new(BytesSerializer))
}

/// Opens a log of integers.
pub fn open_u64_log(path: &Path, config: AppenderConfig) -> CoreResult<LogAppender<u64>> {
    LogAppender::open(path, config, Arc::new(U64Serializer))
}

/// Path of the `idx`-th segment file of `level`.
pub fn segment_file<T: Send + 'static>(log: &LogAppender<T>, level: u32, idx: usize) -> Option<PathBuf> {
    log.level_segments(level)
        .get(idx)
        .map(|name| log.path().join(name))
}
