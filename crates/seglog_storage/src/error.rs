//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A zero-length write was attempted.
    #[error("cannot store empty record")]
    EmptyWrite,

    /// An existing file is shorter than the length it was opened with.
    #[error("file {path:?} is {actual} bytes, expected at least {expected}")]
    ShorterThanExpected {
        /// The file path.
        path: PathBuf,
        /// Actual file length.
        actual: u64,
        /// Requested length.
        expected: u64,
    },

    /// A write would span two mapped windows.
    #[error("write of {len} bytes at {position} crosses a {window}-byte window boundary")]
    SplitRecord {
        /// Write position.
        position: u64,
        /// Write length.
        len: usize,
        /// Window size.
        window: u64,
    },

    /// A cursor was moved past the end of the storage.
    #[error("position {position} is beyond storage length {length}")]
    PositionOutOfBounds {
        /// Requested position.
        position: u64,
        /// Current length.
        length: u64,
    },

    /// The storage was marked read-only.
    #[error("storage is read-only")]
    ReadOnly,

    /// The file is locked by another owner.
    #[error("file {0:?} is locked by another process")]
    Locked(PathBuf),

    /// Invalid construction parameters.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,
}
