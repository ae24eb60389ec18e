//! Error types for seglog core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in seglog core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] seglog_storage::StorageError),

    /// Serializer or compression error.
    #[error("codec error: {0}")]
    Codec(#[from] seglog_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record payload did not match its stored checksum.
    #[error("checksum mismatch at position {position}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Record position.
        position: u64,
        /// Checksum stored in the record header.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Malformed header, block or record framing.
    #[error("corrupted data: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Write attempted on a read-only segment.
    #[error("segment {name} is read-only")]
    ReadOnly {
        /// Segment name.
        name: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// Invalid call argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// A segment id or offset does not fit the address bit split.
    #[error("address overflow: {message}")]
    AddressOverflow {
        /// Description of the overflow.
        message: String,
    },

    /// An index entry was appended out of key order.
    #[error("out of order append: {message}")]
    OutOfOrder {
        /// Description of the ordering violation.
        message: String,
    },

    /// The persisted appender state is unusable.
    #[error("invalid appender state: {message}")]
    State {
        /// Description of the problem.
        message: String,
    },

    /// Another appender holds the directory lock.
    #[error("log directory {path:?} is locked by another appender")]
    Locked {
        /// Directory path.
        path: PathBuf,
    },

    /// The log or segment is closed.
    #[error("log is closed")]
    Closed,
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a read-only error.
    pub fn read_only(name: impl Into<String>) -> Self {
        Self::ReadOnly { name: name.into() }
    }

    /// Creates a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an address overflow error.
    pub fn address_overflow(message: impl Into<String>) -> Self {
        Self::AddressOverflow {
            message: message.into(),
        }
    }

    /// Creates an ordering error.
    pub fn out_of_order(message: impl Into<String>) -> Self {
        Self::OutOfOrder {
            message: message.into(),
        }
    }

    /// Creates a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by damaged data.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Corrupted { .. })
    }
}
