//! # seglog core
//!
//! An embedded, log-structured storage engine.
//!
//! This crate provides:
//! - Segments: bounded append-only files of checksummed, framed records
//! - Block segments that pack entries into compressed blocks
//! - A leveled appender that rolls segments and compacts them in the
//!   background
//! - Readers and blocking pollers that tail the log
//! - A disk index of `(stream, version) -> position` entries with
//!   per-segment midpoints and bloom filters
//!
//! ## Layout
//!
//! ```text
//! LogAppender ──owns──> Levels ──hold──> Segment ──owns──> Storage + DataReader
//!      │                  ▲
//!      └── compaction ────┘   (one coordinator thread per appender)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use seglog_core::{AppenderConfig, Direction, LogAppender};
//! use seglog_codec::U64Serializer;
//! use std::sync::Arc;
//!
//! let config = AppenderConfig::new().segment_size(1 << 20);
//! let mut log = LogAppender::open("/tmp/numbers", config, Arc::new(U64Serializer))?;
//! let address = log.append(&7)?;
//! assert_eq!(log.get(address)?, Some(7));
//!
//! let mut poller = log.poller()?;
//! assert_eq!(poller.take()?, Some(7));
//! # Ok::<(), seglog_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod appender;
mod config;
mod dir;
mod error;
pub mod index;
pub mod reader;
mod record;
pub mod segment;
mod state;

pub use appender::{AppenderBuilder, LogAppender, LogIter, LogReader, Poller, PollerCloser};
pub use config::{AppenderConfig, IndexBlockLayout, IndexConfig, SegmentKind, StorageMode};
pub use dir::{LogDir, SEGMENT_EXTENSION};
pub use error::{CoreError, CoreResult};
pub use index::{IndexAppender, IndexEntry, Range};
pub use segment::{Checkpoint, Direction, Log, LogIterator, LogSegment, LogSegmentFactory, SegmentFactory, SegmentInfo};
pub use state::AppenderState;
