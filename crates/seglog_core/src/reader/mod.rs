//! Record readers.
//!
//! A reader decodes exactly one framed record from a [`Storage`] at a
//! given offset, forward or backward, and hands back its payload.
//!
//! - [`BufferedReader`] owns one working buffer and needs `&mut self`;
//!   it is meant for single-threaded scans.
//! - [`PooledReader`] shares N buffered readers between threads and is the
//!   [`DataReader`] segments use by default.

mod buffered;
mod pooled;

pub use buffered::BufferedReader;
pub use pooled::{PooledReader, ReaderGuard};

use crate::error::{CoreError, CoreResult};
use bytes::Bytes;
use rand::Rng;
use seglog_storage::Storage;
use std::fmt::Debug;

/// Shared, thread-safe record reader.
pub trait DataReader: Send + Sync + Debug {
    /// Reads the record starting at `position`.
    ///
    /// Returns an empty buffer at the end of written data.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a bad checksum or framing.
    fn read_forward(&self, storage: &dyn Storage, position: u64) -> CoreResult<Bytes>;

    /// Reads the record ending right before `position`.
    ///
    /// Returns an empty buffer when there is no previous record.
    ///
    /// # Errors
    ///
    /// Returns a corruption error for a bad checksum or framing.
    fn read_backward(&self, storage: &dyn Storage, position: u64) -> CoreResult<Bytes>;
}

/// How often reads verify record checksums.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChecksumPolicy {
    probability: f64,
}

impl ChecksumPolicy {
    /// Verifies a `probability` fraction of reads.
    ///
    /// # Errors
    ///
    /// Returns an error if `probability` is outside `0.0..=1.0`.
    pub fn new(probability: f64) -> CoreResult<Self> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(CoreError::invalid_config(format!(
                "checksum probability must be within 0.0..=1.0, got {probability}"
            )));
        }
        Ok(Self { probability })
    }

    /// Verifies every read.
    #[must_use]
    pub const fn always() -> Self {
        Self { probability: 1.0 }
    }

    /// Never verifies.
    #[must_use]
    pub const fn never() -> Self {
        Self { probability: 0.0 }
    }

    /// Rolls the dice for one read.
    #[must_use]
    pub fn should_verify(&self) -> bool {
        if self.probability >= 1.0 {
            return true;
        }
        if self.probability <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.probability
    }
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        Self::always()
    }
}
