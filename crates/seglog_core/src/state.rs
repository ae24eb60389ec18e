//! Persisted appender state.
//!
//! The state is a small CBOR document rewritten on every roll, compaction
//! and close. It lets an appender reopen without scanning every segment.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Format version of the state document.
pub const STATE_VERSION: u16 = 1;

/// Snapshot of an appender's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppenderState {
    /// Document format version.
    pub version: u16,
    /// Address the next append would get.
    pub position: u64,
    /// Total records across all segments.
    pub entry_count: u64,
    /// Time of the last roll (ms since epoch).
    pub last_roll_time: u64,
    /// Id the next created segment gets.
    pub next_segment_id: u64,
    /// Segment-id bits of the address split the log was written with.
    pub segment_bits: u32,
    /// Segment file names per level, oldest first; index 0 holds the head.
    pub levels: Vec<Vec<String>>,
}

impl AppenderState {
    /// Creates the state of an empty log.
    #[must_use]
    pub fn new(segment_bits: u32) -> Self {
        Self {
            version: STATE_VERSION,
            position: 0,
            entry_count: 0,
            last_roll_time: 0,
            next_segment_id: 1,
            segment_bits,
            levels: Vec::new(),
        }
    }

    /// All segment names in the layout.
    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.levels.iter().flatten().map(String::as_str)
    }

    /// Encodes the state as CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::state(format!("failed to encode state: {e}")))?;
        Ok(buf)
    }

    /// Decodes a state document.
    ///
    /// # Errors
    ///
    /// Returns a state error for malformed data or an unknown version.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        let state: Self = ciborium::from_reader(data)
            .map_err(|e| CoreError::state(format!("failed to decode state: {e}")))?;
        if state.version != STATE_VERSION {
            return Err(CoreError::state(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        Ok(state)
    }
}
