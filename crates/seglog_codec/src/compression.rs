//! Block compression codecs.

use crate::error::{CodecError, CodecResult};

/// Compression applied to a whole block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Store the payload as-is.
    None,
    /// Snappy raw format.
    #[default]
    Snappy,
}

impl Compression {
    /// Compresses `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder rejects the input.
    pub fn compress(self, data: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| CodecError::compression(e.to_string())),
        }
    }

    /// Decompresses `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a valid payload for this codec.
    pub fn decompress(self, data: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            Self::None => Ok(data.to_vec()),
            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| CodecError::compression(e.to_string())),
        }
    }

    /// One-byte tag stored alongside compressed data.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Snappy => 1,
        }
    }

    /// Parses a tag written by [`Compression::tag`].
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown tag.
    pub fn from_tag(tag: u8) -> CodecResult<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Snappy),
            other => Err(CodecError::decoding(format!("unknown compression tag {other}"))),
        }
    }
}
