//! The `Serializer<T>` contract and built-in implementations.

use crate::error::{CodecError, CodecResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Converts records of type `T` to bytes and back.
///
/// Implementations must be stateless (or internally synchronized): one
/// serializer instance is shared by every reader and writer of a log.
pub trait Serializer<T>: Send + Sync {
    /// Appends the encoded form of `value` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be encoded.
    fn write_to(&self, value: &T, dst: &mut BytesMut) -> CodecResult<()>;

    /// Decodes one value from exactly `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not a valid encoding.
    fn from_bytes(&self, data: &[u8]) -> CodecResult<T>;

    /// Encodes `value` into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be encoded.
    fn to_bytes(&self, value: &T) -> CodecResult<Bytes> {
        let mut dst = BytesMut::new();
        self.write_to(value, &mut dst)?;
        Ok(dst.freeze())
    }
}

/// UTF-8 strings, stored without a length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer<String> for StringSerializer {
    fn write_to(&self, value: &String, dst: &mut BytesMut) -> CodecResult<()> {
        dst.put_slice(value.as_bytes());
        Ok(())
    }

    fn from_bytes(&self, data: &[u8]) -> CodecResult<String> {
        String::from_utf8(data.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Opaque byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn write_to(&self, value: &Vec<u8>, dst: &mut BytesMut) -> CodecResult<()> {
        dst.put_slice(value);
        Ok(())
    }

    fn from_bytes(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Little-endian `u64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl Serializer<u64> for U64Serializer {
    fn write_to(&self, value: &u64, dst: &mut BytesMut) -> CodecResult<()> {
        dst.put_u64_le(*value);
        Ok(())
    }

    fn from_bytes(&self, data: &[u8]) -> CodecResult<u64> {
        let raw: [u8; 8] = data.try_into().map_err(|_| CodecError::UnexpectedEof {
            needed: 8,
            available: data.len(),
        })?;
        Ok(u64::from_le_bytes(raw))
    }
}

/// Any `serde` type, encoded as CBOR.
pub struct CborSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborSerializer<T> {
    /// Creates a CBOR serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CborSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for CborSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CborSerializer")
    }
}

impl<T> Serializer<T> for CborSerializer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn write_to(&self, value: &T, dst: &mut BytesMut) -> CodecResult<()> {
        ciborium::into_writer(value, dst.writer()).map_err(|e| CodecError::EncodingFailed {
            message: e.to_string(),
        })
    }

    fn from_bytes(&self, data: &[u8]) -> CodecResult<T> {
        ciborium::from_reader(data).map_err(|e| CodecError::decoding(e.to_string()))
    }
}
