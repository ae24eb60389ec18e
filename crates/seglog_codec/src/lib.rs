//! # seglog codec
//!
//! Turns records into bytes and back, and compresses block payloads.
//!
//! The log core is generic over the record type `T` and never looks inside
//! a payload: it only needs a [`Serializer<T>`] to produce and consume
//! byte buffers. Built-in serializers cover strings, raw bytes, integers
//! and any `serde` type (as CBOR).
//!
//! ## Usage
//!
//! ```
//! use seglog_codec::{Compression, Serializer, StringSerializer};
//!
//! let bytes = StringSerializer.to_bytes(&"hello".to_string()).unwrap();
//! assert_eq!(StringSerializer.from_bytes(&bytes).unwrap(), "hello");
//!
//! let packed = Compression::Snappy.compress(&bytes).unwrap();
//! assert_eq!(Compression::Snappy.decompress(&packed).unwrap(), bytes.to_vec());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod compression;
mod error;
mod serializer;

pub use compression::Compression;
pub use error::{CodecError, CodecResult};
pub use serializer::{BytesSerializer, CborSerializer, Serializer, StringSerializer, U64Serializer};
