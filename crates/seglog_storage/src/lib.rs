//! # seglog storage
//!
//! Byte-addressable storage backends for the seglog segment files.
//!
//! Backends are **opaque byte stores**: they know nothing about records,
//! headers or checksums. A segment owns exactly one backend for its whole
//! lifetime and drives it through the [`Storage`] trait.
//!
//! ## Available Backends
//!
//! - [`DirectStorage`] - positioned read/write syscalls on a locked file
//! - [`MmapStorage`] - one or more memory-mapped windows with growth by remap
//! - [`InMemoryStorage`] - a `Vec<u8>` for tests
//!
//! ## Example
//!
//! ```rust
//! use seglog_storage::{InMemoryStorage, Storage};
//!
//! let mut storage = InMemoryStorage::new();
//! storage.write(b"hello world").unwrap();
//!
//! let mut buf = [0u8; 5];
//! let read = storage.read_at(6, &mut buf).unwrap();
//! assert_eq!(read, 5);
//! assert_eq!(&buf, b"world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod direct;
mod error;
mod memory;
mod mmap;

pub use backend::Storage;
pub use direct::DirectStorage;
pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStorage;
pub use mmap::{MmapStorage, WINDOW_ALIGNMENT};
