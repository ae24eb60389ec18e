//! Storage trait definition.

use crate::error::StorageResult;
use std::fmt::Debug;

/// A byte-addressable store backing one segment file.
///
/// The store keeps an internal write cursor (`position`) and a physical
/// `length`. Reads are positional and never move the cursor.
///
/// # Invariants
///
/// - `position() <= length()` at all times
/// - writing past `length()` extends the store (grows the file or remaps)
/// - `read_at` returns the number of bytes actually available, `0` at EOF
/// - once [`Storage::mark_read_only`] is called every mutation fails
/// - `close` is idempotent
///
/// # Implementors
///
/// - [`super::DirectStorage`] - positioned syscalls
/// - [`super::MmapStorage`] - memory-mapped windows
/// - [`super::InMemoryStorage`] - for testing
pub trait Storage: Send + Sync + Debug {
    /// Writes `data` at the current cursor and advances it.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty, the store is read-only or
    /// closed, or an I/O error occurs.
    fn write(&mut self, data: &[u8]) -> StorageResult<usize>;

    /// Writes `data` at `position` without moving the cursor.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Storage::write`].
    fn write_at(&mut self, position: u64, data: &[u8]) -> StorageResult<usize>;

    /// Fills `buf` with bytes starting at `position`.
    ///
    /// Returns `min(buf.len(), length - position)`; the tail of `buf` past
    /// that count is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is closed or an I/O error occurs.
    fn read_at(&self, position: u64, buf: &mut [u8]) -> StorageResult<usize>;

    /// Physical length of the store in bytes.
    fn length(&self) -> u64;

    /// Current write cursor.
    fn position(&self) -> u64;

    /// Moves the write cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if `position` is beyond `length()`.
    fn set_position(&mut self, position: u64) -> StorageResult<()>;

    /// Cuts the store down (or extends it) to exactly `length` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadOnly`] on a read-only store.
    fn truncate(&mut self, length: u64) -> StorageResult<()>;

    /// Freezes the store; later writes and truncations fail.
    fn mark_read_only(&mut self);

    /// Returns true once [`Storage::mark_read_only`] was called.
    fn is_read_only(&self) -> bool;

    /// Forces written data to durable media.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Closes the store and removes its backing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be removed.
    fn delete(&mut self) -> StorageResult<()>;

    /// Flushes and releases every OS resource. Double close is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while releasing; the remaining
    /// resources are still released.
    fn close(&mut self) -> StorageResult<()>;

    /// File name (or a descriptive name for non-file stores).
    fn name(&self) -> &str;
}
