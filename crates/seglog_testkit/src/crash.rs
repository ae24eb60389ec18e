//! Crash and corruption injection.
//!
//! These helpers damage segment files the way a crash or bad disk would,
//! so tests can check what reopening recovers.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use seglog_testkit::crash::{flip_byte, truncate_file};
//!
//! log.close()?;
//! truncate_file(&segment, cut)?;      // crash mid-write
//! flip_byte(&segment, 64 + 8)?;       // bit rot in the first payload
//! ```

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Cuts the file at `path` down to `len` bytes.
pub fn truncate_file(path: &Path, len: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    debug!(path = %path.display(), len, "truncated file");
    Ok(())
}

/// Inverts every bit of the byte at `offset` and returns its old value.
pub fn flip_byte(path: &Path, offset: u64) -> io::Result<u8> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut byte)?;
    let original = byte[0];
    byte[0] = !original;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()?;
    debug!(path = %path.display(), offset, "flipped byte");
    Ok(original)
}

/// Appends `garbage` to the end of the file.
pub fn append_garbage(path: &Path, garbage: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(garbage)?;
    file.sync_all()?;
    debug!(path = %path.display(), bytes = garbage.len(), "appended garbage");
    Ok(())
}

/// Overwrites `len` bytes at `offset` with `fill`.
pub fn overwrite(path: &Path, offset: u64, len: usize, fill: u8) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&vec![fill; len])?;
    file.sync_all()?;
    debug!(path = %path.display(), offset, len, "overwrote bytes");
    Ok(())
}
