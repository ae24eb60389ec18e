//! Memory-mapped storage with windowed growth.

use crate::backend::Storage;
use crate::error::{StorageError, StorageResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Window sizes must be a multiple of this (the largest common mmap
/// offset granularity, Windows' 64 KiB allocation granularity).
pub const WINDOW_ALIGNMENT: u64 = 64 * 1024;

/// A file-backed store accessed through memory-mapped windows.
///
/// With no window size the whole file is one mapping, and growing it
/// unmaps and remaps the file. With a window size the file is covered by
/// fixed windows; growth maps new windows without touching the existing
/// ones, and a write that would straddle two windows is rejected.
///
/// Reads copy out of the mapping while holding `&self`, and every remap
/// needs `&mut self`, so no view of an old mapping can outlive a remap.
#[derive(Debug)]
pub struct MmapStorage {
    path: PathBuf,
    name: String,
    file: Option<File>,
    windows: Vec<MmapMut>,
    window_size: Option<u64>,
    position: u64,
    length: u64,
    read_only: bool,
}

impl MmapStorage {
    /// Creates a new file of `length` bytes and maps it.
    ///
    /// With a `window_size`, the length is rounded up to whole windows.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists, `length` is zero, the window
    /// size is not aligned, or mapping fails.
    pub fn create(path: &Path, length: u64, window_size: Option<u64>) -> StorageResult<Self> {
        if length == 0 {
            return Err(StorageError::InvalidConfig(
                "storage length must be greater than zero".into(),
            ));
        }
        validate_window(window_size)?;
        let length = match window_size {
            Some(window) => round_up(length, window),
            None => length,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        lock(&file, path)?;
        file.set_len(length)?;

        let mut storage = Self::from_parts(path, file, window_size, 0, length);
        storage.map_missing()?;
        debug!(path = ?path, length, ?window_size, "created mmap storage");
        Ok(storage)
    }

    /// Opens and maps an existing file. The cursor is placed at its end.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, locked or mapped.
    pub fn open(path: &Path, window_size: Option<u64>) -> StorageResult<Self> {
        validate_window(window_size)?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        lock(&file, path)?;
        let length = file.metadata()?.len();

        let mut storage = Self::from_parts(path, file, window_size, length, length);
        storage.map_missing()?;
        Ok(storage)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn from_parts(
        path: &Path,
        file: File,
        window_size: Option<u64>,
        position: u64,
        length: u64,
    ) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            name,
            file: Some(file),
            windows: Vec::new(),
            window_size,
            position,
            length,
            read_only: false,
        }
    }

    fn file(&self) -> StorageResult<&File> {
        self.file.as_ref().ok_or(StorageError::Closed)
    }

    fn window_span(&self) -> u64 {
        self.window_size.unwrap_or(self.length.max(1))
    }

    /// Maps every region of `[0, length)` not yet covered by a window.
    ///
    /// The last window may be partial when the length is not a multiple
    /// of the window size; it is dropped and remapped on the next growth.
    fn map_missing(&mut self) -> StorageResult<()> {
        let span = self.window_span();
        let mut mapped: u64 = self.windows.iter().map(|w| w.len() as u64).sum();
        while mapped < self.length {
            let len = (self.length - mapped).min(span);
            let window = map_region(self.file()?, mapped, len as usize)?;
            self.windows.push(window);
            mapped += len;
        }
        Ok(())
    }

    fn unmap(&mut self) -> StorageResult<()> {
        for window in &self.windows {
            window.flush()?;
        }
        self.windows.clear();
        Ok(())
    }

    fn resize(&mut self, length: u64) -> StorageResult<()> {
        match self.window_size {
            None => self.unmap()?,
            Some(window) => {
                // Drop partial and now out-of-range windows; full windows
                // inside the new length stay mapped.
                let keep = (length.min(self.length) / window) as usize;
                for dropped in self.windows.drain(keep..) {
                    dropped.flush()?;
                }
            }
        }
        self.file()?.set_len(length)?;
        self.length = length;
        self.map_missing()
    }

    fn grow(&mut self, required: u64) -> StorageResult<()> {
        let target = match self.window_size {
            Some(window) => round_up(required, window),
            None => required.max(self.length + self.length / 2),
        };
        debug!(path = ?self.path, from = self.length, to = target, "growing mmap storage");
        self.resize(target)
    }

    fn locate(&self, position: u64) -> (usize, usize) {
        let span = self.window_span();
        match self.window_size {
            Some(_) => ((position / span) as usize, (position % span) as usize),
            None => (0, position as usize),
        }
    }

    fn check_writable(&self, position: u64, data: &[u8]) -> StorageResult<()> {
        if self.file.is_none() {
            return Err(StorageError::Closed);
        }
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if data.is_empty() {
            return Err(StorageError::EmptyWrite);
        }
        if let Some(window) = self.window_size {
            if position % window + data.len() as u64 > window {
                return Err(StorageError::SplitRecord {
                    position,
                    len: data.len(),
                    window,
                });
            }
        }
        Ok(())
    }
}

impl Storage for MmapStorage {
    fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        let written = self.write_at(self.position, data)?;
        self.position += written as u64;
        Ok(written)
    }

    fn write_at(&mut self, position: u64, data: &[u8]) -> StorageResult<usize> {
        self.check_writable(position, data)?;
        let end = position + data.len() as u64;
        if end > self.length {
            self.grow(end)?;
        }
        let (index, offset) = self.locate(position);
        let window = self
            .windows
            .get_mut(index)
            .ok_or(StorageError::PositionOutOfBounds {
                position,
                length: self.length,
            })?;
        window[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> StorageResult<usize> {
        self.file()?;
        if position >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let available = (self.length - position).min(buf.len() as u64) as usize;
        let mut filled = 0;
        while filled < available {
            let (index, offset) = self.locate(position + filled as u64);
            let Some(window) = self.windows.get(index) else {
                break;
            };
            let chunk = (window.len() - offset).min(available - filled);
            buf[filled..filled + chunk].copy_from_slice(&window[offset..offset + chunk]);
            filled += chunk;
        }
        Ok(filled)
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> StorageResult<()> {
        if position > self.length {
            return Err(StorageError::PositionOutOfBounds {
                position,
                length: self.length,
            });
        }
        self.position = position;
        Ok(())
    }

    fn truncate(&mut self, length: u64) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        self.file()?;
        self.resize(length)?;
        self.position = self.position.min(length);
        Ok(())
    }

    fn mark_read_only(&mut self) {
        self.read_only = true;
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file()?;
        for window in &self.windows {
            window.flush()?;
        }
        Ok(())
    }

    fn delete(&mut self) -> StorageResult<()> {
        if let Err(e) = self.close() {
            warn!(path = ?self.path, error = %e, "close before delete failed");
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> StorageResult<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let mut first_error = None;
        for window in self.windows.drain(..) {
            if let Err(e) = window.flush() {
                first_error.get_or_insert(StorageError::from(e));
            }
        }
        if let Err(e) = file.sync_all() {
            first_error.get_or_insert(StorageError::from(e));
        }
        if let Err(e) = fs2::FileExt::unlock(&file) {
            warn!(path = ?self.path, error = %e, "failed to release file lock");
        }
        first_error.map_or(Ok(()), Err)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = ?self.path, error = %e, "failed to close storage on drop");
        }
    }
}

#[allow(unsafe_code)]
fn map_region(file: &File, offset: u64, len: usize) -> StorageResult<MmapMut> {
    // SAFETY: the file is exclusively locked by the owning `MmapStorage`,
    // the region lies within the file's current length, and the mapping is
    // dropped before the file is shrunk or closed.
    let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file)? };
    Ok(map)
}

fn lock(file: &File, path: &Path) -> StorageResult<()> {
    fs2::FileExt::try_lock_exclusive(file).map_err(|_| StorageError::Locked(path.to_path_buf()))
}

fn validate_window(window_size: Option<u64>) -> StorageResult<()> {
    match window_size {
        Some(window) if window == 0 || window % WINDOW_ALIGNMENT != 0 => {
            Err(StorageError::InvalidConfig(format!(
                "window size {window} must be a non-zero multiple of {WINDOW_ALIGNMENT}"
            )))
        }
        _ => Ok(()),
    }
}

fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple).max(1) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mmap_write_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut storage = MmapStorage::create(&path, 1024, None).unwrap();
        storage.write(b"hello").unwrap();
        storage.write(b" world").unwrap();

        let mut buf = [0u8; 11];
        assert_eq!(storage.read_at(0, &mut buf).unwrap(), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(storage.position(), 11);
    }

    #[test]
    fn mmap_grows_past_mapped_region() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut storage = MmapStorage::create(&path, 8, None).unwrap();
        storage.write(b"01234567").unwrap();
        storage.write(b"89abcdef").unwrap();
        assert!(storage.length() >= 16);

        let mut buf = [0u8; 16];
        storage.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789abcdef");
    }

    #[test]
    fn mmap_window_split_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");
        let window = WINDOW_ALIGNMENT;

        let mut storage = MmapStorage::create(&path, window, Some(window)).unwrap();
        storage.set_position(window - 4).unwrap();

        let result = storage.write(&[1u8; 8]);
        assert!(matches!(result, Err(StorageError::SplitRecord { .. })));

        storage.set_position(window).unwrap();
        storage.write(&[2u8; 8]).unwrap();
        assert_eq!(storage.length(), 2 * window);
    }

    #[test]
    fn mmap_reads_span_windows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");
        let window = WINDOW_ALIGNMENT;

        let mut storage = MmapStorage::create(&path, 2 * window, Some(window)).unwrap();
        storage.write_at(window - 2, b"ab").unwrap();
        storage.write_at(window, b"cd").unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(storage.read_at(window - 2, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn mmap_invalid_window_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        let result = MmapStorage::create(&path, 1024, Some(1000));
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn mmap_truncate_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        {
            let mut storage = MmapStorage::create(&path, 4096, None).unwrap();
            storage.write(b"keep").unwrap();
            storage.truncate(4).unwrap();
            storage.close().unwrap();
        }

        let storage = MmapStorage::open(&path, None).unwrap();
        assert_eq!(storage.length(), 4);
        let mut buf = [0u8; 4];
        storage.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"keep");
    }

    #[test]
    fn mmap_read_only_truncate_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut storage = MmapStorage::create(&path, 64, None).unwrap();
        storage.write(b"x").unwrap();
        storage.mark_read_only();

        assert!(matches!(storage.truncate(1), Err(StorageError::ReadOnly)));
        assert!(matches!(storage.write(b"y"), Err(StorageError::ReadOnly)));
    }

    #[test]
    fn mmap_empty_write_rejected_and_delete() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.log");

        let mut storage = MmapStorage::create(&path, 64, None).unwrap();
        assert!(matches!(storage.write(b""), Err(StorageError::EmptyWrite)));

        storage.delete().unwrap();
        storage.close().unwrap();
        assert!(!path.exists());
    }
}
