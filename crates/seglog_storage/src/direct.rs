//! Direct file storage using positioned read/write syscalls.

use crate::backend::Storage;
use crate::error::{StorageError, StorageResult};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file-backed store that issues one positioned syscall per read/write.
///
/// Nothing is cached in process memory, so files larger than the address
/// space are fine. The file is exclusively locked (`fs2`) from open until
/// close.
///
/// # Example
///
/// ```no_run
/// use seglog_storage::{DirectStorage, Storage};
/// use std::path::Path;
///
/// let mut storage = DirectStorage::create(Path::new("segment.log"), 4096).unwrap();
/// storage.write(b"persistent data").unwrap();
/// storage.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct DirectStorage {
    path: PathBuf,
    name: String,
    file: Option<File>,
    position: u64,
    length: u64,
    read_only: bool,
}

impl DirectStorage {
    /// Creates a new file preallocated (sparse) to `length` bytes.
    ///
    /// The cursor starts at 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists, cannot be locked, or
    /// `length` is zero.
    pub fn create(path: &Path, length: u64) -> StorageResult<Self> {
        if length == 0 {
            return Err(StorageError::InvalidConfig(
                "storage length must be greater than zero".into(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        lock(&file, path)?;
        file.set_len(length)?;
        debug!(path = ?path, length, "created direct storage");
        Ok(Self::from_parts(path, file, 0, length))
    }

    /// Opens an existing file. The cursor is placed at the end of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be locked.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        lock(&file, path)?;
        let length = file.metadata()?.len();
        Ok(Self::from_parts(path, file, length, length))
    }

    /// Opens (or creates) a file that must be at least `length` bytes.
    ///
    /// A shorter existing file is an error unless `grow` is set, in which
    /// case the file is extended. The cursor starts at 0.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ShorterThanExpected`] for a short file without
    /// `grow`, or any I/O/locking error.
    pub fn open_with_length(path: &Path, length: u64, grow: bool) -> StorageResult<Self> {
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock(&file, path)?;

        let actual = file.metadata()?.len();
        if actual < length {
            if existed && !grow {
                unlock(&file, path);
                return Err(StorageError::ShorterThanExpected {
                    path: path.to_path_buf(),
                    actual,
                    expected: length,
                });
            }
            file.set_len(length)?;
        }
        let length = actual.max(length);
        Ok(Self::from_parts(path, file, 0, length))
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn from_parts(path: &Path, file: File, position: u64, length: u64) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            name,
            file: Some(file),
            position,
            length,
            read_only: false,
        }
    }

    fn file(&self) -> StorageResult<&File> {
        self.file.as_ref().ok_or(StorageError::Closed)
    }

    fn check_writable(&self, data: &[u8]) -> StorageResult<()> {
        if self.file.is_none() {
            return Err(StorageError::Closed);
        }
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        if data.is_empty() {
            return Err(StorageError::EmptyWrite);
        }
        Ok(())
    }
}

impl Storage for DirectStorage {
    fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        let written = self.write_at(self.position, data)?;
        self.position += written as u64;
        Ok(written)
    }

    fn write_at(&mut self, position: u64, data: &[u8]) -> StorageResult<usize> {
        self.check_writable(data)?;
        write_all_at(self.file()?, data, position)?;
        self.length = self.length.max(position + data.len() as u64);
        Ok(data.len())
    }

    fn read_at(&self, position: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let file = self.file()?;
        if position >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let available = (self.length - position).min(buf.len() as u64) as usize;
        let mut filled = 0;
        while filled < available {
            let read = read_at(file, &mut buf[filled..available], position + filled as u64)?;
            if read == 0 {
                break;
            }
            filled += read;
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
        let file = self.file()?;
        file.set_len(length)?;
        file.sync_all()?;
        self.length = length;
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
        self.file()?.sync_data()?;
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
        let synced = file.sync_all();
        unlock(&file, &self.path);
        synced?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DirectStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = ?self.path, error = %e, "failed to close storage on drop");
        }
    }
}

fn lock(file: &File, path: &Path) -> StorageResult<()> {
    fs2::FileExt::try_lock_exclusive(file).map_err(|_| StorageError::Locked(path.to_path_buf()))
}

fn unlock(file: &File, path: &Path) {
    if let Err(e) = fs2::FileExt::unlock(file) {
        warn!(path = ?path, error = %e, "failed to release file lock");
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, data, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    while !data.is_empty() {
        let written = std::os::windows::fs::FileExt::seek_write(file, data, offset)?;
        if written == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "failed to write whole buffer"));
        }
        data = &data[written..];
        offset += written as u64;
    }
    Ok(())
}
