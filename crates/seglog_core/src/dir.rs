//! Log directory management.
//!
//! ```text
//! <log_dir>/
//! ├─ LOCK                                   # held for the appender's lifetime
//! ├─ STATE                                  # CBOR appender state
//! ├─ segment-00000001-1a2b3c4d.log          # segment files
//! └─ index-00000001-...-MIDPOINT.dat        # index side files
//! ```

use crate::error::{CoreError, CoreResult};
use crate::state::AppenderState;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "STATE";
const STATE_TEMP: &str = "STATE.tmp";

/// Segment file extension.
pub const SEGMENT_EXTENSION: &str = "log";

/// An exclusively locked log directory.
///
/// Only one `LogDir` can exist per directory at a time; the lock is
/// released when it is dropped.
#[derive(Debug)]
pub struct LogDir {
    path: PathBuf,
    _lock_file: File,
}

impl LogDir {
    /// Opens (creating if needed) and locks a log directory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Locked`] if another appender holds the lock.
    pub fn open(path: &Path) -> CoreResult<Self> {
        fs::create_dir_all(path)?;
        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked {
                path: path.to_path_buf(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a file inside the directory.
    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Loads the persisted state, `None` for a fresh directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file exists but cannot be read.
    pub fn load_state(&self) -> CoreResult<Option<AppenderState>> {
        let path = self.path.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.is_empty() {
            return Ok(None);
        }
        AppenderState::decode(&data).map(Some)
    }

    /// Saves the state atomically (temp file, fsync, rename, dir fsync).
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the previous state stays intact.
    pub fn save_state(&self, state: &AppenderState) -> CoreResult<()> {
        let temp_path = self.path.join(STATE_TEMP);
        let data = state.encode()?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(STATE_FILE))?;
        self.sync_directory()
    }

    /// Names of all segment files in the directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn segment_files(&self, prefix: &str) -> CoreResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let path = Path::new(&name);
            let is_segment = path.extension().is_some_and(|ext| ext == SEGMENT_EXTENSION)
                && name.starts_with(prefix)
                && name[prefix.len()..].starts_with('-');
            if is_segment && entry.file_type()?.is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("log");
        let dir = LogDir::open(&path).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _dir = LogDir::open(temp.path()).unwrap();
        let result = LogDir::open(temp.path());
        assert!(matches!(result, Err(CoreError::Locked { .. })));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(LogDir::open(temp.path()).unwrap());
        LogDir::open(temp.path()).unwrap();
    }

    #[test]
    fn state_save_and_load() {
        let temp = tempdir().unwrap();
        let dir = LogDir::open(temp.path()).unwrap();
        assert!(dir.load_state().unwrap().is_none());

        let mut state = AppenderState::new(18);
        state.entry_count = 99;
        dir.save_state(&state).unwrap();
        assert_eq!(dir.load_state().unwrap(), Some(state));
        assert!(!temp.path().join(STATE_TEMP).exists());
    }

    #[test]
    fn segment_files_filters_by_prefix() {
        let temp = tempdir().unwrap();
        let dir = LogDir::open(temp.path()).unwrap();
        for name in [
            "segment-00000002-aaaaaaaa.log",
            "segment-00000001-bbbbbbbb.log",
            "index-00000001-cccccccc.log",
            "segmentx-00000001-dddddddd.log",
            "segment-00000001-bbbbbbbb-MIDPOINT.dat",
        ] {
            File::create(temp.path().join(name)).unwrap();
        }

        assert_eq!(
            dir.segment_files("segment").unwrap(),
            vec!["segment-00000001-bbbbbbbb.log", "segment-00000002-aaaaaaaa.log"]
        );
        assert_eq!(dir.segment_files("index").unwrap(), vec!["index-00000001-cccccccc.log"]);
    }
}
