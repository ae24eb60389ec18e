use super::header::{Header, SegmentType, EOL, LOG_START};
use super::{Direction, Log, LogIterator, SegmentInfo};
use crate::error::{CoreError, CoreResult};
use crate::reader::{BufferedReader, ChecksumPolicy, DataReader};
use crate::record::{self, HEADER_SIZE, OVERHEAD};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{RwLock, RwLockWriteGuard};
use seglog_codec::Serializer;
use seglog_storage::{Storage, StorageError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const SCAN_BUFFER_SIZE: usize = 4096;

/// Result of scanning a segment's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    /// Offset right after the last good record.
    pub position: u64,
    /// Number of good records.
    pub entries: u64,
    /// Whether a damaged tail was discarded.
    pub truncated: bool,
}

/// Frontier and record count of a live segment recorded by an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Offset right after the last record known to be written.
    pub position: u64,
    /// Records before `position`.
    pub entries: u64,
}

/// Shared state of one segment file.
///
/// Every [`Segment`] handle and iterator holds an `Arc` of this; the file
/// is closed (or removed, after [`SegmentInfo::delete`]) when the last one
/// goes away.
pub(crate) struct SegmentCore {
    name: String,
    storage: RwLock<Box<dyn Storage>>,
    reader: Arc<dyn DataReader>,
    header: RwLock<Header>,
    entries: AtomicU64,
    /// Write frontier; readers never look past it.
    position: AtomicU64,
    closed: AtomicBool,
    read_only: AtomicBool,
    delete_on_drop: AtomicBool,
}

impl SegmentCore {
    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    fn frontier(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }
}

impl Drop for SegmentCore {
    fn drop(&mut self) {
        let storage = self.storage.get_mut();
        if self.delete_on_drop.load(Ordering::Acquire) {
            debug!(segment = %self.name, "removing segment file");
            if let Err(e) = storage.delete() {
                warn!(segment = %self.name, error = %e, "failed to delete segment");
            }
        } else if let Err(e) = storage.close() {
            warn!(segment = %self.name, error = %e, "failed to close segment");
        }
    }
}

/// A segment of plain framed records.
pub struct Segment<T> {
    core: Arc<SegmentCore>,
    serializer: Arc<dyn Serializer<T>>,
}

impl<T> Clone for Segment<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

impl<T> fmt::Debug for Segment<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.core.name)
            .field("position", &self.core.frontier())
            .field("entries", &self.core.entries.load(Ordering::Acquire))
            .field("read_only", &self.core.read_only.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send + 'static> Segment<T> {
    /// Writes a fresh header into `storage` and returns an empty segment.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be written.
    pub fn create(
        mut storage: Box<dyn Storage>,
        serializer: Arc<dyn Serializer<T>>,
        reader: Arc<dyn DataReader>,
        id: u64,
        level: u32,
        segment_type: SegmentType,
    ) -> CoreResult<Self> {
        let header = Header::new(id, level, segment_type);
        header.write_to(&mut *storage)?;
        storage.set_position(LOG_START)?;
        Ok(Self::from_parts(storage, serializer, reader, header, LOG_START, 0))
    }

    /// Opens a segment written earlier.
    ///
    /// Rolled segments trust their header. Live and merge-target
    /// segments are rescanned and a damaged tail is cut off.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is damaged or the scan fails on I/O.
    pub fn open(
        storage: Box<dyn Storage>,
        serializer: Arc<dyn Serializer<T>>,
        reader: Arc<dyn DataReader>,
    ) -> CoreResult<Self> {
        Self::open_at(storage, serializer, reader, None)
    }

    /// Opens a segment written earlier, resuming a live segment's scan at
    /// `checkpoint` instead of its first record.
    ///
    /// A checkpoint that does not end on a valid record is ignored and
    /// the whole segment is rescanned.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is damaged or the scan fails on I/O.
    pub fn open_at(
        mut storage: Box<dyn Storage>,
        serializer: Arc<dyn Serializer<T>>,
        reader: Arc<dyn DataReader>,
        checkpoint: Option<Checkpoint>,
    ) -> CoreResult<Self> {
        let header = Header::read_from(&*storage)?;
        if header.segment_type == SegmentType::ReadOnly {
            storage.mark_read_only();
            let (log_end, entries) = (header.log_end, header.entries);
            let segment = Self::from_parts(storage, serializer, reader, header, log_end, entries);
            segment.core.read_only.store(true, Ordering::Release);
            return Ok(segment);
        }

        let segment = Self::from_parts(storage, serializer, reader, header, LOG_START, 0);
        let state = match checkpoint {
            Some(checkpoint) => match segment.resume_state(checkpoint) {
                Ok(state) => state,
                Err(e) if e.is_corruption() || matches!(e, CoreError::InvalidArgument { .. }) => {
                    warn!(
                        segment = %segment.core.name,
                        position = checkpoint.position,
                        error = %e,
                        "checkpoint does not match the segment, rescanning"
                    );
                    segment.rebuild_state(LOG_START)?
                }
                Err(e) => return Err(e),
            },
            None => segment.rebuild_state(LOG_START)?,
        };
        debug!(
            segment = %segment.core.name,
            entries = state.entries,
            position = state.position,
            "reopened live segment"
        );
        Ok(segment)
    }

    fn from_parts(
        storage: Box<dyn Storage>,
        serializer: Arc<dyn Serializer<T>>,
        reader: Arc<dyn DataReader>,
        header: Header,
        position: u64,
        entries: u64,
    ) -> Self {
        let core = SegmentCore {
            name: storage.name().to_string(),
            storage: RwLock::new(storage),
            reader,
            header: RwLock::new(header),
            entries: AtomicU64::new(entries),
            position: AtomicU64::new(position),
            closed: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            delete_on_drop: AtomicBool::new(false),
        };
        Self {
            core: Arc::new(core),
            serializer,
        }
    }

    /// Snapshot of the header.
    #[must_use]
    pub fn header(&self) -> Header {
        self.core.header.read().clone()
    }

    /// Rescans records from `last_known` and repairs the in-memory
    /// frontier and entry count.
    ///
    /// Records before `last_known` are only counted; records from there on
    /// have their checksum verified. The scan stops at the end marker or
    /// at the first damaged record, in which case the file is cut at the
    /// last good boundary.
    ///
    /// # Errors
    ///
    /// Fails on a rolled segment, or if `last_known` is outside the file.
    pub fn rebuild_state(&self, last_known: u64) -> CoreResult<SegmentState> {
        let mut storage = self.lock_for_repair(last_known)?;
        let start = SegmentState {
            position: LOG_START,
            entries: 0,
            truncated: false,
        };
        self.repair(&mut **storage, start, last_known)
    }

    /// Takes `checkpoint` as given and scans only the records after it.
    ///
    /// The record ending at the checkpoint is verified first, so a stale
    /// or foreign checkpoint is refused instead of trusted.
    ///
    /// # Errors
    ///
    /// Fails on a rolled segment, a checkpoint outside the file, or a
    /// checkpoint that does not end on a valid record.
    pub fn resume_state(&self, checkpoint: Checkpoint) -> CoreResult<SegmentState> {
        let mut storage = self.lock_for_repair(checkpoint.position)?;
        if checkpoint.position == LOG_START {
            if checkpoint.entries != 0 {
                return Err(CoreError::corrupted(format!(
                    "checkpoint claims {} records in empty segment {}",
                    checkpoint.entries, self.core.name
                )));
            }
        } else {
            if checkpoint.entries == 0 {
                return Err(CoreError::corrupted(format!(
                    "checkpoint at {} of segment {} claims no records",
                    checkpoint.position, self.core.name
                )));
            }
            let mut verifying = BufferedReader::new(SCAN_BUFFER_SIZE, ChecksumPolicy::always());
            verifying.read_backward(&**storage, checkpoint.position)?;
        }
        let start = SegmentState {
            position: checkpoint.position,
            entries: checkpoint.entries,
            truncated: false,
        };
        self.repair(&mut **storage, start, checkpoint.position)
    }

    fn lock_for_repair(&self, position: u64) -> CoreResult<RwLockWriteGuard<'_, Box<dyn Storage>>> {
        self.core.check_open()?;
        if self.core.read_only.load(Ordering::Acquire) {
            return Err(CoreError::read_only(self.core.name.clone()));
        }
        let storage = self.core.storage.write();
        if position < LOG_START || position > storage.length() {
            return Err(CoreError::invalid_argument(format!(
                "rebuild position {position} outside of segment {}",
                self.core.name
            )));
        }
        Ok(storage)
    }

    /// Walks forward from `state`, cuts a damaged tail and installs the
    /// result.
    fn repair(
        &self,
        storage: &mut dyn Storage,
        mut state: SegmentState,
        last_known: u64,
    ) -> CoreResult<SegmentState> {
        let mut counting = BufferedReader::growing(SCAN_BUFFER_SIZE, ChecksumPolicy::never());
        let mut verifying = BufferedReader::growing(SCAN_BUFFER_SIZE, ChecksumPolicy::always());
        loop {
            let reader = if state.position < last_known {
                &mut counting
            } else {
                &mut verifying
            };
            match reader.read_forward(&*storage, state.position) {
                Ok(payload) if payload.is_empty() => break,
                Ok(payload) => {
                    state.position += (payload.len() + OVERHEAD) as u64;
                    state.entries += 1;
                }
                Err(e) if e.is_corruption() => {
                    warn!(
                        segment = %self.core.name,
                        position = state.position,
                        error = %e,
                        "discarding damaged segment tail"
                    );
                    state.truncated = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if state.truncated {
            storage.truncate(state.position)?;
        }
        storage.set_position(state.position)?;
        self.core.entries.store(state.entries, Ordering::Release);
        self.core.position.store(state.position, Ordering::Release);
        Ok(state)
    }

    /// Verifies every record up to the frontier.
    ///
    /// # Errors
    ///
    /// Returns the first corruption found, or a corruption error if the
    /// record count disagrees with the segment's own bookkeeping.
    pub fn check_integrity(&self) -> CoreResult<SegmentState> {
        self.core.check_open()?;
        let storage = self.core.storage.read();
        let end = self.core.frontier();
        let mut reader = BufferedReader::growing(SCAN_BUFFER_SIZE, ChecksumPolicy::always());
        let mut state = SegmentState {
            position: LOG_START,
            entries: 0,
            truncated: false,
        };
        while state.position < end {
            let payload = reader.read_forward(&**storage, state.position)?;
            if payload.is_empty() {
                break;
            }
            state.position += (payload.len() + OVERHEAD) as u64;
            state.entries += 1;
        }
        if state.position != end {
            return Err(CoreError::corrupted(format!(
                "segment {} ends at {} but records end at {}",
                self.core.name, end, state.position
            )));
        }
        let expected = self.core.entries.load(Ordering::Acquire);
        if state.entries != expected {
            return Err(CoreError::corrupted(format!(
                "segment {} holds {} records, expected {expected}",
                self.core.name, state.entries
            )));
        }
        Ok(state)
    }

    /// Freezes the segment at `level`, storing `footer` after the end marker.
    ///
    /// # Errors
    ///
    /// Fails if the segment is already read-only or on I/O errors.
    pub fn roll_with_footer(&self, level: u32, footer: Option<&[u8]>) -> CoreResult<()> {
        self.core.check_open()?;
        let mut storage = self.core.storage.write();
        if self.core.read_only.load(Ordering::Acquire) {
            return Err(CoreError::read_only(self.core.name.clone()));
        }

        let log_end = self.core.frontier();
        storage.set_position(log_end)?;
        match storage.write(&EOL) {
            Ok(_) => {}
            // the header bounds a rolled log; the footer starts on the next window
            Err(StorageError::SplitRecord { position, window, .. }) => {
                storage.set_position(position.div_ceil(window) * window)?;
            }
            Err(e) => return Err(e.into()),
        }
        let footer_start = storage.position();
        let footer_len = match footer {
            Some(blob) if !blob.is_empty() => {
                storage.write(blob)?;
                blob.len() as u64
            }
            _ => 0,
        };

        let mut header = self.core.header.write();
        header.segment_type = SegmentType::ReadOnly;
        header.level = level;
        header.entries = self.core.entries.load(Ordering::Acquire);
        header.log_end = log_end;
        header.footer_start = if footer_len > 0 { footer_start } else { 0 };
        header.footer_len = footer_len;
        header.write_to(&mut **storage)?;

        let end = storage.position();
        storage.truncate(end)?;
        storage.flush()?;
        storage.mark_read_only();
        self.core.read_only.store(true, Ordering::Release);
        debug!(segment = %self.core.name, level, entries = header.entries, "segment rolled");
        Ok(())
    }

    /// Footer blob stored at roll time.
    ///
    /// # Errors
    ///
    /// Returns an error if the footer cannot be read in full.
    pub fn footer(&self) -> CoreResult<Option<Bytes>> {
        self.core.check_open()?;
        let (start, len) = {
            let header = self.core.header.read();
            (header.footer_start, header.footer_len)
        };
        if len == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; len as usize];
        let read = self.core.storage.read().read_at(start, &mut buf)?;
        if read as u64 != len {
            return Err(CoreError::corrupted(format!(
                "footer of segment {} truncated: {read} of {len} bytes",
                self.core.name
            )));
        }
        Ok(Some(Bytes::from(buf)))
    }

    fn iterator(&self, position: u64, direction: Direction) -> SegmentIterator<T> {
        SegmentIterator {
            core: Arc::clone(&self.core),
            serializer: Arc::clone(&self.serializer),
            position,
            direction,
            failed: false,
        }
    }
}

impl<T: Send + 'static> SegmentInfo for Segment<T> {
    fn id(&self) -> u64 {
        self.core.header.read().id
    }

    fn name(&self) -> &str {
        &self.core.name
    }

    fn level(&self) -> u32 {
        self.core.header.read().level
    }

    fn created(&self) -> u64 {
        self.core.header.read().created
    }

    fn entries(&self) -> u64 {
        self.core.entries.load(Ordering::Acquire)
    }

    fn position(&self) -> u64 {
        self.core.frontier()
    }

    fn size(&self) -> u64 {
        self.core.frontier() - LOG_START
    }

    fn is_read_only(&self) -> bool {
        self.core.read_only.load(Ordering::Acquire)
    }

    fn flush(&self) -> CoreResult<()> {
        if self.core.closed.load(Ordering::Acquire) || self.is_read_only() {
            return Ok(());
        }
        self.core.storage.write().flush()?;
        Ok(())
    }

    fn roll(&self, level: u32) -> CoreResult<()> {
        self.roll_with_footer(level, None)
    }

    fn delete(&self) {
        self.core.delete_on_drop.store(true, Ordering::Release);
    }

    fn close(&self) -> CoreResult<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.core.storage.write().close()?;
        Ok(())
    }
}

impl<T: Send + 'static> Log<T> for Segment<T> {
    fn append(&self, record: &T) -> CoreResult<u64> {
        self.core.check_open()?;
        let mut frame = BytesMut::with_capacity(256);
        frame.put_bytes(0, HEADER_SIZE);
        self.serializer.write_to(record, &mut frame)?;
        record::seal(&mut frame)?;

        let mut storage = self.core.storage.write();
        if self.core.read_only.load(Ordering::Acquire) {
            return Err(CoreError::read_only(self.core.name.clone()));
        }
        let position = self.core.frontier();
        storage.write(&frame)?;
        self.core.entries.fetch_add(1, Ordering::AcqRel);
        self.core
            .position
            .store(position + frame.len() as u64, Ordering::Release);
        Ok(position)
    }

    fn get(&self, position: u64) -> CoreResult<Option<T>> {
        self.core.check_open()?;
        if position < LOG_START || position >= self.core.frontier() {
            return Ok(None);
        }
        let payload = {
            let storage = self.core.storage.read();
            self.core.reader.read_forward(&**storage, position)?
        };
        if payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.serializer.from_bytes(&payload)?))
    }

    fn iter(&self, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>> {
        self.core.check_open()?;
        let start = match direction {
            Direction::Forward => LOG_START,
            Direction::Backward => self.core.frontier(),
        };
        Ok(Box::new(self.iterator(start, direction)))
    }

    fn iter_from(&self, position: u64, direction: Direction) -> CoreResult<Box<dyn LogIterator<T>>> {
        self.core.check_open()?;
        if position < LOG_START || position > self.core.frontier() {
            return Err(CoreError::invalid_argument(format!(
                "position {position} outside of segment {}",
                self.core.name
            )));
        }
        Ok(Box::new(self.iterator(position, direction)))
    }
}

/// Iterator over the records of one [`Segment`].
///
/// Forward iteration stops at the write frontier current at each call,
/// so a caught-up iterator picks up later appends. An error ends the
/// iteration for good.
pub struct SegmentIterator<T> {
    core: Arc<SegmentCore>,
    serializer: Arc<dyn Serializer<T>>,
    position: u64,
    direction: Direction,
    failed: bool,
}

impl<T> SegmentIterator<T> {
    fn read_next(&mut self) -> CoreResult<Option<Bytes>> {
        self.core.check_open()?;
        let storage = self.core.storage.read();
        match self.direction {
            Direction::Forward => {
                if self.position >= self.core.frontier() {
                    return Ok(None);
                }
                let payload = self.core.reader.read_forward(&**storage, self.position)?;
                if payload.is_empty() {
                    return Ok(None);
                }
                self.position += (payload.len() + OVERHEAD) as u64;
                Ok(Some(payload))
            }
            Direction::Backward => {
                if self.position <= LOG_START {
                    return Ok(None);
                }
                let payload = self.core.reader.read_backward(&**storage, self.position)?;
                if payload.is_empty() {
                    return Ok(None);
                }
                self.position -= (payload.len() + OVERHEAD) as u64;
                Ok(Some(payload))
            }
        }
    }
}

impl<T> Iterator for SegmentIterator<T> {
    type Item = CoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self
            .read_next()
            .and_then(|payload| match payload {
                Some(bytes) => Ok(Some(self.serializer.from_bytes(&bytes)?)),
                None => Ok(None),
            })
            .transpose();
        if matches!(result, Some(Err(_))) {
            self.failed = true;
        }
        result
    }
}

impl<T: Send> LogIterator<T> for SegmentIterator<T> {
    fn address(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::PooledReader;
    use seglog_codec::StringSerializer;
    use seglog_storage::{DirectStorage, InMemoryStorage};
    use std::fs::OpenOptions;
    use std::path::Path;

    fn reader() -> Arc<dyn DataReader> {
        Arc::new(PooledReader::new(2, 64, ChecksumPolicy::always()).unwrap())
    }

    fn memory_segment() -> Segment<String> {
        Segment::create(
            Box::new(InMemoryStorage::new()),
            Arc::new(StringSerializer),
            reader(),
            1,
            0,
            SegmentType::LogHead,
        )
        .unwrap()
    }

    fn file_segment(path: &Path) -> Segment<String> {
        Segment::create(
            Box::new(DirectStorage::create(path, 4096).unwrap()),
            Arc::new(StringSerializer),
            reader(),
            1,
            0,
            SegmentType::LogHead,
        )
        .unwrap()
    }

    fn reopen(path: &Path) -> Segment<String> {
        Segment::open(
            Box::new(DirectStorage::open(path).unwrap()),
            Arc::new(StringSerializer),
            reader(),
        )
        .unwrap()
    }

    fn collect(iter: Box<dyn LogIterator<String>>) -> Vec<String> {
        iter.map(Result::unwrap).collect()
    }

    #[test]
    fn append_and_get() {
        let segment = memory_segment();
        let first = segment.append(&"a".to_string()).unwrap();
        let second = segment.append(&"bb".to_string()).unwrap();

        assert_eq!(first, LOG_START);
        assert_eq!(second, LOG_START + 1 + OVERHEAD as u64);
        assert_eq!(segment.get(first).unwrap().as_deref(), Some("a"));
        assert_eq!(segment.get(second).unwrap().as_deref(), Some("bb"));
        assert_eq!(segment.get(segment.position()).unwrap(), None);
        assert_eq!(segment.entries(), 2);
        assert_eq!(segment.size(), (3 + 2 * OVERHEAD) as u64);
    }

    #[test]
    fn forward_and_backward_are_mirrors() {
        let segment = memory_segment();
        let records: Vec<String> = (0..20).map(|i| "x".repeat(i + 1)).collect();
        for record in &records {
            segment.append(record).unwrap();
        }

        let forward = collect(segment.iter(Direction::Forward).unwrap());
        let mut backward = collect(segment.iter(Direction::Backward).unwrap());
        backward.reverse();
        assert_eq!(forward, records);
        assert_eq!(backward, records);
    }

    #[test]
    fn iterator_resumes_after_new_appends() {
        let segment = memory_segment();
        segment.append(&"one".to_string()).unwrap();
        let mut iter = segment.iter(Direction::Forward).unwrap();
        assert_eq!(iter.next().unwrap().unwrap(), "one");
        assert!(iter.next().is_none());

        let second = segment.append(&"two".to_string()).unwrap();
        assert_eq!(iter.address(), second);
        assert_eq!(iter.next().unwrap().unwrap(), "two");
    }

    #[test]
    fn iter_from_rejects_positions_outside() {
        let segment = memory_segment();
        segment.append(&"one".to_string()).unwrap();
        assert!(segment.iter_from(0, Direction::Forward).is_err());
        assert!(segment.iter_from(10_000, Direction::Forward).is_err());
        let tail = collect(segment.iter_from(segment.position(), Direction::Backward).unwrap());
        assert_eq!(tail, vec!["one".to_string()]);
    }

    #[test]
    fn roll_freezes_segment_and_keeps_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        let segment = file_segment(&path);
        segment.append(&"a".to_string()).unwrap();
        segment.append(&"b".to_string()).unwrap();
        segment.roll_with_footer(1, Some(b"footer")).unwrap();

        assert!(segment.is_read_only());
        assert_eq!(segment.level(), 1);
        assert!(matches!(
            segment.append(&"c".to_string()),
            Err(CoreError::ReadOnly { .. })
        ));
        assert!(segment.roll(2).is_err());
        let position = segment.position();
        drop(segment);

        let reopened = reopen(&path);
        assert!(reopened.is_read_only());
        assert_eq!(reopened.entries(), 2);
        assert_eq!(reopened.position(), position);
        assert_eq!(reopened.level(), 1);
        assert_eq!(reopened.footer().unwrap().unwrap().as_ref(), b"footer");
        assert_eq!(collect(reopened.iter(Direction::Forward).unwrap()), vec!["a", "b"]);
        reopened.check_integrity().unwrap();
    }

    #[test]
    fn reopen_live_segment_rebuilds_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        let segment = file_segment(&path);
        for i in 0..10 {
            segment.append(&format!("record-{i}")).unwrap();
        }
        segment.flush().unwrap();
        let position = segment.position();
        drop(segment);

        let reopened = reopen(&path);
        assert!(!reopened.is_read_only());
        assert_eq!(reopened.entries(), 10);
        assert_eq!(reopened.position(), position);
        let next = reopened.append(&"after".to_string()).unwrap();
        assert_eq!(next, position);
    }

    #[test]
    fn checkpoint_skips_records_before_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        let segment = file_segment(&path);
        for i in 0..4 {
            segment.append(&format!("record-{i}")).unwrap();
        }
        let checkpoint = Checkpoint {
            position: segment.position(),
            entries: 4,
        };
        segment.append(&"after".to_string()).unwrap();
        segment.flush().unwrap();
        let position = segment.position();
        drop(segment);

        let open_at = |checkpoint| {
            Segment::open_at(
                Box::new(DirectStorage::open(&path).unwrap()),
                Arc::new(StringSerializer),
                reader(),
                Some(checkpoint),
            )
            .unwrap()
        };
        let resumed = open_at(checkpoint);
        assert_eq!(resumed.entries(), 5);
        assert_eq!(resumed.position(), position);
        drop(resumed);

        // a checkpoint inside a record is refused and the segment rescanned
        let rescanned = open_at(Checkpoint {
            position: checkpoint.position - 3,
            entries: 40,
        });
        assert_eq!(rescanned.entries(), 5);
        assert_eq!(rescanned.position(), position);
    }

    #[test]
    fn torn_tail_is_discarded_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        let segment = file_segment(&path);
        segment.append(&"first".to_string()).unwrap();
        let second = segment.append(&"second".to_string()).unwrap();
        let third = segment.append(&"third-record".to_string()).unwrap();
        segment.flush().unwrap();
        drop(segment);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(third + 5).unwrap();
        drop(file);

        let reopened = reopen(&path);
        assert_eq!(reopened.entries(), 2);
        assert_eq!(reopened.position(), third);
        assert_eq!(reopened.get(second).unwrap().as_deref(), Some("second"));

        let fourth = reopened.append(&"fourth".to_string()).unwrap();
        assert_eq!(fourth, third);
        assert_eq!(
            collect(reopened.iter(Direction::Forward).unwrap()),
            vec!["first", "second", "fourth"]
        );
    }

    #[test]
    fn corrupted_payload_fails_read_and_is_cut_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        let segment = file_segment(&path);
        segment.append(&"good".to_string()).unwrap();
        let bad = segment.append(&"bad-record".to_string()).unwrap();
        segment.flush().unwrap();

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(bad + HEADER_SIZE as u64 + 2)).unwrap();
            file.write_all(b"#").unwrap();
        }
        let err = segment.get(bad).unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
        assert!(segment.check_integrity().is_err());
        drop(segment);

        let reopened = reopen(&path);
        assert_eq!(reopened.entries(), 1);
        assert_eq!(reopened.position(), bad);
    }

    #[test]
    fn iterator_stops_after_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        let segment = file_segment(&path);
        let first = segment.append(&"aaaa".to_string()).unwrap();
        segment.append(&"bbbb".to_string()).unwrap();
        segment.flush().unwrap();
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(first + HEADER_SIZE as u64)).unwrap();
            file.write_all(b"z").unwrap();
        }

        let mut iter = segment.iter(Direction::Forward).unwrap();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn deleted_segment_file_removed_after_last_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.log");
        let segment = file_segment(&path);
        segment.append(&"a".to_string()).unwrap();
        let iter = segment.iter(Direction::Forward).unwrap();

        segment.delete();
        drop(segment);
        assert!(path.exists());

        assert_eq!(collect(iter), vec!["a"]);
        assert!(!path.exists());
    }

    #[test]
    fn closed_segment_rejects_io() {
        let segment = memory_segment();
        segment.append(&"a".to_string()).unwrap();
        segment.close().unwrap();
        segment.close().unwrap();
        assert!(matches!(segment.get(LOG_START), Err(CoreError::Closed)));
        assert!(matches!(segment.append(&"b".to_string()), Err(CoreError::Closed)));
    }
}
