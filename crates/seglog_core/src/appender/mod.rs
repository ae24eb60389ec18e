//! The log appender: a leveled, compacting sequence of segments.
//!
//! ```text
//! level 0 : [head]                    <- appends go here
//! level 1 : [s4] [s5]                 <- rolled heads
//! level 2 : [s3]                      <- merge of three level-1 segments
//! ```
//!
//! Appends go to the head. When it grows past `segment_size` (or
//! `roll_frequency` elapses) it is rolled into level 1 and a new head is
//! created. Once a level holds `max_segments_per_level` segments the
//! oldest of them are merged into a single segment of the next level in
//! the background.
//!
//! Addresses returned by [`LogAppender::append`] stay valid until the
//! segment holding them is compacted; afterwards [`LogReader::get`]
//! returns `None` for them.

mod address;
mod combiner;
mod compaction;
mod levels;
mod naming;
mod poller;
mod reader;

pub use address::AddressCodec;
pub use combiner::{ConcatenateCombiner, MergeCombiner, RetainCombiner, SegmentCombiner, Sources};
pub use levels::{Levels, LevelsView};
pub use naming::{segment_id, segment_name, segment_stem};
pub use poller::{Poller, PollerCloser};
pub use reader::{LogIter, LogReader};

use crate::config::AppenderConfig;
use crate::dir::LogDir;
use crate::error::{CoreError, CoreResult};
use crate::segment::{
    now_millis, Checkpoint, Direction, Log, LogSegmentFactory, SegmentFactory, SegmentInfo, SegmentInit, SegmentType,
    LOG_START,
};
use crate::state::AppenderState;
use compaction::Compactor;
use parking_lot::{Mutex, RwLock};
use poller::Notifier;
use seglog_codec::Serializer;
use seglog_storage::StorageError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared by the writer, readers, pollers and the compactor.
pub(crate) struct Shared<L> {
    pub(crate) dir: LogDir,
    pub(crate) config: AppenderConfig,
    pub(crate) address: AddressCodec,
    pub(crate) notifier: Notifier,
    view: RwLock<Arc<LevelsView<L>>>,
    state: Mutex<AppenderState>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<L: SegmentInfo> Shared<L> {
    pub(crate) fn view(&self) -> Arc<LevelsView<L>> {
        Arc::clone(&self.view.read())
    }

    pub(crate) fn publish(&self, view: LevelsView<L>) {
        *self.view.write() = Arc::new(view);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(())
    }

    /// Reserves the next segment id.
    pub(crate) fn allocate_id(&self) -> CoreResult<u64> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        if id > self.address.max_segment_id() {
            return Err(CoreError::address_overflow(format!(
                "segment id {id} exceeds {} bits",
                self.address.segment_bits()
            )));
        }
        Ok(id)
    }

    fn last_roll_time(&self) -> u64 {
        self.state.lock().last_roll_time
    }

    fn set_last_roll_time(&self, millis: u64) {
        self.state.lock().last_roll_time = millis;
    }

    /// Writes the current layout to the STATE file.
    pub(crate) fn persist_state(&self) -> CoreResult<()> {
        let view = self.view();
        let mut state = self.state.lock();
        state.position = view
            .head()
            .map_or(0, |head| self.address.pack(head.id(), head.position()));
        state.entry_count = view.entries();
        state.next_segment_id = self.next_id.load(Ordering::Acquire);
        state.levels = view.layout().to_vec();
        self.dir.save_state(&state)
    }
}

/// A segmented, compacting append-only log.
///
/// One appender owns its directory (enforced with a lock file). Appends
/// and rolls need `&mut self`; any number of [`LogReader`]s and
/// [`Poller`]s may read concurrently.
///
/// # Example
///
/// ```no_run
/// use seglog_core::{AppenderConfig, Direction, LogAppender};
/// use seglog_codec::StringSerializer;
/// use std::sync::Arc;
///
/// let mut log = LogAppender::open("/tmp/log", AppenderConfig::default(), Arc::new(StringSerializer))?;
/// let address = log.append(&"hello".to_string())?;
/// assert_eq!(log.get(address)?.as_deref(), Some("hello"));
/// for record in log.iter(Direction::Forward)? {
///     println!("{}", record?);
/// }
/// log.close()?;
/// # Ok::<(), seglog_core::CoreError>(())
/// ```
pub struct LogAppender<T: Send + 'static, F: SegmentFactory<T> = LogSegmentFactory<T>> {
    shared: Arc<Shared<F::Segment>>,
    factory: Arc<F>,
    head: Arc<F::Segment>,
    compactor: Compactor<F::Segment>,
    reader: LogReader<T, F::Segment>,
}

impl<T: Send + 'static> LogAppender<T> {
    /// Opens or creates the log in `path` with the built-in segment
    /// layouts and concatenating compaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the directory
    /// is locked, or existing segments cannot be recovered.
    pub fn open(
        path: impl AsRef<Path>,
        config: AppenderConfig,
        serializer: Arc<dyn Serializer<T>>,
    ) -> CoreResult<Self> {
        let factory = LogSegmentFactory::new(&config, serializer)?;
        AppenderBuilder::new(path, config, factory).open()
    }
}

impl<T: Send + 'static, F: SegmentFactory<T>> LogAppender<T, F> {
    /// Appends a record and returns its address.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed, the record cannot be
    /// serialized, or I/O fails.
    pub fn append(&mut self, record: &T) -> CoreResult<u64> {
        self.shared.check_open()?;
        if self.should_roll() {
            self.roll()?;
        }
        // the frame lands at the current position; refuse before writing
        self.shared.address.encode(self.head.id(), self.head.position())?;
        let offset = match self.head.append(record) {
            Err(CoreError::Storage(StorageError::SplitRecord { position, window, .. })) if self.head.entries() > 0 => {
                debug!(
                    segment = self.head.name(),
                    position,
                    window,
                    "record crosses a mapping window, rolling head"
                );
                self.roll()?;
                self.head.append(record)?
            }
            result => result?,
        };
        if self.shared.config.flush_after_write {
            self.head.flush()?;
        }
        self.shared.notifier.notify();
        self.shared.address.encode(self.head.id(), offset)
    }

    /// Freezes the head into level 1 and starts a new one.
    ///
    /// Rolling an empty head does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed or the new head cannot be
    /// created.
    pub fn roll(&mut self) -> CoreResult<()> {
        self.shared.check_open()?;
        if self.head.entries() == 0 {
            return Ok(());
        }
        if !self.head.is_read_only() {
            self.head.roll(1)?;
        }

        let id = self.shared.allocate_id()?;
        let head = Arc::new(create_head::<T, F>(
            &*self.factory,
            &self.shared.dir,
            &self.shared.config,
            id,
        )?);
        if let Err(e) = self.install_head(&head) {
            head.delete();
            return Err(e);
        }
        debug!(
            rolled = self.head.name(),
            entries = self.head.entries(),
            head = head.name(),
            "head rolled"
        );
        self.head = head;
        self.shared.notifier.notify();
        Ok(())
    }

    fn install_head(&self, head: &Arc<F::Segment>) -> CoreResult<()> {
        self.shared.set_last_roll_time(now_millis());
        self.compactor.roll(Arc::clone(head))
    }

    fn should_roll(&self) -> bool {
        if self.head.is_read_only() || self.head.size() >= self.shared.config.segment_size {
            return true;
        }
        match self.shared.config.roll_frequency {
            Some(frequency) if self.head.entries() > 0 => {
                let elapsed = now_millis().saturating_sub(self.shared.last_roll_time());
                u128::from(elapsed) >= frequency.as_millis()
            }
            _ => false,
        }
    }

    /// Forces buffered head data to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed or the sync fails.
    pub fn flush(&mut self) -> CoreResult<()> {
        self.shared.check_open()?;
        self.head.flush()
    }

    /// Asks the compactor to check every level.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed.
    pub fn compact(&self) -> CoreResult<()> {
        self.compactor.compact(None)
    }

    /// Blocks until no compaction is running or pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed.
    pub fn await_compaction(&self) -> CoreResult<()> {
        self.compactor.await_idle()
    }

    /// A cloneable reader of this log.
    #[must_use]
    pub fn reader(&self) -> LogReader<T, F::Segment> {
        self.reader.clone()
    }

    /// See [`LogReader::get`].
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed or the record is damaged.
    pub fn get(&self, address: u64) -> CoreResult<Option<T>> {
        self.reader.get(address)
    }

    /// See [`LogReader::iter`].
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed.
    pub fn iter(&self, direction: Direction) -> CoreResult<LogIter<T, F::Segment>> {
        self.reader.iter(direction)
    }

    /// See [`LogReader::iter_from`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address lies outside the log.
    pub fn iter_from(&self, address: u64, direction: Direction) -> CoreResult<LogIter<T, F::Segment>> {
        self.reader.iter_from(address, direction)
    }

    /// See [`LogReader::poller`].
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed.
    pub fn poller(&self) -> CoreResult<Poller<T, F::Segment>> {
        self.reader.poller()
    }

    /// See [`LogReader::poller_from`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address is past the end of the log.
    pub fn poller_from(&self, address: u64) -> CoreResult<Poller<T, F::Segment>> {
        self.reader.poller_from(address)
    }

    /// Total records.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.reader.entries()
    }

    /// Address the next append will get, unless the head rolls first.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    /// Total record bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Number of levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.reader.depth()
    }

    /// Names of the segments of `level`, oldest first.
    #[must_use]
    pub fn level_segments(&self, level: u32) -> Vec<String> {
        self.reader.level_segments(level)
    }

    /// All segments in log order.
    #[must_use]
    pub fn segments(&self, direction: Direction) -> Vec<Arc<F::Segment>> {
        self.reader.segments(direction)
    }

    /// The writable segment.
    #[must_use]
    pub fn head(&self) -> &Arc<F::Segment> {
        &self.head
    }

    /// The log directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.shared.dir.path()
    }

    /// True once [`LogAppender::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Flushes the head, stops compaction, saves the state and closes
    /// every segment. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the first flush or state error; segment close errors are
    /// logged.
    pub fn close(&mut self) -> CoreResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.head.flush();
        self.compactor.shutdown();
        let persisted = self.shared.persist_state();
        self.shared.notifier.notify();
        for segment in self.shared.view().segments() {
            if let Err(e) = segment.close() {
                warn!(segment = segment.name(), error = %e, "failed to close segment");
            }
        }
        info!(path = %self.shared.dir.path().display(), "log closed");
        flushed.and(persisted)
    }
}

impl<T: Send + 'static, F: SegmentFactory<T>> Drop for LogAppender<T, F> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing log on drop");
        }
    }
}

/// Opens a [`LogAppender`] with a custom segment factory or combiner.
pub struct AppenderBuilder<T, F> {
    path: PathBuf,
    config: AppenderConfig,
    factory: F,
    combiner: Option<Arc<dyn SegmentCombiner<T>>>,
}

impl<T: Send + 'static, F: SegmentFactory<T>> AppenderBuilder<T, F> {
    /// Creates a builder for the log in `path`.
    pub fn new(path: impl AsRef<Path>, config: AppenderConfig, factory: F) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
            factory,
            combiner: None,
        }
    }

    /// Sets how compaction combines segments.
    #[must_use]
    pub fn combiner(mut self, combiner: Arc<dyn SegmentCombiner<T>>) -> Self {
        self.combiner = Some(combiner);
        self
    }

    /// Opens or creates the log.
    ///
    /// With a STATE file the recorded layout is reopened. Without one the
    /// layout is recovered from the segment headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the directory is
    /// locked, the STATE disagrees with the configuration or lists
    /// missing segments, or a segment cannot be opened.
    pub fn open(self) -> CoreResult<LogAppender<T, F>> {
        let Self {
            path,
            config,
            factory,
            combiner,
        } = self;
        config.validate()?;
        let address = AddressCodec::new(config.segment_bits)?;
        let dir = LogDir::open(&path)?;
        let stored = dir.load_state()?;

        let mut levels = match &stored {
            Some(state) => load_levels::<T, F>(&dir, &factory, &config, &address, state)?,
            None => scan_levels::<T, F>(&dir, &factory, &config)?,
        };
        let mut next_id = stored.as_ref().map_or(1, |state| state.next_segment_id);
        if let Some(max) = levels.iter().flatten().map(|s| s.id()).max() {
            next_id = next_id.max(max + 1);
        }

        let head = match take_head(&mut levels)? {
            Some(head) => head,
            None => {
                if next_id > address.max_segment_id() {
                    return Err(CoreError::address_overflow(format!(
                        "segment id {next_id} exceeds {} bits",
                        address.segment_bits()
                    )));
                }
                let head = Arc::new(create_head::<T, F>(&factory, &dir, &config, next_id)?);
                next_id += 1;
                head
            }
        };
        levels[0] = vec![Arc::clone(&head)];
        let levels = Levels::from_levels(levels, config.max_segments_per_level)?;

        let mut state = stored.unwrap_or_else(|| AppenderState::new(config.segment_bits));
        if state.last_roll_time == 0 {
            state.last_roll_time = now_millis();
        }
        let shared = Arc::new(Shared {
            dir,
            config,
            address,
            notifier: Notifier::default(),
            view: RwLock::new(Arc::new(levels.view())),
            state: Mutex::new(state),
            next_id: AtomicU64::new(next_id),
            closed: AtomicBool::new(false),
        });
        shared.persist_state()?;

        let factory = Arc::new(factory);
        let combiner: Arc<dyn SegmentCombiner<T>> = match combiner {
            Some(combiner) => combiner,
            None => Arc::new(ConcatenateCombiner),
        };
        let compactor = Compactor::spawn(levels, Arc::clone(&shared), Arc::clone(&factory), combiner)?;
        if !shared.config.compaction_disabled {
            compactor.compact(None)?;
        }

        let view = shared.view();
        info!(
            path = %shared.dir.path().display(),
            segments = view.segments().len(),
            depth = view.depth(),
            entries = view.entries(),
            head = head.name(),
            "log opened"
        );
        Ok(LogAppender {
            reader: LogReader::new(Arc::clone(&shared)),
            shared,
            factory,
            head,
            compactor,
        })
    }
}

fn create_head<T, F: SegmentFactory<T>>(
    factory: &F,
    dir: &LogDir,
    config: &AppenderConfig,
    id: u64,
) -> CoreResult<F::Segment> {
    let name = segment_name(&config.name_prefix, id);
    factory.create(
        &dir.file(&name),
        SegmentInit {
            id,
            level: 0,
            segment_type: SegmentType::LogHead,
            length: config.segment_size,
        },
    )
}

type LevelList<L> = Vec<Vec<Arc<L>>>;

/// Opens the segments listed in `state`.
///
/// The head is opened last so that the STATE position can seed its
/// recovery scan.
fn load_levels<T, F: SegmentFactory<T>>(
    dir: &LogDir,
    factory: &F,
    config: &AppenderConfig,
    address: &AddressCodec,
    state: &AppenderState,
) -> CoreResult<LevelList<F::Segment>> {
    if state.segment_bits != config.segment_bits {
        return Err(CoreError::state(format!(
            "log was written with {} segment bits, configured {}",
            state.segment_bits, config.segment_bits
        )));
    }

    let mut levels = Vec::with_capacity(state.levels.len().max(1));
    let mut head = None;
    for (depth, names) in state.levels.iter().enumerate() {
        let mut level = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let path = dir.file(name);
            if !path.exists() {
                return Err(CoreError::state(format!("segment {name} is missing")));
            }
            if depth == 0 && i + 1 == names.len() {
                head = Some((name, path));
                continue;
            }
            level.push(Arc::new(factory.open(&path)?));
        }
        levels.push(level);
    }

    if let Some((name, path)) = head {
        let segment = match head_checkpoint(config, address, state, name, &levels) {
            Some(checkpoint) => {
                debug!(
                    segment = %name,
                    position = checkpoint.position,
                    entries = checkpoint.entries,
                    "resuming head from STATE"
                );
                factory.open_head(&path, checkpoint)?
            }
            None => factory.open(&path)?,
        };
        levels[0].push(Arc::new(segment));
    }

    let known: HashSet<&str> = state.segment_names().collect();
    for name in dir.segment_files(&config.name_prefix)? {
        if !known.contains(name.as_str()) {
            warn!(segment = %name, "ignoring segment missing from STATE");
        }
    }
    Ok(levels)
}

/// Where the head stood when STATE was written, if STATE points into it.
///
/// STATE holds the entry count of the whole log; the head's share is
/// what the other segments do not account for.
fn head_checkpoint<L: SegmentInfo>(
    config: &AppenderConfig,
    address: &AddressCodec,
    state: &AppenderState,
    name: &str,
    others: &LevelList<L>,
) -> Option<Checkpoint> {
    let (id, position) = address.decode(state.position);
    if segment_id(&config.name_prefix, name) != Some(id) || position < LOG_START {
        return None;
    }
    let others: u64 = others.iter().flatten().map(|s| s.entries()).sum();
    let entries = state.entry_count.checked_sub(others)?;
    Some(Checkpoint { position, entries })
}

/// Rebuilds the layout from segment headers when no STATE exists.
fn scan_levels<T, F: SegmentFactory<T>>(
    dir: &LogDir,
    factory: &F,
    config: &AppenderConfig,
) -> CoreResult<LevelList<F::Segment>> {
    let names = dir.segment_files(&config.name_prefix)?;
    if !names.is_empty() {
        warn!(segments = names.len(), "no STATE found, recovering layout from segment headers");
    }

    let mut levels: LevelList<F::Segment> = vec![Vec::new()];
    for name in names {
        let segment = match factory.open(&dir.file(&name)) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(segment = %name, error = %e, "skipping unreadable segment");
                continue;
            }
        };
        let level = segment.level() as usize;
        if level > 0 && !segment.is_read_only() {
            warn!(segment = %name, "ignoring unfinished compaction output");
            continue;
        }
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(Arc::new(segment));
    }
    for level in &mut levels {
        level.sort_by_key(|s| s.id());
    }
    Ok(levels)
}

/// Picks the writable head out of level 0 and moves every other level-0
/// segment, rolling it if needed, to level 1.
fn take_head<L: SegmentInfo>(levels: &mut LevelList<L>) -> CoreResult<Option<Arc<L>>> {
    if levels.is_empty() {
        levels.push(Vec::new());
    }
    let mut level0 = std::mem::take(&mut levels[0]);
    level0.sort_by_key(|s| s.id());
    let head = match level0.last() {
        Some(last) if !last.is_read_only() => level0.pop(),
        _ => None,
    };
    if level0.is_empty() {
        return Ok(head);
    }

    if levels.len() < 2 {
        levels.push(Vec::new());
    }
    for segment in level0 {
        if !segment.is_read_only() {
            warn!(segment = segment.name(), "rolling stale writable segment");
            segment.roll(1)?;
        }
        levels[1].push(segment);
    }
    levels[1].sort_by_key(|s| s.id());
    Ok(head)
}
