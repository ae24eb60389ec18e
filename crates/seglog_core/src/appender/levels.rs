use crate::error::{CoreError, CoreResult};
use crate::segment::SegmentInfo;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// The leveled segment layout.
///
/// Level 0 holds exactly one writable segment, the head. Every other
/// segment is read-only. Within a level segments are ordered oldest
/// first; higher levels hold older data than lower ones.
#[derive(Debug)]
pub struct Levels<L> {
    levels: Vec<Vec<Arc<L>>>,
    max_segments_per_level: usize,
}

impl<L: SegmentInfo> Levels<L> {
    /// Creates a layout holding just `head`.
    #[must_use]
    pub fn new(head: Arc<L>, max_segments_per_level: usize) -> Self {
        Self {
            levels: vec![vec![head]],
            max_segments_per_level,
        }
    }

    /// Rebuilds a layout from per-level segment lists.
    ///
    /// # Errors
    ///
    /// Returns a state error unless level 0 holds exactly one writable
    /// segment and every other segment is read-only.
    pub fn from_levels(levels: Vec<Vec<Arc<L>>>, max_segments_per_level: usize) -> CoreResult<Self> {
        match levels.first().map(Vec::as_slice) {
            Some([head]) if !head.is_read_only() => {}
            _ => {
                return Err(CoreError::state(
                    "level 0 must hold exactly one writable segment",
                ))
            }
        }
        if let Some(writable) = levels[1..].iter().flatten().find(|s| !s.is_read_only()) {
            return Err(CoreError::state(format!(
                "segment {} above level 0 is writable",
                writable.name()
            )));
        }
        Ok(Self {
            levels,
            max_segments_per_level,
        })
    }

    /// The writable level-0 segment.
    #[must_use]
    pub fn head(&self) -> &Arc<L> {
        &self.levels[0][0]
    }

    /// Number of levels, including empty intermediate ones.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Segments of `level`, oldest first.
    #[must_use]
    pub fn segments(&self, level: u32) -> &[Arc<L>] {
        self.levels.get(level as usize).map_or(&[], Vec::as_slice)
    }

    /// Every segment from the oldest data to the head.
    #[must_use]
    pub fn ordered(&self) -> Vec<Arc<L>> {
        self.levels.iter().rev().flatten().cloned().collect()
    }

    /// Segment names per level.
    #[must_use]
    pub fn layout(&self) -> Vec<Vec<String>> {
        self.levels
            .iter()
            .map(|level| level.iter().map(|s| s.name().to_string()).collect())
            .collect()
    }

    /// Installs `new_head` and moves the previous head, already rolled, to
    /// level 1.
    ///
    /// # Errors
    ///
    /// Returns a state error if the previous head is still writable.
    pub fn roll(&mut self, new_head: Arc<L>) -> CoreResult<Arc<L>> {
        if !self.head().is_read_only() {
            return Err(CoreError::state(format!(
                "head {} must be rolled before it is replaced",
                self.head().name()
            )));
        }
        let previous = std::mem::replace(&mut self.levels[0][0], new_head);
        self.level_mut(1).push(Arc::clone(&previous));
        Ok(previous)
    }

    /// Replaces the `sources` of `level` by `target`, which becomes the
    /// newest segment of `level + 1`. Returns the removed segments.
    ///
    /// # Errors
    ///
    /// Returns a state error if a source is no longer at `level`.
    pub fn merge(&mut self, level: u32, sources: &[u64], target: Arc<L>) -> CoreResult<Vec<Arc<L>>> {
        if level == 0 {
            return Err(CoreError::state("the head level is never merged"));
        }
        let current = self.level_mut(level);
        let wanted: HashSet<u64> = sources.iter().copied().collect();
        let found = current.iter().filter(|s| wanted.contains(&s.id())).count();
        if found != wanted.len() {
            return Err(CoreError::state(format!(
                "only {found} of {} compaction sources are still at level {level}",
                wanted.len()
            )));
        }
        let (removed, kept): (Vec<Arc<L>>, Vec<Arc<L>>) = std::mem::take(current)
            .into_iter()
            .partition(|s| wanted.contains(&s.id()));
        *current = kept;
        self.level_mut(level + 1).push(target);
        Ok(removed)
    }

    /// True if `level` holds enough segments to merge.
    #[must_use]
    pub fn requires_compaction(&self, level: u32) -> bool {
        level > 0 && self.segments(level).len() >= self.max_segments_per_level
    }

    /// The oldest segments of `level` to merge, at most the per-level
    /// maximum.
    #[must_use]
    pub fn segments_for_compaction(&self, level: u32) -> Vec<Arc<L>> {
        self.segments(level)
            .iter()
            .take(self.max_segments_per_level)
            .cloned()
            .collect()
    }

    /// An immutable snapshot for readers.
    #[must_use]
    pub fn view(&self) -> LevelsView<L> {
        LevelsView::new(self.ordered(), self.layout())
    }

    fn level_mut(&mut self, level: u32) -> &mut Vec<Arc<L>> {
        let level = level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        &mut self.levels[level]
    }
}

/// Read-only snapshot of [`Levels`], swapped atomically on every change.
#[derive(Debug)]
pub struct LevelsView<L> {
    ordered: Vec<Arc<L>>,
    by_id: HashMap<u64, usize>,
    layout: Vec<Vec<String>>,
}

impl<L: SegmentInfo> LevelsView<L> {
    fn new(ordered: Vec<Arc<L>>, layout: Vec<Vec<String>>) -> Self {
        let by_id = ordered
            .iter()
            .enumerate()
            .map(|(idx, segment)| (segment.id(), idx))
            .collect();
        Self {
            ordered,
            by_id,
            layout,
        }
    }

    /// Segments from the oldest data to the head.
    #[must_use]
    pub fn segments(&self) -> &[Arc<L>] {
        &self.ordered
    }

    /// The head segment.
    #[must_use]
    pub fn head(&self) -> Option<&Arc<L>> {
        self.ordered.last()
    }

    /// Segment with id `id`.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&Arc<L>> {
        self.by_id.get(&id).map(|idx| &self.ordered[*idx])
    }

    /// Position of segment `id` in [`LevelsView::segments`].
    #[must_use]
    pub fn index_of(&self, id: u64) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// The segment to read after segment `id`.
    ///
    /// If `id` was compacted away, this is the first segment, in order,
    /// created after it; all newer data lives in segments with larger ids,
    /// so nothing is skipped although some records may be read twice.
    #[must_use]
    pub fn successor(&self, id: u64) -> Option<&Arc<L>> {
        match self.by_id.get(&id) {
            Some(idx) => self.ordered.get(idx + 1),
            None => self.ordered.iter().find(|segment| segment.id() > id),
        }
    }

    /// Segment names per level.
    #[must_use]
    pub fn layout(&self) -> &[Vec<String>] {
        &self.layout
    }

    /// Number of levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.layout.len()
    }

    /// Total records.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.ordered.iter().map(|s| s.entries()).sum()
    }

    /// Total record bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.ordered.iter().map(|s| s.size()).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    pub(crate) struct FakeSegment {
        id: u64,
        name: String,
        read_only: AtomicBool,
    }

    impl FakeSegment {
        pub(crate) fn new(id: u64, read_only: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                name: format!("seg-{id}"),
                read_only: AtomicBool::new(read_only),
            })
        }
    }

    impl SegmentInfo for FakeSegment {
        fn id(&self) -> u64 {
            self.id
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn level(&self) -> u32 {
            0
        }
        fn created(&self) -> u64 {
            0
        }
        fn entries(&self) -> u64 {
            1
        }
        fn position(&self) -> u64 {
            0
        }
        fn size(&self) -> u64 {
            10
        }
        fn is_read_only(&self) -> bool {
            self.read_only.load(Ordering::Acquire)
        }
        fn flush(&self) -> CoreResult<()> {
            Ok(())
        }
        fn roll(&self, _level: u32) -> CoreResult<()> {
            self.read_only.store(true, Ordering::Release);
            Ok(())
        }
        fn delete(&self) {}
        fn close(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    fn ids(segments: &[Arc<FakeSegment>]) -> Vec<u64> {
        segments.iter().map(|s| s.id()).collect()
    }

    fn rolled(levels: &mut Levels<FakeSegment>, next: u64) {
        levels.head().roll(1).unwrap();
        levels.roll(FakeSegment::new(next, false)).unwrap();
    }

    #[test]
    fn roll_moves_head_to_level_one() {
        let mut levels = Levels::new(FakeSegment::new(1, false), 3);
        rolled(&mut levels, 2);
        rolled(&mut levels, 3);

        assert_eq!(levels.head().id(), 3);
        assert_eq!(ids(levels.segments(1)), vec![1, 2]);
        assert_eq!(ids(&levels.ordered()), vec![1, 2, 3]);
        assert_eq!(
            levels.layout(),
            vec![vec!["seg-3".to_string()], vec!["seg-1".to_string(), "seg-2".to_string()]]
        );
    }

    #[test]
    fn roll_requires_read_only_head() {
        let mut levels = Levels::new(FakeSegment::new(1, false), 3);
        assert!(levels.roll(FakeSegment::new(2, false)).is_err());
    }

    #[test]
    fn compaction_threshold_and_selection() {
        let mut levels = Levels::new(FakeSegment::new(1, false), 3);
        rolled(&mut levels, 2);
        rolled(&mut levels, 3);
        assert!(!levels.requires_compaction(1));
        rolled(&mut levels, 4);
        rolled(&mut levels, 5);
        assert!(levels.requires_compaction(1));
        assert!(!levels.requires_compaction(0));
        assert_eq!(ids(&levels.segments_for_compaction(1)), vec![1, 2, 3]);

        levels.merge(1, &[1, 2, 3], FakeSegment::new(6, true)).unwrap();
        assert!(!levels.requires_compaction(1));
        assert!(!levels.requires_compaction(2));
    }

    #[test]
    fn merge_promotes_target() {
        let mut levels = Levels::new(FakeSegment::new(1, false), 3);
        for next in 2..=5 {
            rolled(&mut levels, next);
        }
        let removed = levels
            .merge(1, &[1, 2, 3], FakeSegment::new(6, true))
            .unwrap();

        assert_eq!(ids(&removed), vec![1, 2, 3]);
        assert_eq!(ids(levels.segments(1)), vec![4]);
        assert_eq!(ids(levels.segments(2)), vec![6]);
        assert_eq!(ids(&levels.ordered()), vec![6, 4, 5]);
        assert_eq!(levels.depth(), 3);

        assert!(levels.merge(1, &[1], FakeSegment::new(7, true)).is_err());
        assert!(levels.merge(0, &[5], FakeSegment::new(7, true)).is_err());
    }

    #[test]
    fn from_levels_validates_head() {
        let ok = Levels::from_levels(
            vec![vec![FakeSegment::new(3, false)], vec![FakeSegment::new(1, true)]],
            3,
        );
        assert!(ok.is_ok());

        let no_head = Levels::from_levels(vec![vec![], vec![FakeSegment::new(1, true)]], 3);
        assert!(no_head.is_err());

        let writable = Levels::from_levels(
            vec![vec![FakeSegment::new(3, false)], vec![FakeSegment::new(1, false)]],
            3,
        );
        assert!(writable.is_err());
    }

    #[test]
    fn view_successor_skips_nothing() {
        let mut levels = Levels::new(FakeSegment::new(1, false), 3);
        for next in 2..=5 {
            rolled(&mut levels, next);
        }
        let before = levels.view();
        assert_eq!(before.successor(2).map(|s| s.id()), Some(3));
        assert!(before.successor(5).is_none());

        levels.merge(1, &[1, 2, 3], FakeSegment::new(6, true)).unwrap();
        let after = levels.view();
        // 2 was merged into 6, which holds everything 2 was followed by
        assert_eq!(after.successor(2).map(|s| s.id()), Some(6));
        assert_eq!(after.successor(6).map(|s| s.id()), Some(4));
        assert_eq!(after.get(4).map(|s| s.id()), Some(4));
        assert!(after.get(2).is_none());
        assert_eq!(after.entries(), 3);
    }
}
