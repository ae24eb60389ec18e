//! Compaction merge policies.

use crate::error::CoreResult;
use crate::segment::LogIterator;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Source iterators of a compaction, oldest segment first.
pub type Sources<T> = Vec<Box<dyn LogIterator<T>>>;

/// Combines the records of the segments being compacted into the target.
pub trait SegmentCombiner<T>: Send + Sync {
    /// Drains `sources` and hands every record to keep to `sink`.
    ///
    /// # Errors
    ///
    /// Returns the first read or sink error; the compaction is abandoned.
    fn merge(&self, sources: Sources<T>, sink: &mut dyn FnMut(T) -> CoreResult<()>) -> CoreResult<()>;
}

/// Appends all sources in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatenateCombiner;

impl<T> SegmentCombiner<T> for ConcatenateCombiner {
    fn merge(&self, sources: Sources<T>, sink: &mut dyn FnMut(T) -> CoreResult<()>) -> CoreResult<()> {
        for source in sources {
            for record in source {
                sink(record?)?;
            }
        }
        Ok(())
    }
}

/// Concatenates sources, dropping records the predicate rejects.
///
/// Compaction with a retain combiner doubles as garbage collection of
/// expired or deleted records.
pub struct RetainCombiner<F> {
    keep: F,
}

impl<F> RetainCombiner<F> {
    /// Keeps records for which `keep` returns true.
    pub fn new(keep: F) -> Self {
        Self { keep }
    }
}

impl<T, F> SegmentCombiner<T> for RetainCombiner<F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn merge(&self, sources: Sources<T>, sink: &mut dyn FnMut(T) -> CoreResult<()>) -> CoreResult<()> {
        for source in sources {
            for record in source {
                let record = record?;
                if (self.keep)(&record) {
                    sink(record)?;
                }
            }
        }
        Ok(())
    }
}

/// K-way merge of sorted sources into one sorted run.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeCombiner {
    unique: bool,
}

impl MergeCombiner {
    /// Emits equal records once, keeping the one from the newest source.
    #[must_use]
    pub fn unique() -> Self {
        Self { unique: true }
    }

    /// Emits every record.
    #[must_use]
    pub fn non_unique() -> Self {
        Self { unique: false }
    }
}

struct Head<T> {
    record: T,
    source: usize,
}

impl<T: Ord> PartialEq for Head<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for Head<T> {}

impl<T: Ord> PartialOrd for Head<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Head<T> {
    // BinaryHeap is a max-heap: smallest record first, then newest source.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .record
            .cmp(&self.record)
            .then(self.source.cmp(&other.source))
    }
}

fn advance<T>(
    sources: &mut [Box<dyn LogIterator<T>>],
    heap: &mut BinaryHeap<Head<T>>,
    source: usize,
) -> CoreResult<()>
where
    T: Ord,
{
    if let Some(record) = sources[source].next().transpose()? {
        heap.push(Head { record, source });
    }
    Ok(())
}

impl<T: Ord> SegmentCombiner<T> for MergeCombiner {
    fn merge(&self, mut sources: Sources<T>, sink: &mut dyn FnMut(T) -> CoreResult<()>) -> CoreResult<()> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for source in 0..sources.len() {
            advance(&mut sources, &mut heap, source)?;
        }
        while let Some(Head { record, source }) = heap.pop() {
            advance(&mut sources, &mut heap, source)?;
            if self.unique {
                while heap.peek().is_some_and(|next| next.record == record) {
                    if let Some(duplicate) = heap.pop() {
                        advance(&mut sources, &mut heap, duplicate.source)?;
                    }
                }
            }
            sink(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    struct VecIter<T> {
        items: std::vec::IntoIter<CoreResult<T>>,
        position: u64,
    }

    impl<T: Send> Iterator for VecIter<T> {
        type Item = CoreResult<T>;

        fn next(&mut self) -> Option<Self::Item> {
            self.position += 1;
            self.items.next()
        }
    }

    impl<T: Send> LogIterator<T> for VecIter<T> {
        fn address(&self) -> u64 {
            self.position
        }
    }

    fn source<T: Send + 'static>(items: Vec<T>) -> Box<dyn LogIterator<T>> {
        Box::new(VecIter {
            items: items.into_iter().map(Ok).collect::<Vec<_>>().into_iter(),
            position: 0,
        })
    }

    fn run<C: SegmentCombiner<u32>>(combiner: &C, sources: Vec<Vec<u32>>) -> CoreResult<Vec<u32>> {
        let mut out = Vec::new();
        combiner.merge(
            sources.into_iter().map(source).collect(),
            &mut |record| {
                out.push(record);
                Ok(())
            },
        )?;
        Ok(out)
    }

    #[test]
    fn concatenate_keeps_order() {
        let out = run(&ConcatenateCombiner, vec![vec![3, 1], vec![2], vec![]]).unwrap();
        assert_eq!(out, vec![3, 1, 2]);
    }

    #[test]
    fn retain_drops_rejected_records() {
        let combiner = RetainCombiner::new(|r: &u32| r % 2 == 0);
        let out = run(&combiner, vec![vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!(out, vec![2, 4, 6]);
    }

    #[test]
    fn merge_sorts_across_sources() {
        let out = run(
            &MergeCombiner::non_unique(),
            vec![vec![1, 4, 7], vec![2, 4, 8], vec![3, 9]],
        )
        .unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 4, 7, 8, 9]);
    }

    #[test]
    fn unique_merge_drops_duplicates() {
        let out = run(
            &MergeCombiner::unique(),
            vec![vec![1, 2, 3], vec![2, 3, 4], vec![3, 5]],
        )
        .unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[derive(Debug)]
    struct Keyed {
        key: u32,
        source: &'static str,
    }

    impl PartialEq for Keyed {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }
    impl Eq for Keyed {}
    impl PartialOrd for Keyed {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for Keyed {
        fn cmp(&self, other: &Self) -> Ordering {
            self.key.cmp(&other.key)
        }
    }

    #[test]
    fn unique_merge_prefers_newest_source() {
        let older = vec![Keyed { key: 1, source: "old" }, Keyed { key: 2, source: "old" }];
        let newer = vec![Keyed { key: 2, source: "new" }];
        let mut out = Vec::new();
        MergeCombiner::unique()
            .merge(vec![source(older), source(newer)], &mut |r| {
                out.push(r);
                Ok(())
            })
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].source, "new");
    }

    #[test]
    fn source_error_aborts_merge() {
        let failing: Box<dyn LogIterator<u32>> = Box::new(VecIter {
            items: vec![Ok(1), Err(CoreError::corrupted("bad block"))].into_iter(),
            position: 0,
        });
        let result = ConcatenateCombiner.merge(vec![failing], &mut |_| Ok(()));
        assert!(matches!(result, Err(CoreError::Corrupted { .. })));
    }
}
