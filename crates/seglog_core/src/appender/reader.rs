use super::address::AddressCodec;
use super::poller::Poller;
use super::Shared;
use crate::error::{CoreError, CoreResult};
use crate::segment::{Direction, Log, LogIterator};
use std::marker::PhantomData;
use std::sync::Arc;

/// Read access to a log, cloneable across threads.
///
/// Every operation works on the segment layout current when it starts;
/// compactions finishing later do not disturb it.
pub struct LogReader<T, L> {
    shared: Arc<Shared<L>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, L> Clone for LogReader<T, L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<T, L> std::fmt::Debug for LogReader<T, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReader")
            .field("path", &self.shared.dir.path())
            .finish()
    }
}

impl<T: Send + 'static, L: Log<T> + 'static> LogReader<T, L> {
    pub(crate) fn new(shared: Arc<Shared<L>>) -> Self {
        Self {
            shared,
            _marker: PhantomData,
        }
    }

    /// Reads the record at `address`.
    ///
    /// Returns `None` when nothing is stored there, including addresses of
    /// segments that were compacted away.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed or the record is damaged.
    pub fn get(&self, address: u64) -> CoreResult<Option<T>> {
        self.shared.check_open()?;
        let (id, offset) = self.shared.address.decode(address);
        match self.shared.view().get(id) {
            Some(segment) => segment.get(offset),
            None => Ok(None),
        }
    }

    /// Iterates the whole log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed.
    pub fn iter(&self, direction: Direction) -> CoreResult<LogIter<T, L>> {
        self.shared.check_open()?;
        let segments = self.segments(direction);
        let current = match segments.first() {
            Some(segment) => Some(segment.iter(direction)?),
            None => None,
        };
        Ok(LogIter::new(segments, current, direction, self.shared.address))
    }

    /// Iterates from `address`.
    ///
    /// A forward iterator starting in a compacted segment starts at the
    /// segment that absorbed it.
    ///
    /// # Errors
    ///
    /// Returns an error if the address lies outside the log.
    pub fn iter_from(&self, address: u64, direction: Direction) -> CoreResult<LogIter<T, L>> {
        self.shared.check_open()?;
        let (id, offset) = self.shared.address.decode(address);
        let view = self.shared.view();
        let outside = || CoreError::invalid_argument(format!("address {address:#x} is outside the log"));

        let (index, current) = match view.index_of(id) {
            Some(index) => (index, view.segments()[index].iter_from(offset, direction)?),
            None if direction == Direction::Forward => {
                let successor = view.successor(id).ok_or_else(outside)?;
                let index = view.index_of(successor.id()).ok_or_else(outside)?;
                (index, successor.iter(direction)?)
            }
            None => return Err(outside()),
        };
        let segments = match direction {
            Direction::Forward => view.segments()[index..].to_vec(),
            Direction::Backward => view.segments()[..=index].iter().rev().cloned().collect(),
        };
        Ok(LogIter::new(segments, Some(current), direction, self.shared.address))
    }

    /// A poller starting at the oldest record.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is closed.
    pub fn poller(&self) -> CoreResult<Poller<T, L>> {
        Poller::new(Arc::clone(&self.shared), None)
    }

    /// A poller resuming at `address`, typically a saved
    /// [`Poller::position`].
    ///
    /// # Errors
    ///
    /// Returns an error if the address is past the end of the log.
    pub fn poller_from(&self, address: u64) -> CoreResult<Poller<T, L>> {
        Poller::new(Arc::clone(&self.shared), Some(address))
    }

    /// Total records.
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.shared.view().entries()
    }

    /// Address the next append will get, unless the head rolls first.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.shared
            .view()
            .head()
            .map_or(0, |head| self.shared.address.pack(head.id(), head.position()))
    }

    /// Total record bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.view().size()
    }

    /// Number of levels.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.shared.view().depth()
    }

    /// Names of the segments of `level`, oldest first.
    #[must_use]
    pub fn level_segments(&self, level: u32) -> Vec<String> {
        self.shared
            .view()
            .layout()
            .get(level as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// All segments in log order.
    #[must_use]
    pub fn segments(&self, direction: Direction) -> Vec<Arc<L>> {
        let view = self.shared.view();
        match direction {
            Direction::Forward => view.segments().to_vec(),
            Direction::Backward => view.segments().iter().rev().cloned().collect(),
        }
    }
}

/// Iterator over the records of several segments.
///
/// Holds the segments it was created with, so compacted segments stay
/// readable until the iterator is dropped.
pub struct LogIter<T, L> {
    segments: Vec<Arc<L>>,
    index: usize,
    current: Option<Box<dyn LogIterator<T>>>,
    direction: Direction,
    address: AddressCodec,
    failed: bool,
}

impl<T, L> LogIter<T, L> {
    fn new(
        segments: Vec<Arc<L>>,
        current: Option<Box<dyn LogIterator<T>>>,
        direction: Direction,
        address: AddressCodec,
    ) -> Self {
        Self {
            segments,
            index: 0,
            current,
            direction,
            address,
            failed: false,
        }
    }
}

impl<T: Send + 'static, L: Log<T> + 'static> Iterator for LogIter<T, L> {
    type Item = CoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            match self.current.as_mut()?.next() {
                Some(Ok(record)) => return Some(Ok(record)),
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                None => {}
            }
            if self.index + 1 >= self.segments.len() {
                return None;
            }
            self.index += 1;
            match self.segments[self.index].iter(self.direction) {
                Ok(iter) => self.current = Some(iter),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl<T: Send + 'static, L: Log<T> + 'static> LogIterator<T> for LogIter<T, L> {
    fn address(&self) -> u64 {
        match (self.segments.get(self.index), &self.current) {
            (Some(segment), Some(current)) => self.address.pack(segment.id(), current.address()),
            _ => 0,
        }
    }
}
