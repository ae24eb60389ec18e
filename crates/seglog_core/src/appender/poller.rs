use super::levels::LevelsView;
use super::Shared;
use crate::error::{CoreError, CoreResult};
use crate::segment::{Direction, Log, LogIterator};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wakes parked pollers when the log changes.
#[derive(Debug, Default)]
pub struct Notifier {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl Notifier {
    /// Current change counter.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Records a change and wakes every waiter.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Parks until the counter moves past `seen` or `deadline` passes.
    pub fn wait(&self, seen: u64, deadline: Instant) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.condvar.wait_until(&mut generation, deadline).timed_out() {
                return;
            }
        }
    }
}

/// Closes a [`Poller`] from another thread.
#[derive(Clone)]
pub struct PollerCloser {
    closed: Arc<AtomicBool>,
    wake: Arc<dyn Fn() + Send + Sync>,
}

impl PollerCloser {
    /// Closes the poller; a parked `poll` returns promptly.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        (self.wake)();
    }
}

impl std::fmt::Debug for PollerCloser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerCloser")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// A blocking, position-tracked reader that tails the log.
///
/// A poller walks the segments in log order and parks when it catches
/// up with the head. When the segment it is reading gets compacted away
/// it continues with the segment that absorbed it, so delivery is
/// at-least-once across compactions.
pub struct Poller<T, L> {
    shared: Arc<Shared<L>>,
    view: Arc<LevelsView<L>>,
    index: usize,
    segment: Arc<L>,
    iter: Box<dyn LogIterator<T>>,
    peeked: Option<(u64, T)>,
    closed: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl<T: Send + 'static, L: Log<T> + 'static> Poller<T, L> {
    pub(crate) fn new(shared: Arc<Shared<L>>, start: Option<u64>) -> CoreResult<Self> {
        shared.check_open()?;
        let view = shared.view();
        let (index, iter) = match start {
            None => {
                let segment = view
                    .segments()
                    .first()
                    .ok_or_else(|| CoreError::state("log has no segments"))?;
                (0, segment.iter(Direction::Forward)?)
            }
            Some(address) => {
                let (id, offset) = shared.address.decode(address);
                match view.index_of(id) {
                    Some(index) => (index, view.segments()[index].iter_from(offset, Direction::Forward)?),
                    None => {
                        let successor = view.successor(id).ok_or_else(|| {
                            CoreError::invalid_argument(format!("address {address} is past the end of the log"))
                        })?;
                        let index = view.index_of(successor.id()).unwrap_or(0);
                        (index, successor.iter(Direction::Forward)?)
                    }
                }
            }
        };
        let segment = Arc::clone(&view.segments()[index]);
        let poll_timeout = shared.config.poll_timeout;
        Ok(Self {
            shared,
            view,
            index,
            segment,
            iter,
            peeked: None,
            closed: Arc::new(AtomicBool::new(false)),
            poll_timeout,
        })
    }

    /// Next record, waiting up to `timeout` for one to be appended.
    ///
    /// Returns `Ok(None)` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Closed`] once the poller or the log is closed,
    /// or the read error hit.
    pub fn poll(&mut self, timeout: Duration) -> CoreResult<Option<T>> {
        if let Some((_, record)) = self.peeked.take() {
            return Ok(Some(record));
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.check_open()?;
            let seen = self.shared.notifier.generation();
            if let Some(record) = self.iter.next() {
                return record.map(Some);
            }
            if self.segment.is_read_only() {
                // Records appended right before the roll.
                if let Some(record) = self.iter.next() {
                    return record.map(Some);
                }
                if self.advance()? {
                    continue;
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.shared.notifier.wait(seen, deadline);
        }
    }

    /// Blocks until a record arrives; `None` once closed.
    ///
    /// # Errors
    ///
    /// Returns the read error hit.
    pub fn take(&mut self) -> CoreResult<Option<T>> {
        loop {
            match self.poll(self.poll_timeout) {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(CoreError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    /// The next record without consuming it, if one is available now.
    ///
    /// # Errors
    ///
    /// Same as [`Poller::poll`].
    pub fn peek(&mut self) -> CoreResult<Option<&T>> {
        if self.peeked.is_none() {
            let position = self.position();
            if let Some(record) = self.poll(Duration::ZERO)? {
                self.peeked = Some((position, record));
            }
        }
        Ok(self.peeked.as_ref().map(|(_, record)| record))
    }

    /// Address to resume from with [`crate::LogReader::poller_from`].
    #[must_use]
    pub fn position(&self) -> u64 {
        match &self.peeked {
            Some((position, _)) => *position,
            None => self.shared.address.pack(self.segment.id(), self.iter.address()),
        }
    }

    /// True when every appended record has been returned.
    #[must_use]
    pub fn is_end_of_log(&self) -> bool {
        if self.peeked.is_some() || self.iter.address() < self.segment.position() {
            return false;
        }
        let latest = self.shared.view();
        latest.head().map(|head| head.id()) == Some(self.segment.id())
    }

    /// Closes the poller.
    pub fn close(&self) {
        self.closer().close();
    }

    /// A handle that closes this poller from another thread.
    #[must_use]
    pub fn closer(&self) -> PollerCloser {
        let shared = Arc::clone(&self.shared);
        PollerCloser {
            closed: Arc::clone(&self.closed),
            wake: Arc::new(move || shared.notifier.notify()),
        }
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        self.shared.check_open()
    }

    /// Moves to the segment after the current one.
    fn advance(&mut self) -> CoreResult<bool> {
        if self.index + 1 >= self.view.segments().len() {
            let latest = self.shared.view();
            let Some(index) = latest
                .successor(self.segment.id())
                .and_then(|next| latest.index_of(next.id()))
            else {
                return Ok(false);
            };
            self.view = latest;
            self.index = index;
        } else {
            self.index += 1;
        }
        self.segment = Arc::clone(&self.view.segments()[self.index]);
        self.iter = self.segment.iter(Direction::Forward)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_on_notify() {
        let notifier = Arc::new(Notifier::default());
        let seen = notifier.generation();
        let waker = Arc::clone(&notifier);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.notify();
        });

        let started = Instant::now();
        notifier.wait(seen, Instant::now() + Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_ne!(notifier.generation(), seen);
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out() {
        let notifier = Notifier::default();
        let started = Instant::now();
        notifier.wait(notifier.generation(), Instant::now() + Duration::from_millis(20));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn stale_generation_does_not_block() {
        let notifier = Notifier::default();
        let seen = notifier.generation();
        notifier.notify();
        let started = Instant::now();
        notifier.wait(seen, Instant::now() + Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
