//! Background compaction.
//!
//! A single coordinator thread owns the [`Levels`] and serializes every
//! layout change: rolls from the writer and the outcome of merge jobs.
//! At most one merge runs at a time, on its own worker thread; running
//! merges one by one keeps each level's segments ordered by age.
//!
//! ```text
//!  writer ──Roll──▶ ┌─────────────┐ ──spawn──▶ worker (merge level N)
//!  caller ─Compact─▶ │ coordinator │ ◀─Completed─┘
//!                    └─────────────┘ ──publish──▶ LevelsView (readers)
//! ```

use super::combiner::SegmentCombiner;
use super::levels::Levels;
use super::naming::segment_name;
use super::Shared;
use crate::error::{CoreError, CoreResult};
use crate::segment::{Direction, Log, LogIterator, SegmentFactory, SegmentInfo, SegmentInit, SegmentType, LOG_START};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

enum Command<L> {
    Roll {
        head: Arc<L>,
        reply: Sender<CoreResult<()>>,
    },
    Compact {
        level: Option<u32>,
    },
    Completed {
        level: u32,
        sources: Vec<u64>,
        result: CoreResult<Arc<L>>,
    },
    AwaitIdle {
        reply: Sender<()>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Handle to the coordinator thread.
pub(crate) struct Compactor<L> {
    sender: Sender<Command<L>>,
    thread: Option<JoinHandle<()>>,
}

impl<L: SegmentInfo + 'static> Compactor<L> {
    /// Starts the coordinator for `levels`.
    pub(crate) fn spawn<T, F>(
        levels: Levels<L>,
        shared: Arc<Shared<L>>,
        factory: Arc<F>,
        combiner: Arc<dyn SegmentCombiner<T>>,
    ) -> CoreResult<Self>
    where
        T: Send + 'static,
        F: SegmentFactory<T, Segment = L>,
        L: Log<T>,
    {
        let (sender, receiver) = mpsc::channel();
        let coordinator = Coordinator {
            levels,
            shared,
            factory,
            combiner,
            commands: sender.clone(),
            queue: VecDeque::new(),
            running: None,
            idle: Vec::new(),
            shutdown: None,
        };
        let thread = thread::Builder::new()
            .name("seglog-compaction".to_string())
            .spawn(move || coordinator.run(&receiver))?;
        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Moves the rolled head to level 1 and installs `head`.
    pub(crate) fn roll(&self, head: Arc<L>) -> CoreResult<()> {
        let (reply, response) = mpsc::channel();
        self.send(Command::Roll { head, reply })?;
        response.recv().map_err(|_| CoreError::Closed)?
    }

    /// Requests compaction of `level`, or of every level.
    pub(crate) fn compact(&self, level: Option<u32>) -> CoreResult<()> {
        self.send(Command::Compact { level })
    }

    /// Blocks until no merge is running or queued.
    pub(crate) fn await_idle(&self) -> CoreResult<()> {
        let (reply, response) = mpsc::channel();
        self.send(Command::AwaitIdle { reply })?;
        response.recv().map_err(|_| CoreError::Closed)
    }
}

impl<L> Compactor<L> {
    /// Waits for the running merge, then stops the coordinator.
    pub(crate) fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let (reply, response) = mpsc::channel();
        if self.sender.send(Command::Shutdown { reply }).is_ok() {
            let _ = response.recv();
        }
        if thread.join().is_err() {
            error!("compaction thread panicked");
        }
    }

    fn send(&self, command: Command<L>) -> CoreResult<()> {
        if self.thread.is_none() {
            return Err(CoreError::Closed);
        }
        self.sender.send(command).map_err(|_| CoreError::Closed)
    }
}

impl<L> Drop for Compactor<L> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Running {
    level: u32,
    thread: JoinHandle<()>,
}

struct Coordinator<T, F: SegmentFactory<T>> {
    levels: Levels<F::Segment>,
    shared: Arc<Shared<F::Segment>>,
    factory: Arc<F>,
    combiner: Arc<dyn SegmentCombiner<T>>,
    commands: Sender<Command<F::Segment>>,
    queue: VecDeque<u32>,
    running: Option<Running>,
    idle: Vec<Sender<()>>,
    shutdown: Option<Sender<()>>,
}

impl<T: Send + 'static, F: SegmentFactory<T>> Coordinator<T, F> {
    fn run(mut self, receiver: &Receiver<Command<F::Segment>>) {
        debug!("compaction coordinator started");
        while let Ok(command) = receiver.recv() {
            match command {
                Command::Roll { head, reply } => {
                    let _ = reply.send(self.roll(head));
                }
                Command::Compact { level } => self.request(level),
                Command::Completed {
                    level,
                    sources,
                    result,
                } => self.completed(level, &sources, result),
                Command::AwaitIdle { reply } => self.idle.push(reply),
                Command::Shutdown { reply } => {
                    self.queue.clear();
                    self.shutdown = Some(reply);
                }
            }

            if self.shutdown.is_none() {
                self.schedule();
            }
            if self.running.is_none() && self.queue.is_empty() {
                for waiter in self.idle.drain(..) {
                    let _ = waiter.send(());
                }
                if let Some(reply) = self.shutdown.take() {
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("compaction coordinator stopped");
    }

    fn roll(&mut self, head: Arc<F::Segment>) -> CoreResult<()> {
        let previous = self.levels.roll(head)?;
        self.shared.publish(self.levels.view());
        if let Err(e) = self.shared.persist_state() {
            error!(error = %e, "failed to persist state after roll");
        }
        debug!(segment = previous.name(), "segment rolled to level 1");
        if !self.shared.config.compaction_disabled {
            self.enqueue(1);
        }
        Ok(())
    }

    fn request(&mut self, level: Option<u32>) {
        match level {
            Some(level) => self.enqueue(level),
            None => {
                for level in 1..self.levels.depth() as u32 {
                    self.enqueue(level);
                }
            }
        }
    }

    fn enqueue(&mut self, level: u32) {
        if level > 0 && !self.queue.contains(&level) {
            self.queue.push_back(level);
        }
    }

    fn completed(&mut self, level: u32, sources: &[u64], result: CoreResult<Arc<F::Segment>>) {
        if let Some(running) = self.running.take() {
            if running.thread.join().is_err() {
                error!(level = running.level, "compaction worker panicked");
            }
        }
        let target = match result {
            Ok(target) => target,
            Err(CoreError::Closed) => {
                debug!(level, "compaction abandoned on close");
                return;
            }
            Err(e) => {
                error!(level, error = %e, "compaction failed");
                return;
            }
        };

        match self.levels.merge(level, sources, Arc::clone(&target)) {
            Ok(removed) => {
                self.shared.publish(self.levels.view());
                if let Err(e) = self.shared.persist_state() {
                    error!(error = %e, "failed to persist state after compaction");
                }
                for segment in &removed {
                    segment.delete();
                }
                info!(
                    level,
                    merged = removed.len(),
                    target = target.name(),
                    entries = target.entries(),
                    "level compacted"
                );
                if !self.shared.config.compaction_disabled {
                    self.enqueue(level);
                    self.enqueue(level + 1);
                }
            }
            Err(e) => {
                error!(level, error = %e, "compaction result rejected");
                target.delete();
            }
        }
    }

    fn schedule(&mut self) {
        if self.running.is_some() {
            return;
        }
        while let Some(level) = self.queue.pop_front() {
            if !self.levels.requires_compaction(level) {
                continue;
            }
            let sources = self.levels.segments_for_compaction(level);
            let id = match self.shared.allocate_id() {
                Ok(id) => id,
                Err(e) => {
                    error!(level, error = %e, "cannot allocate a compaction target");
                    continue;
                }
            };
            match self.start(level, sources, id) {
                Ok(thread) => {
                    self.running = Some(Running { level, thread });
                    return;
                }
                Err(e) => error!(level, error = %e, "failed to start compaction worker"),
            }
        }
    }

    fn start(&self, level: u32, sources: Vec<Arc<F::Segment>>, id: u64) -> CoreResult<JoinHandle<()>> {
        let task = MergeTask {
            factory: Arc::clone(&self.factory),
            combiner: Arc::clone(&self.combiner),
            shared: Arc::clone(&self.shared),
            level,
            sources,
            id,
        };
        let commands = self.commands.clone();
        let thread = thread::Builder::new()
            .name(format!("seglog-merge-{level}"))
            .spawn(move || {
                let sources = task.sources.iter().map(|s| s.id()).collect();
                let result = task.run();
                let _ = commands.send(Command::Completed {
                    level,
                    sources,
                    result,
                });
            })?;
        Ok(thread)
    }
}

/// Merges the sources of one level into a new segment of the next.
struct MergeTask<T, F: SegmentFactory<T>> {
    factory: Arc<F>,
    combiner: Arc<dyn SegmentCombiner<T>>,
    shared: Arc<Shared<F::Segment>>,
    level: u32,
    sources: Vec<Arc<F::Segment>>,
    id: u64,
}

impl<T: Send + 'static, F: SegmentFactory<T>> MergeTask<T, F> {
    fn run(&self) -> CoreResult<Arc<F::Segment>> {
        let started = Instant::now();
        let name = segment_name(&self.shared.config.name_prefix, self.id);
        let size: u64 = self.sources.iter().map(|s| s.size()).sum();
        let init = SegmentInit {
            id: self.id,
            level: self.level + 1,
            segment_type: SegmentType::MergeOut,
            length: LOG_START + size,
        };
        debug!(
            level = self.level,
            sources = self.sources.len(),
            target = %name,
            "compaction started"
        );

        let target = self.factory.create(&self.shared.dir.file(&name), init)?;
        if let Err(e) = self.fill(&target) {
            target.delete();
            return Err(e);
        }
        debug!(
            level = self.level,
            target = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compaction finished"
        );
        Ok(Arc::new(target))
    }

    fn fill(&self, target: &F::Segment) -> CoreResult<()> {
        let sources = self
            .sources
            .iter()
            .map(|s| s.iter(Direction::Forward))
            .collect::<CoreResult<Vec<Box<dyn LogIterator<T>>>>>()?;
        self.combiner.merge(sources, &mut |record| {
            if self.shared.is_closed() {
                return Err(CoreError::Closed);
            }
            target.append(&record).map(|_| ())
        })?;
        target.roll(self.level + 1)
    }
}
