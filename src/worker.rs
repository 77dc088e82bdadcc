// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::TruncatePlan,
    config::FlushPolicy,
    segment::writer::SegmentFileWriter,
    storage::{SegmentFileName, StorageDirectory},
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Completes a [`TaskFuture`] exactly once.
pub struct Completion(Sender<crate::Result<u64>>);

impl Completion {
    fn complete(self, result: crate::Result<u64>) {
        // NOTE: The caller may have dropped the future; that is fine
        let _ = self.0.send(result);
    }
}

/// Future for a queued I/O task, resolved by the worker once the task's
/// effect is durable on disk
///
/// Futures complete in task order: when one completes, every
/// lower-indexed task's future has completed already. Dropping a future
/// does not cancel the task.
pub struct TaskFuture(Receiver<crate::Result<u64>>);

impl TaskFuture {
    /// Blocks until the task is durable, returning its index.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the worker failed or was shut down.
    pub fn wait(self) -> crate::Result<u64> {
        self.0
            .recv()
            .unwrap_or_else(|_| Err(crate::Error::LogPoisoned("log worker terminated".into())))
    }

    /// Like [`TaskFuture::wait`], but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Will return `Err` on timeout, worker failure or shutdown.
    pub fn wait_timeout(self, timeout: Duration) -> crate::Result<u64> {
        match self.0.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "task not durable in time",
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(crate::Error::LogPoisoned("log worker terminated".into()))
            }
        }
    }
}

/// Creates a completion / future pair.
#[must_use]
pub fn completion() -> (Completion, TaskFuture) {
    let (tx, rx) = bounded(1);
    (Completion(tx), TaskFuture(rx))
}

/// Wakes threads waiting for durability progress (flush advancement),
/// used by the facade to unblock appends stalled on cache saturation
pub(crate) struct ProgressNotifier {
    lock: Mutex<()>,
    cond: Condvar,
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        drop(self.lock.lock().expect("lock is poisoned"));
        self.cond.notify_all();
    }

    pub fn wait(&self, timeout: Duration) {
        let guard = self.lock.lock().expect("lock is poisoned");
        let _ = self
            .cond
            .wait_timeout(guard, timeout)
            .expect("lock is poisoned");
    }
}

/// One queued unit of I/O work
pub enum IoTask {
    /// Append a framed entry to the open segment file
    WriteEntry {
        /// Serialized entry blob (unframed)
        bytes: Vec<u8>,

        /// Index of the entry
        index: u64,

        /// Completed after the batch containing the entry is fsynced
        done: Completion,
    },

    /// Open a fresh `log_inprogress_<start>` file
    StartSegment {
        /// First index the segment will hold
        start: u64,
    },

    /// Fsync, close and rename the open segment file
    RollSegment {
        /// First index in the segment
        start: u64,

        /// Last index in the segment
        end: u64,
    },

    /// Cut back / delete segment files
    Truncate {
        /// File work computed by the cache
        plan: TruncatePlan,

        /// First removed index, echoed through the future
        index: u64,

        /// Completed once all file work is durable
        done: Completion,
    },

    /// Force an fsync of the open segment file
    Sync {
        /// Completed once the fsync finished
        done: Completion,
    },

    /// Flush and exit
    Shutdown,
}

/// Single-threaded write-behind I/O worker
///
/// Consumes [`IoTask`]s in FIFO order and publishes the monotonic
/// flushed index. An I/O error is fatal: the worker poisons itself and
/// fails all queued and future tasks, and the facade refuses writes
/// until reopened.
pub struct LogWorker {
    tx: Sender<IoTask>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,

    /// Highest durable index + 1; 0 = nothing durable yet
    flushed: Arc<AtomicU64>,

    poison: Arc<Mutex<Option<String>>>,
}

impl LogWorker {
    /// Spawns the worker thread.
    ///
    /// `writer` carries the recovered open segment file, if one existed
    /// on disk. `initial_flushed` is the highest index recovered, which
    /// is durable by definition.
    pub(crate) fn spawn(
        storage: StorageDirectory,
        writer: Option<SegmentFileWriter>,
        policy: FlushPolicy,
        initial_flushed: Option<u64>,
        progress: Arc<ProgressNotifier>,
    ) -> Self {
        let (tx, rx) = unbounded();

        let flushed = Arc::new(AtomicU64::new(
            initial_flushed.map_or(0, |index| index + 1),
        ));
        let poison = Arc::new(Mutex::new(None));

        let thread = WorkerThread {
            storage,
            writer,
            pending: Vec::new(),
            batch_started: None,
            policy,
            flushed: flushed.clone(),
            poison: poison.clone(),
            progress,
        };

        let handle = std::thread::Builder::new()
            .name("raft-log-worker".into())
            .spawn(move || thread.run(&rx))
            .expect("should spawn worker thread");

        Self {
            tx,
            handle: Mutex::new(Some(handle)),
            flushed,
            poison,
        }
    }

    /// Enqueues a task.
    pub fn submit(&self, task: IoTask) {
        // NOTE: After shutdown the channel is gone; completions are
        // dropped, so waiting futures observe the termination error
        let _ = self.tx.send(task);
    }

    /// Highest index durably on disk.
    #[must_use]
    pub fn flushed_index(&self) -> Option<u64> {
        self.flushed.load(Ordering::Acquire).checked_sub(1)
    }

    /// Returns the failure reason if the worker poisoned itself.
    #[must_use]
    pub fn poison_reason(&self) -> Option<String> {
        self.poison.lock().expect("lock is poisoned").clone()
    }

    /// Flushes outstanding work and joins the worker thread.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().expect("lock is poisoned").take() else {
            return;
        };

        self.submit(IoTask::Shutdown);

        if handle.join().is_err() {
            log::error!("Log worker thread panicked during shutdown");
        }
    }
}

struct WorkerThread {
    storage: StorageDirectory,
    writer: Option<SegmentFileWriter>,

    /// Entries written but not yet fsynced, in index order
    pending: Vec<(u64, Completion)>,
    batch_started: Option<Instant>,

    policy: FlushPolicy,
    flushed: Arc<AtomicU64>,
    poison: Arc<Mutex<Option<String>>>,
    progress: Arc<ProgressNotifier>,
}

impl WorkerThread {
    fn run(mut self, rx: &Receiver<IoTask>) {
        log::debug!("Log worker started");

        loop {
            let task = if let Some(batch_started) = self.batch_started {
                match rx.recv_deadline(batch_started + self.policy.interval) {
                    Ok(task) => task,
                    Err(RecvTimeoutError::Timeout) => {
                        self.flush();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match rx.recv() {
                    Ok(task) => task,
                    Err(_) => break,
                }
            };

            if matches!(task, IoTask::Shutdown) {
                break;
            }

            if let Some(reason) = self.poison.lock().expect("lock is poisoned").clone() {
                Self::fail_task(task, &reason);
                continue;
            }

            if let Err(e) = self.handle(task) {
                self.poison_with(&e.to_string());
            }
        }

        self.flush();

        if let Some(writer) = &mut self.writer {
            if let Err(e) = writer.sync() {
                log::error!("Final sync failed: {e:?}");
            }
        }

        log::debug!("Log worker exiting");
    }

    fn handle(&mut self, task: IoTask) -> crate::Result<()> {
        match task {
            IoTask::WriteEntry { bytes, index, done } => {
                let Some(writer) = &mut self.writer else {
                    done.complete(Err(crate::Error::Corrupt("write without open segment")));
                    return Err(crate::Error::Corrupt("write without open segment"));
                };

                match writer.append(&bytes) {
                    Ok(_) => {
                        self.pending.push((index, done));
                        self.batch_started.get_or_insert_with(Instant::now);

                        if self.pending.len() >= self.policy.entries {
                            self.flush();
                        }

                        Ok(())
                    }
                    Err(e) => {
                        let error = crate::Error::Io(e);
                        done.complete(Err(crate::Error::LogPoisoned(error.to_string())));
                        Err(error)
                    }
                }
            }

            IoTask::StartSegment { start } => {
                debug_assert!(self.writer.is_none(), "previous segment still open");

                let path = self
                    .storage
                    .segment_path(&SegmentFileName::Open { start });
                self.writer = Some(SegmentFileWriter::create(path)?);

                Ok(())
            }

            IoTask::RollSegment { start, end } => {
                // Entries of the sealed segment become durable here
                self.flush();

                let Some(writer) = self.writer.take() else {
                    return Err(crate::Error::Corrupt("roll without open segment"));
                };

                let closed_path = self
                    .storage
                    .segment_path(&SegmentFileName::Closed { start, end });
                writer.seal(&closed_path)?;
                self.storage.sync()?;

                Ok(())
            }

            IoTask::Truncate { plan, index, done } => {
                self.flush();

                match self.apply_truncation(&plan) {
                    Ok(()) => {
                        done.complete(Ok(index));
                        Ok(())
                    }
                    Err(e) => {
                        done.complete(Err(crate::Error::LogPoisoned(e.to_string())));
                        Err(e)
                    }
                }
            }

            IoTask::Sync { done } => {
                self.flush();

                let result = match &mut self.writer {
                    Some(writer) => writer.sync().map_err(crate::Error::from),
                    None => Ok(()),
                };

                match result {
                    Ok(()) => {
                        done.complete(Ok(self.flushed.load(Ordering::Acquire).saturating_sub(1)));
                        Ok(())
                    }
                    Err(e) => {
                        done.complete(Err(crate::Error::LogPoisoned(e.to_string())));
                        Err(e)
                    }
                }
            }

            IoTask::Shutdown => Ok(()),
        }
    }

    fn apply_truncation(&mut self, plan: &TruncatePlan) -> crate::Result<()> {
        for name in &plan.delete {
            // The open segment may be among the deleted files
            if let (SegmentFileName::Open { .. }, Some(_)) = (name, &self.writer) {
                self.writer = None;
            }

            let path = self.storage.segment_path(name);
            log::debug!("Deleting segment file {}", path.display());
            std::fs::remove_file(path)?;
        }

        if let Some(partial) = &plan.partial {
            match partial.new_name {
                // Open segment: cut the live writer back
                None => {
                    let writer = self
                        .writer
                        .as_mut()
                        .ok_or(crate::Error::Corrupt("truncating missing open segment"))?;
                    writer.truncate(partial.keep_len)?;
                }

                // Closed segment: cut the file and rename it
                Some(new_name) => {
                    let old_path = self.storage.segment_path(&partial.old_name);

                    let file = std::fs::File::options().write(true).open(&old_path)?;
                    file.set_len(partial.keep_len)?;
                    file.sync_all()?;
                    drop(file);

                    std::fs::rename(&old_path, self.storage.segment_path(&new_name))?;
                }
            }
        }

        self.storage.sync()?;

        Ok(())
    }

    /// Fsyncs the open file and completes the pending batch in
    /// index order.
    fn flush(&mut self) {
        if self.pending.is_empty() {
            self.batch_started = None;
            return;
        }

        let result = match &mut self.writer {
            Some(writer) => writer.sync(),
            // Pending entries but no writer only happens mid-poisoning
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                let highest = self
                    .pending
                    .last()
                    .map(|(index, _)| *index)
                    .expect("batch is non-empty");

                for (index, done) in self.pending.drain(..) {
                    done.complete(Ok(index));
                }

                self.flushed.store(highest + 1, Ordering::Release);
                self.batch_started = None;

                log::trace!("Flushed up to index {highest}");
                self.progress.notify();
            }
            Err(e) => self.poison_with(&e.to_string()),
        }
    }

    /// First I/O failure: fail the whole pending batch and refuse all
    /// further work.
    fn poison_with(&mut self, reason: &str) {
        log::error!("Log worker poisoned: {reason}");

        *self.poison.lock().expect("lock is poisoned") = Some(reason.to_string());

        for (_, done) in self.pending.drain(..) {
            done.complete(Err(crate::Error::LogPoisoned(reason.to_string())));
        }
        self.batch_started = None;

        self.progress.notify();
    }

    fn fail_task(task: IoTask, reason: &str) {
        match task {
            IoTask::WriteEntry { done, .. }
            | IoTask::Truncate { done, .. }
            | IoTask::Sync { done } => {
                done.complete(Err(crate::Error::LogPoisoned(reason.to_string())));
            }
            IoTask::StartSegment { .. } | IoTask::RollSegment { .. } | IoTask::Shutdown => {}
        }
    }
}
