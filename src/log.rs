// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::{LogCache, TruncatePlan},
    client::PeerId,
    coding::Encode,
    config::Config,
    entry::LogEntry,
    metadata::Metadata,
    segment::{reader::SegmentFileReader, writer::frame_len, writer::SegmentFileWriter},
    server::RaftServer,
    storage::{SegmentFile, SegmentFileName, StorageDirectory},
    worker::{completion, IoTask, LogWorker, ProgressNotifier, TaskFuture},
    TermIndex,
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

/// How long a saturated append waits before re-checking whether
/// eviction became possible
const SATURATION_RECHECK: Duration = Duration::from_millis(100);

/// The segmented durable Raft log
///
/// Read/write entry point over the segment cache and the write-behind
/// I/O worker. One writer at a time (write lock), any number of readers
/// (read lock); durability work is queued to the worker and surfaced as
/// [`TaskFuture`]s that resolve after fsync.
#[derive(Clone)]
pub struct RaftLog(Arc<RaftLogInner>);

impl std::ops::Deref for RaftLog {
    type Target = RaftLogInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct RaftLogInner {
    storage: StorageDirectory,
    config: Config,
    server: Arc<dyn RaftServer>,

    cache: RwLock<LogCache>,
    worker: LogWorker,
    progress: Arc<ProgressNotifier>,

    closed: AtomicBool,
}

impl Drop for RaftLogInner {
    fn drop(&mut self) {
        self.worker.shutdown();
    }
}

/// Reads all entries of one segment file back from disk.
fn read_segment_entries(path: &Path) -> crate::Result<Vec<LogEntry>> {
    let reader = SegmentFileReader::new(path)?;

    reader
        .map(|record| record.map(|record| record.entry))
        .collect()
}

impl RaftLog {
    /// Opens (or recovers) the log below `root`, replaying every entry
    /// with index above `last_snapshot_index` through `consumer`.
    ///
    /// If the snapshot is ahead of the log's end, the log contents are
    /// discarded and the segment files scheduled for deletion, since
    /// keeping them would leave a gap below the snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the segment files
    /// are inconsistent.
    pub fn open<P: AsRef<Path>>(
        root: P,
        config: Config,
        server: Arc<dyn RaftServer>,
        last_snapshot_index: Option<u64>,
        consumer: &mut dyn FnMut(&LogEntry),
    ) -> crate::Result<Self> {
        let storage = StorageDirectory::open(root)?;
        let files = storage.list_segment_files()?;

        let (closed_files, open_file) = Self::partition_files(&storage, files)?;

        let mut cache = LogCache::new(config.cache_max_segments);

        // Only the most recent closed segments keep their entries
        let keep_from = closed_files.len().saturating_sub(config.cache_max_segments);

        let mut replay = |entry: &LogEntry| {
            if last_snapshot_index.map_or(true, |snapshot| entry.index > snapshot) {
                consumer(entry);
            }
        };

        for (position, file) in closed_files.iter().enumerate() {
            let outcome = cache.load_segment(
                &file.path,
                file.name,
                position >= keep_from,
                &mut replay,
            )?;

            if outcome.loaded == 0 {
                // Closed segment with no recoverable record; a gap error
                // follows on the next file if this was not the tail
                storage.quarantine(&file.path)?;
                continue;
            }

            let actual_end = cache.end_index().expect("segment was non-empty");
            let named_end = match file.name {
                SegmentFileName::Closed { end, .. } => end,
                SegmentFileName::Open { .. } => unreachable!("file was partitioned as closed"),
            };

            if outcome.truncated_tail || actual_end != named_end {
                Self::repair_closed_tail(&storage, file, actual_end, outcome.valid_len)?;
            }
        }

        // The open segment is always fully materialized; its writer is
        // handed to the worker, cut back past any torn tail
        let mut writer = None;

        if let Some(file) = &open_file {
            let outcome = cache.load_segment(&file.path, file.name, true, &mut replay)?;
            writer = Some(SegmentFileWriter::recover(&file.path, outcome.valid_len)?);
        }

        let end_index = cache.end_index();

        // A snapshot ahead of the log invalidates everything on disk
        let mut purge = None;

        if let Some(snapshot) = last_snapshot_index {
            if end_index.map_or(true, |end| end < snapshot) && !cache.segments().is_empty() {
                log::info!(
                    "Snapshot at {snapshot} is ahead of log end {end_index:?}, clearing log",
                );

                purge = Some(TruncatePlan {
                    partial: None,
                    delete: cache.clear(),
                });
                writer = None;
            }
        }

        let progress = Arc::new(ProgressNotifier::new());
        let worker = LogWorker::spawn(
            storage.clone(),
            writer,
            config.flush_policy,
            end_index,
            progress.clone(),
        );

        if let Some(plan) = purge {
            let (done, _future) = completion();
            worker.submit(IoTask::Truncate {
                plan,
                index: 0,
                done,
            });
        }

        log::debug!(
            "Opened log with {} segments, end index {:?}",
            cache.segments().len(),
            cache.end_index(),
        );

        Ok(Self(Arc::new(RaftLogInner {
            storage,
            config,
            server,
            cache: RwLock::new(cache),
            worker,
            progress,
            closed: AtomicBool::new(false),
        })))
    }

    /// Splits the discovered files into ordered closed segments and at
    /// most one usable open segment; stale open files are quarantined.
    fn partition_files(
        storage: &StorageDirectory,
        files: Vec<SegmentFile>,
    ) -> crate::Result<(Vec<SegmentFile>, Option<SegmentFile>)> {
        let mut closed = Vec::new();
        let mut open = Vec::new();

        for file in files {
            match file.name {
                SegmentFileName::Closed { .. } => closed.push(file),
                SegmentFileName::Open { .. } => open.push(file),
            }
        }

        let highest_closed_end = closed
            .last()
            .map(|file| match file.name {
                SegmentFileName::Closed { end, .. } => end,
                SegmentFileName::Open { .. } => unreachable!(),
            });

        // An open segment must continue the log; anything else is a
        // leftover from a crashed roll
        let mut usable = None;

        for file in open.into_iter().rev() {
            let continues = usable.is_none()
                && highest_closed_end.map_or(true, |end| file.name.start_index() == end + 1);

            if continues {
                usable = Some(file);
            } else {
                storage.quarantine(&file.path)?;
            }
        }

        Ok((closed, usable))
    }

    /// Cuts a closed segment file back to its recovered prefix and
    /// renames it to match its actual content.
    fn repair_closed_tail(
        storage: &StorageDirectory,
        file: &SegmentFile,
        actual_end: u64,
        valid_len: u64,
    ) -> crate::Result<()> {
        log::warn!(
            "Closed segment {} ends at {actual_end}, repairing",
            file.path.display(),
        );

        let handle = std::fs::File::options().write(true).open(&file.path)?;
        handle.set_len(valid_len)?;
        handle.sync_all()?;
        drop(handle);

        let repaired = SegmentFileName::Closed {
            start: file.name.start_index(),
            end: actual_end,
        };
        std::fs::rename(&file.path, storage.segment_path(&repaired))?;
        storage.sync()?;

        Ok(())
    }

    fn ensure_writable(&self) -> crate::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::Error::LogPoisoned("log is closed".into()));
        }

        if let Some(reason) = self.worker.poison_reason() {
            return Err(crate::Error::LogPoisoned(reason));
        }

        Ok(())
    }

    /// First index in the log, if any.
    #[must_use]
    pub fn start_index(&self) -> Option<u64> {
        self.cache.read().expect("lock is poisoned").start_index()
    }

    /// Last index in the log, if any.
    #[must_use]
    pub fn end_index(&self) -> Option<u64> {
        self.cache.read().expect("lock is poisoned").end_index()
    }

    /// Highest index durably on disk.
    #[must_use]
    pub fn flushed_index(&self) -> Option<u64> {
        self.worker.flushed_index()
    }

    /// Term-index pair at `index`.
    #[must_use]
    pub fn get_term_index(&self, index: u64) -> Option<TermIndex> {
        self.cache
            .read()
            .expect("lock is poisoned")
            .term_index(index)
    }

    /// Term-index pairs for `[lo, hi)`, stopping at the first missing
    /// index.
    #[must_use]
    pub fn get_entries(&self, lo: u64, hi: u64) -> Vec<TermIndex> {
        self.cache
            .read()
            .expect("lock is poisoned")
            .term_indices(lo, hi)
    }

    /// Term-index pair of the last entry, if any.
    #[must_use]
    pub fn last_entry_term_index(&self) -> Option<TermIndex> {
        self.cache
            .read()
            .expect("lock is poisoned")
            .last_term_index()
    }

    /// Returns the entry at `index`, or `None` outside the log's range.
    ///
    /// The fast path serves from memory under the read lock. If the
    /// segment's entries were evicted, they are re-read from disk
    /// without holding any lock, installed, and eviction re-checked.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs on the slow path.
    pub fn get(&self, index: u64) -> crate::Result<Option<LogEntry>> {
        let (name, start) = {
            let cache = self.cache.read().expect("lock is poisoned");

            let Some(segment) = cache.segment(index) else {
                return Ok(None);
            };

            if let Some(entry) = segment.entry(index) {
                return Ok(Some(entry.clone()));
            }

            (segment.file_name(), segment.start_index)
        };

        // Slow path: no lock across file I/O
        let entries = self.load_entries_for(&name)?;

        let mut cache = self.cache.write().expect("lock is poisoned");

        let result = {
            let Some(position) = cache.segment_position(index) else {
                // Truncated away while we were reading
                return Ok(None);
            };

            let segment = cache.segment_at_mut(position).expect("position is valid");

            if segment.start_index == start
                && !segment.has_entries()
                && entries.len() == segment.records.len()
            {
                segment.entries = Some(entries);
                segment.entry(index).cloned()
            } else {
                // The segment changed under us (e.g. truncated); serve
                // from what was read without installing it
                entries.into_iter().find(|entry| entry.index == index)
            }
        };

        if cache.should_evict() {
            cache.evict(self.evict_floor());
        }

        Ok(result)
    }

    /// Reads a segment's entries, tolerating the roll rename racing us.
    fn load_entries_for(&self, name: &SegmentFileName) -> crate::Result<Vec<LogEntry>> {
        match read_segment_entries(&self.storage.segment_path(name)) {
            Ok(entries) => Ok(entries),

            // A closed-in-cache segment may still carry its in-progress
            // name until the worker processes the roll
            Err(crate::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let fallback = SegmentFileName::Open {
                    start: name.start_index(),
                };
                read_segment_entries(&self.storage.segment_path(&fallback))
            }

            Err(e) => Err(e),
        }
    }

    /// `min(min(followerNextIndices), flushedIndex, lastAppliedIndex)`:
    /// below this nothing will ever need the in-memory entries again.
    fn evict_floor(&self) -> u64 {
        let follower_floor = self
            .server
            .follower_next_indices()
            .values()
            .copied()
            .min()
            .unwrap_or(u64::MAX);

        let flushed = self.worker.flushed_index().unwrap_or(0);
        let applied = self.server.last_applied_index().unwrap_or(0);

        follower_floor.min(flushed).min(applied)
    }

    /// Blocks while more closed segments are materialized than allowed
    /// and none can be evicted yet.
    ///
    /// A follower that never advances keeps appends blocked here; that
    /// stall is intentional visibility of the stuck follower.
    fn wait_for_cache_capacity(&self) {
        loop {
            {
                let mut cache = self.cache.write().expect("lock is poisoned");

                if !cache.should_evict() {
                    return;
                }

                cache.evict(self.evict_floor());

                if !cache.should_evict() {
                    return;
                }
            }

            log::debug!("Segment cache saturated, append waiting for eviction");
            self.progress.wait(SATURATION_RECHECK);
        }
    }

    /// Appends one entry, rolling the open segment on size or term
    /// change, and returns the durability future.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the log is closed or poisoned.
    ///
    /// # Panics
    ///
    /// Panics if the entry's term or index goes backward; both are
    /// programmer errors on the caller's side.
    pub fn append_entry(&self, entry: LogEntry) -> crate::Result<TaskFuture> {
        self.ensure_writable()?;
        self.wait_for_cache_capacity();

        let mut cache = self.cache.write().expect("lock is poisoned");

        if let Some(last) = cache.last_term_index() {
            assert!(
                entry.term >= last.term,
                "term must not go backward: {} < {}",
                entry.term,
                last.term,
            );
            assert_eq!(
                last.index + 1,
                entry.index,
                "append must continue the log at {}",
                last.index + 1,
            );
        }

        self.append_locked(&mut cache, entry)
    }

    /// Shared append path; assumes validation happened and the write
    /// lock is held.
    fn append_locked(
        &self,
        cache: &mut LogCache,
        entry: LogEntry,
    ) -> crate::Result<TaskFuture> {
        let frame = frame_len(entry.serialized_len());

        // Decide on rolling with the borrow released
        let open_state = cache.open_segment().map(|open| {
            let term_changed = open.last_term().is_some_and(|term| term != entry.term);
            let size_exceeded = open.total_size + frame > self.config.segment_max_size;

            // An empty open segment takes the entry no matter its size
            !open.is_empty() && (term_changed || size_exceeded)
        });

        match open_state {
            None => {
                cache.start_open_segment(entry.index);
                self.worker.submit(IoTask::StartSegment { start: entry.index });
            }

            Some(true) => {
                let (start, end) = cache.roll_open_segment();
                self.worker.submit(IoTask::RollSegment { start, end });

                cache.start_open_segment(entry.index);
                self.worker.submit(IoTask::StartSegment { start: entry.index });
            }

            Some(false) => {}
        }

        let bytes = entry.encode_into_vec()?;
        let index = entry.index;

        cache.append_entry(entry);

        let (done, future) = completion();
        self.worker.submit(IoTask::WriteEntry { bytes, index, done });

        Ok(future)
    }

    /// Appends a batch received from the leader.
    ///
    /// Walks existing indices alongside the supplied entries; at the
    /// first index whose term differs the divergent suffix is truncated
    /// (failing its attached client requests) and the remaining entries
    /// appended. Entries already present with a matching term are
    /// skipped.
    ///
    /// Returns durability futures for the entries actually written.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the log is closed or poisoned.
    pub fn append(&self, entries: Vec<LogEntry>) -> crate::Result<Vec<TaskFuture>> {
        self.ensure_writable()?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        self.wait_for_cache_capacity();

        let mut cache = self.cache.write().expect("lock is poisoned");
        let mut futures = Vec::new();

        for entry in entries {
            match cache.term_index(entry.index) {
                // Already present with the same term
                Some(existing) if existing.term == entry.term => continue,

                // Divergence: drop our suffix, then take the leader's
                Some(_) => {
                    self.truncate_locked(&mut cache, entry.index);
                }

                None => {}
            }

            futures.push(self.append_locked(&mut cache, entry)?);
        }

        Ok(futures)
    }

    /// Removes all entries with index >= `index`.
    ///
    /// The returned future resolves once the file work is durable.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the log is closed or poisoned.
    pub fn truncate(&self, index: u64) -> crate::Result<TaskFuture> {
        self.ensure_writable()?;

        let mut cache = self.cache.write().expect("lock is poisoned");
        Ok(self.truncate_locked(&mut cache, index))
    }

    fn truncate_locked(&self, cache: &mut LogCache, index: u64) -> TaskFuture {
        if let Some(end) = cache.end_index() {
            for truncated in index..=end {
                if let Some(entry) = cache.entry(truncated) {
                    self.server.fail_client_request(entry);
                }
            }
        }

        let plan = cache.truncate(index);

        let (done, future) = completion();
        self.worker.submit(IoTask::Truncate { plan, index, done });

        future
    }

    /// Fsyncs the log and purges segments fully covered by the
    /// just-installed snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the log is closed or poisoned.
    pub fn sync_with_snapshot(&self, last_snapshot_index: u64) -> crate::Result<TaskFuture> {
        self.ensure_writable()?;

        let mut cache = self.cache.write().expect("lock is poisoned");
        let purged = cache.purge_up_to(last_snapshot_index);

        let (done, future) = completion();

        if purged.is_empty() {
            self.worker.submit(IoTask::Sync { done });
        } else {
            log::debug!(
                "Purging {} segments below snapshot index {last_snapshot_index}",
                purged.len(),
            );

            self.worker.submit(IoTask::Truncate {
                plan: TruncatePlan {
                    partial: None,
                    delete: purged,
                },
                index: last_snapshot_index,
                done,
            });
        }

        Ok(future)
    }

    /// Persists `(currentTerm, votedFor)` atomically.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn write_metadata(&self, term: u64, voted_for: Option<PeerId>) -> crate::Result<()> {
        Metadata { term, voted_for }.store(self.storage.meta_path())
    }

    /// Loads `(currentTerm, votedFor)`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn load_metadata(&self) -> crate::Result<Metadata> {
        Metadata::load(self.storage.meta_path())
    }

    /// Returns the storage folder path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.storage.path().into()
    }

    /// Flushes outstanding work and stops the worker; the log refuses
    /// writes afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.worker.shutdown();
    }
}
