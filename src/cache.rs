// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    entry::LogEntry,
    segment::{reader::SegmentFileReader, writer::frame_len, Segment},
    storage::SegmentFileName,
    TermIndex,
};
use std::path::Path;

/// Partial truncation of one segment file
#[derive(Debug)]
pub struct PartialTruncate {
    /// File name before truncation
    pub old_name: SegmentFileName,

    /// New closed name after the cut; `None` if the segment stays open
    /// and keeps its in-progress name
    pub new_name: Option<SegmentFileName>,

    /// Bytes to keep
    pub keep_len: u64,
}

/// Description of the file work a truncation requires
///
/// Produced by [`LogCache::truncate`] under the write lock, executed
/// by the log worker in task order.
#[derive(Debug, Default)]
pub struct TruncatePlan {
    /// At most one partially cut segment
    pub partial: Option<PartialTruncate>,

    /// Whole segment files to delete
    pub delete: Vec<SegmentFileName>,
}

impl TruncatePlan {
    /// Returns `true` if no file work is needed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partial.is_none() && self.delete.is_empty()
    }
}

/// Result of parsing one segment file from disk
#[derive(Debug)]
pub struct LoadOutcome {
    /// Number of valid records loaded
    pub loaded: usize,

    /// Bytes covered by valid records, including the magic header
    pub valid_len: u64,

    /// `true` if a malformed tail was cut off during parsing
    pub truncated_tail: bool,
}

/// Ordered collection of segments with a bounded number kept fully
/// in memory
///
/// Closed segments come first, the open segment (if any) is last.
/// Adjacent segments are gap-free: `segments[i].end + 1 ==
/// segments[i + 1].start`. Plain data; the facade serializes access
/// through its read/write lock.
pub struct LogCache {
    segments: Vec<Segment>,
    max_cached: usize,
}

impl LogCache {
    /// Creates an empty cache keeping at most `max_cached` closed
    /// segments materialized.
    #[must_use]
    pub fn new(max_cached: usize) -> Self {
        Self {
            segments: Vec::new(),
            max_cached,
        }
    }

    /// First index in the log, if any.
    #[must_use]
    pub fn start_index(&self) -> Option<u64> {
        self.segments.first().map(|segment| segment.start_index)
    }

    /// Last index in the log, if any.
    #[must_use]
    pub fn end_index(&self) -> Option<u64> {
        self.segments.iter().rev().find_map(Segment::end_index)
    }

    /// Term-index pair of the last entry, if any.
    #[must_use]
    pub fn last_term_index(&self) -> Option<TermIndex> {
        self.segments
            .iter()
            .rev()
            .find(|segment| !segment.is_empty())
            .and_then(|segment| segment.end_index().and_then(|end| segment.term_index(end)))
    }

    /// Returns the open segment, if any.
    #[must_use]
    pub fn open_segment(&self) -> Option<&Segment> {
        self.segments.last().filter(|segment| segment.is_open)
    }

    fn open_segment_mut(&mut self) -> Option<&mut Segment> {
        self.segments.last_mut().filter(|segment| segment.is_open)
    }

    /// Returns all segments in order.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Binary-searches the segment covering `index`.
    #[must_use]
    pub fn segment_position(&self, index: u64) -> Option<usize> {
        let position = self
            .segments
            .partition_point(|segment| segment.start_index <= index);

        let position = position.checked_sub(1)?;

        self.segments
            .get(position)
            .filter(|segment| segment.contains(index))
            .map(|_| position)
    }

    /// Returns the segment covering `index`.
    #[must_use]
    pub fn segment(&self, index: u64) -> Option<&Segment> {
        self.segment_position(index)
            .and_then(|position| self.segments.get(position))
    }

    pub(crate) fn segment_at_mut(&mut self, position: usize) -> Option<&mut Segment> {
        self.segments.get_mut(position)
    }

    /// Looks up the term-index pair at `index`.
    #[must_use]
    pub fn term_index(&self, index: u64) -> Option<TermIndex> {
        self.segment(index).and_then(|segment| segment.term_index(index))
    }

    /// Collects term-index pairs for `[lo, hi)`, stopping at the first
    /// missing index.
    #[must_use]
    pub fn term_indices(&self, lo: u64, hi: u64) -> Vec<TermIndex> {
        let mut result = Vec::new();

        for index in lo..hi {
            let Some(ti) = self.term_index(index) else {
                break;
            };
            result.push(ti);
        }

        result
    }

    /// Returns the materialized entry at `index`, if resident.
    #[must_use]
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.segment(index).and_then(|segment| segment.entry(index))
    }

    /// Parses a segment file, appends it to the collection and replays
    /// each valid entry through `consumer`.
    ///
    /// With `keep_entries` false only the per-record index metadata is
    /// retained.
    ///
    /// # Errors
    ///
    /// Will return `Err` on I/O failure or if the file would leave a gap.
    pub fn load_segment(
        &mut self,
        path: &Path,
        name: SegmentFileName,
        keep_entries: bool,
        consumer: &mut dyn FnMut(&LogEntry),
    ) -> crate::Result<LoadOutcome> {
        if self.open_segment().is_some() {
            return Err(crate::Error::Corrupt("segment after open segment"));
        }

        let start = name.start_index();

        if let Some(end) = self.end_index() {
            if start != end + 1 {
                return Err(crate::Error::Corrupt("gap between segments"));
            }
        }

        let is_open = matches!(name, SegmentFileName::Open { .. });
        let mut segment = Segment::create_open(start);

        let mut reader = SegmentFileReader::new(path)?;
        let mut expected = start;
        let mut loaded = 0;

        for record in reader.by_ref() {
            let record = record?;

            if record.entry.index != expected {
                return Err(crate::Error::Corrupt("record index out of order"));
            }
            expected += 1;

            consumer(&record.entry);
            segment.push(record.entry, record.offset, record.len);
            loaded += 1;
        }

        let outcome = LoadOutcome {
            loaded,
            valid_len: reader.valid_len(),
            truncated_tail: reader.truncated_tail(),
        };

        segment.is_open = is_open;
        if !keep_entries && !is_open {
            segment.evict();
        }

        log::trace!(
            "Loaded segment {} ({} entries, {} bytes)",
            name.format(),
            loaded,
            outcome.valid_len,
        );

        // A closed segment with no valid records cannot exist; skip it
        // and let the caller quarantine the file
        if !is_open && segment.is_empty() {
            return Ok(outcome);
        }

        self.segments.push(segment);

        Ok(outcome)
    }

    /// Opens a fresh open segment starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if an open segment already exists.
    pub fn start_open_segment(&mut self, start: u64) {
        assert!(
            self.open_segment().is_none(),
            "at most one open segment per log",
        );

        if let Some(end) = self.end_index() {
            assert_eq!(end + 1, start, "open segment would leave a gap");
        }

        self.segments.push(Segment::create_open(start));
    }

    /// Appends to the open segment, returning the record's file offset
    /// and framed length.
    pub fn append_entry(&mut self, entry: LogEntry) -> (u64, u64) {
        let len = frame_len(entry.serialized_len());

        let segment = self
            .open_segment_mut()
            .expect("append requires an open segment");
        let offset = segment.total_size;

        segment.push(entry, offset, len);

        (offset, len)
    }

    /// Marks the open segment as closed, returning its index range for
    /// the rename.
    ///
    /// # Panics
    ///
    /// Panics if there is no open segment or it is empty; an empty
    /// segment is never rolled.
    pub fn roll_open_segment(&mut self) -> (u64, u64) {
        let segment = self.open_segment_mut().expect("no open segment to roll");

        let start = segment.start_index;
        let end = segment.end_index().expect("empty segment is never rolled");

        segment.is_open = false;

        (start, end)
    }

    /// Removes all entries with `index' >= index`, returning the file
    /// work for the worker.
    #[must_use]
    pub fn truncate(&mut self, index: u64) -> TruncatePlan {
        let mut plan = TruncatePlan::default();

        let Some(end) = self.end_index() else {
            return plan;
        };
        if index > end {
            return plan;
        }

        // Whole segments at or past the cut point are deleted
        while let Some(segment) = self.segments.last() {
            if segment.start_index < index && !segment.is_empty() {
                break;
            }

            plan.delete.push(segment.file_name());
            self.segments.pop();
        }

        // The remaining tail segment may need a partial cut
        if let Some(segment) = self.segments.last_mut() {
            if segment.end_index().is_some_and(|end| end >= index) {
                let old_name = segment.file_name();

                let record = segment.record(index).expect("index is inside this segment");
                let keep_len = record.offset;

                #[allow(clippy::cast_possible_truncation)]
                let keep = (index - segment.start_index) as usize;
                segment.records.truncate(keep);
                if let Some(entries) = &mut segment.entries {
                    entries.truncate(keep);
                }
                segment.total_size = keep_len;

                let new_name = if segment.is_open {
                    None
                } else {
                    Some(segment.file_name())
                };

                plan.partial = Some(PartialTruncate {
                    old_name,
                    new_name,
                    keep_len,
                });
            }
        }

        plan
    }

    /// Drops everything; used when a snapshot is ahead of the log.
    ///
    /// Returns the file names of all previously held segments.
    #[must_use]
    pub fn clear(&mut self) -> Vec<SegmentFileName> {
        self.segments
            .drain(..)
            .map(|segment| segment.file_name())
            .collect()
    }

    /// Removes closed segments fully covered by a snapshot.
    ///
    /// Returns the file names to purge.
    #[must_use]
    pub fn purge_up_to(&mut self, last_snapshot_index: u64) -> Vec<SegmentFileName> {
        let mut purged = Vec::new();

        while let Some(segment) = self.segments.first() {
            let covered = !segment.is_open
                && segment
                    .end_index()
                    .is_some_and(|end| end < last_snapshot_index);

            if !covered {
                break;
            }

            purged.push(segment.file_name());
            self.segments.remove(0);
        }

        purged
    }

    /// Number of closed segments with materialized entries.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| !segment.is_open && segment.has_entries())
            .count()
    }

    /// Returns `true` if more closed segments are materialized than
    /// the configured bound allows.
    #[must_use]
    pub fn should_evict(&self) -> bool {
        self.cached_count() > self.max_cached
    }

    /// Drops in-memory entries of closed segments whose end index is
    /// below `floor`, oldest first, until the bound is met.
    ///
    /// `floor` must be `min(min(followerNextIndices), flushedIndex,
    /// lastAppliedIndex)` so no follower, the durability pipeline, nor
    /// the state machine can still need the dropped entries.
    ///
    /// Returns the number of segments evicted.
    pub fn evict(&mut self, floor: u64) -> usize {
        let mut evicted = 0;
        let mut cached = self.cached_count();

        for segment in &mut self.segments {
            if cached <= self.max_cached {
                break;
            }

            if segment.is_open || !segment.has_entries() {
                continue;
            }

            let Some(end) = segment.end_index() else {
                continue;
            };

            if end >= floor {
                // Segments are ordered, nothing further is evictable either
                break;
            }

            log::trace!(
                "Evicting entries of segment {} (end {end} < floor {floor})",
                segment.file_name().format(),
            );

            segment.evict();
            evicted += 1;
            cached -= 1;
        }

        evicted
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use test_log::test;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, index.to_be_bytes())
    }

    /// Builds a cache with closed segments of the given `(term, start..=end)`
    /// ranges, plus an optional open segment.
    fn build_cache(max_cached: usize, ranges: &[(u64, u64, u64)], open_from: Option<(u64, u64)>) -> LogCache {
        let mut cache = LogCache::new(max_cached);

        for &(term, start, end) in ranges {
            cache.start_open_segment(start);
            for index in start..=end {
                cache.append_entry(entry(term, index));
            }
            cache.roll_open_segment();
        }

        if let Some((term, start)) = open_from {
            cache.start_open_segment(start);
            cache.append_entry(entry(term, start));
        }

        cache
    }

    #[test]
    fn cache_lookup() {
        let cache = build_cache(8, &[(1, 0, 4), (1, 5, 9)], Some((2, 10)));

        assert_eq!(Some(0), cache.start_index());
        assert_eq!(Some(10), cache.end_index());
        assert_eq!(Some(TermIndex::new(2, 10)), cache.last_term_index());

        assert_eq!(Some(0), cache.segment_position(3));
        assert_eq!(Some(1), cache.segment_position(5));
        assert_eq!(Some(2), cache.segment_position(10));
        assert_eq!(None, cache.segment_position(11));

        assert_eq!(Some(TermIndex::new(1, 7)), cache.term_index(7));
        assert_eq!(7, cache.entry(7).unwrap().index);

        let headers = cache.term_indices(3, 7);
        assert_eq!(4, headers.len());
        assert_eq!(3, headers.first().unwrap().index);

        // Range walks off the end
        assert_eq!(2, cache.term_indices(9, 14).len());
    }

    #[test]
    fn cache_truncate_partial() {
        let mut cache = build_cache(8, &[(1, 0, 9)], None);

        let plan = cache.truncate(7);

        assert!(plan.delete.is_empty());
        let partial = plan.partial.unwrap();
        assert_eq!("log_0-9", partial.old_name.format());
        assert_eq!("log_0-6", partial.new_name.unwrap().format());

        assert_eq!(Some(6), cache.end_index());
        assert_eq!(None, cache.term_index(7));
    }

    #[test]
    fn cache_truncate_across_segments() {
        let mut cache = build_cache(8, &[(1, 0, 4), (1, 5, 9)], Some((2, 10)));

        let plan = cache.truncate(3);

        let deleted = plan
            .delete
            .iter()
            .map(SegmentFileName::format)
            .collect::<Vec<_>>();
        assert_eq!(vec!["log_inprogress_10", "log_5-9"], deleted);

        let partial = plan.partial.unwrap();
        assert_eq!("log_0-2", partial.new_name.unwrap().format());

        assert_eq!(Some(2), cache.end_index());
        assert!(cache.open_segment().is_none());
    }

    #[test]
    fn cache_truncate_open_segment_keeps_name() {
        let mut cache = LogCache::new(8);
        cache.start_open_segment(0);
        for index in 0..5 {
            cache.append_entry(entry(1, index));
        }

        let plan = cache.truncate(3);

        let partial = plan.partial.unwrap();
        assert_eq!("log_inprogress_0", partial.old_name.format());
        assert!(partial.new_name.is_none());

        assert_eq!(Some(2), cache.end_index());
        assert!(cache.open_segment().is_some());
    }

    #[test]
    fn cache_truncate_everything() {
        let mut cache = build_cache(8, &[(1, 0, 4)], None);

        let plan = cache.truncate(0);

        assert!(plan.partial.is_none());
        assert_eq!(1, plan.delete.len());
        assert_eq!(None, cache.end_index());
    }

    #[test]
    fn cache_truncate_past_end_is_noop() {
        let mut cache = build_cache(8, &[(1, 0, 4)], None);

        let plan = cache.truncate(5);
        assert!(plan.is_empty());
        assert_eq!(Some(4), cache.end_index());
    }

    #[test]
    fn cache_eviction_respects_floor() {
        let mut cache = build_cache(1, &[(1, 0, 4), (1, 5, 9), (1, 10, 14)], None);
        assert_eq!(3, cache.cached_count());
        assert!(cache.should_evict());

        // Floor below the first segment's end: nothing can go
        assert_eq!(0, cache.evict(3));
        assert_eq!(3, cache.cached_count());

        // Floor covers the first two segments
        assert_eq!(2, cache.evict(10));
        assert_eq!(1, cache.cached_count());
        assert!(!cache.should_evict());

        // Record index survives eviction
        assert_eq!(Some(TermIndex::new(1, 2)), cache.term_index(2));
        assert_eq!(None, cache.entry(2));
        assert_eq!(14, cache.entry(14).unwrap().index);
    }

    #[test]
    fn cache_purge_up_to_snapshot() {
        let mut cache = build_cache(8, &[(1, 0, 4), (1, 5, 9)], Some((1, 10)));

        let purged = cache.purge_up_to(5);
        assert_eq!(1, purged.len());
        assert_eq!("log_0-4", purged.first().unwrap().format());

        // Open segment and partially covered segments stay
        assert_eq!(Some(5), cache.start_index());
        assert_eq!(Some(10), cache.end_index());
    }

    #[test]
    #[should_panic(expected = "at most one open segment")]
    fn cache_rejects_second_open_segment() {
        let mut cache = LogCache::new(8);
        cache.start_open_segment(0);
        cache.append_entry(entry(1, 0));
        cache.start_open_segment(1);
    }
}
