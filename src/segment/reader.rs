// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::SEGMENT_MAGIC;
use crate::{
    coding::{read_varint, Decode, DecodeError},
    entry::LogEntry,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::Path,
};

/// Upper bound for a single record's entry blob; anything larger is
/// treated as corruption rather than allocated
const MAX_ENTRY_LEN: u64 = 1 << 30;

/// A record read back from a segment file
#[derive(Debug)]
pub struct ReadRecord {
    /// The decoded entry
    pub entry: LogEntry,

    /// File offset of the record frame
    pub offset: u64,

    /// On-disk length of the record frame
    pub len: u64,
}

/// Reads through a segment file in order.
///
/// Stops cleanly at the first malformed record (short frame, bad varint,
/// checksum mismatch); everything before it is the recovered prefix.
/// [`SegmentFileReader::valid_len`] reports how many bytes that prefix
/// spans so recovery can cut the tail.
pub struct SegmentFileReader {
    inner: BufReader<File>,
    valid_len: u64,
    is_terminated: bool,
    truncated_tail: bool,
}

impl SegmentFileReader {
    /// Opens a segment file and checks the magic header.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs or the magic is wrong.
    pub fn new<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let mut inner = BufReader::new(File::open(path)?);

        let mut magic = [0u8; SEGMENT_MAGIC.len()];
        inner
            .read_exact(&mut magic)
            .map_err(|_| crate::Error::Decode(DecodeError::InvalidHeader("segment magic")))?;

        if magic != SEGMENT_MAGIC {
            return Err(crate::Error::Decode(DecodeError::InvalidHeader(
                "segment magic",
            )));
        }

        Ok(Self {
            inner,
            valid_len: SEGMENT_MAGIC.len() as u64,
            is_terminated: false,
            truncated_tail: false,
        })
    }

    /// Bytes covered by valid records, including the magic header.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Returns `true` if iteration stopped at a malformed record.
    #[must_use]
    pub fn truncated_tail(&self) -> bool {
        self.truncated_tail
    }

    /// Marks the reader as done because of a malformed tail.
    fn halt(&mut self) -> Option<crate::Result<ReadRecord>> {
        log::debug!(
            "Malformed record at offset {}, treating earlier records as recovered prefix",
            self.valid_len,
        );

        self.is_terminated = true;
        self.truncated_tail = true;
        None
    }

    fn read_record(&mut self) -> Result<Option<(LogEntry, u64)>, std::io::Error> {
        let len = match read_varint(&mut self.inner) {
            Ok(len) => len,
            Err(DecodeError::Io(e)) => return Err(e),
            Err(_) => return Ok(None),
        };

        if len > MAX_ENTRY_LEN {
            return Ok(None);
        }

        // NOTE: len is bounded by MAX_ENTRY_LEN
        #[allow(clippy::cast_possible_truncation)]
        let mut entry_bytes = vec![0u8; len as usize];
        self.inner.read_exact(&mut entry_bytes)?;

        let checksum = self.inner.read_u64::<BigEndian>()?;

        if xxhash_rust::xxh3::xxh3_64(&entry_bytes) != checksum {
            return Ok(None);
        }

        let entry = match LogEntry::decode_from(&mut entry_bytes.as_slice()) {
            Ok(entry) => entry,
            Err(DecodeError::Io(e)) => return Err(e),
            Err(_) => return Ok(None),
        };

        let frame_len = super::writer::frame_len(len);

        Ok(Some((entry, frame_len)))
    }
}

impl Iterator for SegmentFileReader {
    type Item = crate::Result<ReadRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_terminated {
            return None;
        }

        // Clean end of file
        match self.inner.fill_buf() {
            Ok(buf) if buf.is_empty() => {
                self.is_terminated = true;
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                self.is_terminated = true;
                return Some(Err(e.into()));
            }
        }

        let offset = self.valid_len;

        match self.read_record() {
            Ok(Some((entry, len))) => {
                self.valid_len += len;

                Some(Ok(ReadRecord { entry, offset, len }))
            }

            // Malformed record: recovered prefix ends here
            Ok(None) => self.halt(),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => self.halt(),

            Err(e) => {
                self.is_terminated = true;
                Some(Err(e.into()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::{coding::Encode, segment::writer::SegmentFileWriter};
    use test_log::test;

    fn write_segment(path: &Path, entries: &[LogEntry]) -> crate::Result<u64> {
        let mut writer = SegmentFileWriter::create(path)?;
        for entry in entries {
            writer.append(&entry.encode_into_vec()?)?;
        }
        writer.sync()?;
        Ok(writer.offset())
    }

    #[test]
    fn reader_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log_inprogress_0");

        let entries = (0..5)
            .map(|index| LogEntry::new(1, index, index.to_be_bytes()))
            .collect::<Vec<_>>();
        let len = write_segment(&path, &entries)?;

        let mut reader = SegmentFileReader::new(&path)?;
        let read = reader.by_ref().collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(
            entries,
            read.iter().map(|r| r.entry.clone()).collect::<Vec<_>>()
        );
        assert_eq!(len, reader.valid_len());
        assert!(!reader.truncated_tail());

        Ok(())
    }

    #[test]
    fn reader_stops_at_torn_write() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log_inprogress_0");

        let entries = (0..5)
            .map(|index| LogEntry::new(1, index, index.to_be_bytes()))
            .collect::<Vec<_>>();
        let len = write_segment(&path, &entries)?;

        // Cut 5 bytes off the last record
        let file = std::fs::File::options().write(true).open(&path)?;
        file.set_len(len - 5)?;
        file.sync_all()?;
        drop(file);

        let mut reader = SegmentFileReader::new(&path)?;
        let read = reader.by_ref().collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(4, read.len());
        assert!(reader.truncated_tail());
        assert!(reader.valid_len() < len - 5);

        Ok(())
    }

    #[test]
    fn reader_stops_at_flipped_bit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log_inprogress_0");

        let entries = (0..3)
            .map(|index| LogEntry::new(1, index, [0xABu8; 16]))
            .collect::<Vec<_>>();
        write_segment(&path, &entries)?;

        // Flip a byte inside the second record's entry blob
        let mut bytes = std::fs::read(&path)?;
        let second_record = SEGMENT_MAGIC.len() + 1 + 32 + 8 + 1 + 10;
        bytes[second_record] ^= 0x01;
        std::fs::write(&path, &bytes)?;

        let mut reader = SegmentFileReader::new(&path)?;
        let read = reader.by_ref().collect::<crate::Result<Vec<_>>>()?;

        assert_eq!(1, read.len());
        assert!(reader.truncated_tail());

        Ok(())
    }

    #[test]
    fn reader_rejects_bad_magic() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log_inprogress_0");

        std::fs::write(&path, b"NOTALOG1somedata")?;

        assert!(SegmentFileReader::new(&path).is_err());

        Ok(())
    }
}
