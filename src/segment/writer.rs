// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::SEGMENT_MAGIC;
use crate::coding::write_varint;
use byteorder::{BigEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Returns the framed on-disk length of an entry blob.
#[must_use]
pub fn frame_len(entry_len: u64) -> u64 {
    let mut varint = [0u8; 10];
    let varint_len =
        write_varint(&mut varint.as_mut_slice(), entry_len).expect("array write cannot fail");

    varint_len as u64 + entry_len + std::mem::size_of::<u64>() as u64
}

/// Appends framed records to one open segment file
///
/// Owned exclusively by the log worker; nothing else writes to segment
/// files. Readers open their own handles.
pub struct SegmentFileWriter {
    path: PathBuf,
    inner: BufWriter<File>,
    offset: u64,
}

impl SegmentFileWriter {
    /// Creates a fresh `log_inprogress_<start>` file and writes the magic.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        log::debug!("Starting segment file {}", path.display());

        let file = File::create(path)?;
        let mut inner = BufWriter::new(file);
        inner.write_all(&SEGMENT_MAGIC)?;

        Ok(Self {
            path: path.into(),
            inner,
            offset: SEGMENT_MAGIC.len() as u64,
        })
    }

    /// Reopens an existing open segment file for appending.
    ///
    /// The file is cut back to `keep_len` first, discarding a malformed
    /// tail left behind by a crash.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn recover<P: AsRef<Path>>(path: P, keep_len: u64) -> std::io::Result<Self> {
        let path = path.as_ref();

        let file = File::options().write(true).open(path)?;
        file.set_len(keep_len)?;

        let mut inner = BufWriter::new(file);
        inner.seek(SeekFrom::Start(keep_len))?;

        Ok(Self {
            path: path.into(),
            inner,
            offset: keep_len,
        })
    }

    /// Returns the current write offset (= file size once flushed).
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one framed record: `varint(len) | entry | xxh3(entry)`.
    ///
    /// Returns the record's frame offset.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn append(&mut self, entry_bytes: &[u8]) -> std::io::Result<u64> {
        let frame_offset = self.offset;

        let varint_len = write_varint(&mut self.inner, entry_bytes.len() as u64)?;
        self.inner.write_all(entry_bytes)?;

        let checksum = xxhash_rust::xxh3::xxh3_64(entry_bytes);
        self.inner.write_u64::<BigEndian>(checksum)?;

        self.offset += varint_len as u64
            + entry_bytes.len() as u64
            + std::mem::size_of::<u64>() as u64;

        Ok(frame_offset)
    }

    /// Flushes buffered data and fsyncs the file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.inner.flush()?;
        self.inner.get_mut().sync_all()?;
        Ok(())
    }

    /// Cuts the file back to `keep_len` bytes, durably.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn truncate(&mut self, keep_len: u64) -> std::io::Result<()> {
        self.inner.flush()?;

        let file = self.inner.get_mut();
        file.set_len(keep_len)?;
        file.sync_all()?;

        self.inner.seek(SeekFrom::Start(keep_len))?;
        self.offset = keep_len;

        Ok(())
    }

    /// Seals the segment: fsync, close the handle, rename to its
    /// closed name.
    ///
    /// No further writes may touch the renamed file.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn seal(mut self, closed_path: &Path) -> std::io::Result<()> {
        self.sync()?;

        // Drop the handle before the rename
        drop(self.inner);

        log::debug!(
            "Sealing segment {} -> {}",
            self.path.display(),
            closed_path.display(),
        );
        std::fs::rename(&self.path, closed_path)?;

        Ok(())
    }
}
