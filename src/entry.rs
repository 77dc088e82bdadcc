// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    Slice,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// A `(term, index)` pair identifying a log position
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct TermIndex {
    /// Election term the entry was created in
    pub term: u64,

    /// Position in the log
    pub index: u64,
}

impl TermIndex {
    /// Creates a new term-index pair.
    #[must_use]
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for TermIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(t:{}, i:{})", self.term, self.index)
    }
}

/// A single replicated log entry
///
/// Entries are identified by their `index`, which is strictly increasing
/// per log, and carry the election `term` they were created in, which is
/// monotonically non-decreasing along the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    /// Election term
    pub term: u64,

    /// Position in the log
    pub index: u64,

    /// Opaque payload handed to the state machine
    pub data: Slice,
}

impl LogEntry {
    /// Creates a new log entry.
    pub fn new<D: Into<Slice>>(term: u64, index: u64, data: D) -> Self {
        Self {
            term,
            index,
            data: data.into(),
        }
    }

    /// Returns the entry's term-index pair.
    #[must_use]
    pub fn term_index(&self) -> TermIndex {
        TermIndex::new(self.term, self.index)
    }

    /// Serialized size in bytes, without record framing.
    #[must_use]
    pub fn serialized_len(&self) -> u64 {
        (2 * std::mem::size_of::<u64>() + self.data.len()) as u64
    }
}

impl Encode for LogEntry {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.term)?;
        writer.write_u64::<BigEndian>(self.index)?;
        writer.write_all(&self.data)?;
        Ok(())
    }
}

impl Decode for LogEntry {
    // NOTE: The record frame is length-prefixed, so the payload
    // is simply everything after the two fixed fields
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let term = reader.read_u64::<BigEndian>()?;
        let index = reader.read_u64::<BigEndian>()?;

        let mut data = vec![];
        reader.read_to_end(&mut data)?;

        Ok(Self {
            term,
            index,
            data: data.into(),
        })
    }
}
