// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use raft_core::{Config, LogEntry, MockServer, RaftLog};
use std::{path::Path, sync::Arc};

/// Opens a log against a fresh mock server.
#[allow(unused)]
pub fn open_log(path: &Path, config: Config) -> raft_core::Result<(RaftLog, Arc<MockServer>)> {
    let server = Arc::new(MockServer::default());
    let log = RaftLog::open(path, config, server.clone(), None, &mut |_entry| {})?;

    Ok((log, server))
}

/// Opens a log, collecting the replayed entries.
#[allow(unused)]
pub fn open_log_replaying(
    path: &Path,
    config: Config,
    last_snapshot_index: Option<u64>,
) -> raft_core::Result<(RaftLog, Vec<LogEntry>)> {
    let server = Arc::new(MockServer::default());

    let mut replayed = Vec::new();
    let log = RaftLog::open(path, config, server, last_snapshot_index, &mut |entry| {
        replayed.push(entry.clone());
    })?;

    Ok((log, replayed))
}

/// An entry with a payload padding it to roughly `payload_len` bytes.
#[allow(unused)]
pub fn entry(term: u64, index: u64, payload_len: usize) -> LogEntry {
    LogEntry::new(term, index, vec![0xC4u8; payload_len])
}
