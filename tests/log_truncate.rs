// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{entry, open_log, open_log_replaying};
use raft_core::{Config, LogEntry};
use test_log::test;

#[test]
fn truncate_removes_suffix() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    let (log, _server) = open_log(folder.path(), Config::default())?;

    for index in 0..10 {
        log.append_entry(entry(1, index, 16))?;
    }
    log.truncate(7)?.wait()?;

    assert_eq!(Some(6), log.end_index());
    for index in 7..10 {
        assert_eq!(None, log.get(index)?);
        assert_eq!(None, log.get_term_index(index));
    }
    assert_eq!(Some(6), log.get(6)?.map(|e| e.index));

    // The next append continues at the cut point
    log.append_entry(entry(2, 7, 16))?.wait()?;
    assert_eq!(Some(7), log.end_index());

    log.close();

    // Truncation survives a reopen
    let (log, replayed) = open_log_replaying(folder.path(), Config::default(), None)?;
    assert_eq!(Some(7), log.end_index());
    assert_eq!(8, replayed.len());
    assert_eq!(2, replayed.last().unwrap().term);
    log.close();

    Ok(())
}

#[test]
fn append_truncates_divergent_suffix() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    let (log, server) = open_log(folder.path(), Config::default())?;

    for index in 0..10 {
        log.append_entry(entry(1, index, 16))?;
    }

    // The leader disagrees from index 9 onwards
    let futures = log.append(vec![
        entry(1, 8, 16),
        entry(2, 9, 16),
        entry(2, 10, 16),
    ])?;

    // Entry 8 matched and was skipped; 9 and 10 were written
    assert_eq!(2, futures.len());
    for future in futures {
        future.wait()?;
    }

    assert_eq!(Some(10), log.end_index());
    assert_eq!(1, log.get_term_index(8).unwrap().term);
    assert_eq!(2, log.get_term_index(9).unwrap().term);
    assert_eq!(2, log.get_term_index(10).unwrap().term);

    // The replaced entry's client request was failed
    let failed = server.failed_entries();
    assert!(failed.iter().any(|e| e.index == 9 && e.term == 1));
    assert!(failed.iter().all(|e| e.index != 8));

    log.close();
    Ok(())
}

#[test]
fn truncate_across_segment_boundary() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    // Small segments so the cut crosses files
    let (log, _server) = open_log(folder.path(), Config::default().segment_max_size(256))?;

    let mut futures = vec![];
    for index in 0..30 {
        futures.push(log.append_entry(entry(1, index, 16))?);
    }
    for future in futures {
        future.wait()?;
    }
    assert!(log.start_index() == Some(0));

    log.truncate(5)?.wait()?;

    assert_eq!(Some(4), log.end_index());
    for index in 5..30 {
        assert_eq!(None, log.get(index)?);
    }

    log.close();

    let (log, replayed) = open_log_replaying(folder.path(), Config::default(), None)?;
    assert_eq!(Some(4), log.end_index());
    assert_eq!(5, replayed.len());
    log.close();

    Ok(())
}

#[test]
fn append_bulk_into_empty_log() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    let (log, _server) = open_log(folder.path(), Config::default())?;

    let entries = (0..5).map(|index| entry(1, index, 16)).collect::<Vec<LogEntry>>();
    let futures = log.append(entries)?;
    assert_eq!(5, futures.len());
    for future in futures {
        future.wait()?;
    }

    assert_eq!(Some(4), log.end_index());

    // Re-sending the same batch is a no-op
    let futures = log.append((0..5).map(|index| entry(1, index, 16)).collect())?;
    assert!(futures.is_empty());
    assert_eq!(Some(4), log.end_index());

    log.close();
    Ok(())
}
