// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod common;

use common::{entry, open_log};
use raft_core::Config;
use test_log::test;

#[test]
fn roll_by_size() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    let (log, _server) = open_log(folder.path(), Config::default().segment_max_size(1_024))?;

    let mut futures = vec![];
    for index in 0..40 {
        futures.push(log.append_entry(entry(1, index, 34))?);
    }
    for future in futures {
        future.wait()?;
    }

    // Indices 0..=39 stay contiguous across the roll boundaries
    assert_eq!(Some(0), log.start_index());
    assert_eq!(Some(39), log.end_index());
    for index in 0..40 {
        assert_eq!(index, log.get(index)?.expect("no gaps").index);
    }

    log.close();

    // Segment files: at least two closed ones, each picking up exactly
    // where its predecessor ended
    let mut names = std::fs::read_dir(folder.path().join("current"))?
        .filter_map(|dirent| {
            let name = dirent.ok()?.file_name().into_string().ok()?;
            name.strip_prefix("log_")?;
            Some(name)
        })
        .collect::<Vec<_>>();
    names.sort();

    let closed = names
        .iter()
        .filter(|name| !name.contains("inprogress"))
        .count();
    assert!(closed >= 2, "expected >= 2 closed segments, got {names:?}");

    let mut ranges = names
        .iter()
        .filter_map(|name| {
            let (start, end) = name.strip_prefix("log_")?.split_once('-')?;
            Some((start.parse::<u64>().ok()?, end.parse::<u64>().ok()?))
        })
        .collect::<Vec<_>>();
    ranges.sort_unstable();

    assert_eq!(0, ranges.first().unwrap().0);
    for pair in ranges.windows(2) {
        assert_eq!(pair[0].1 + 1, pair[1].0);
    }

    Ok(())
}

#[test]
fn roll_on_term_change() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    let (log, _server) = open_log(folder.path(), Config::default())?;

    for index in 0..5 {
        log.append_entry(entry(2, index, 16))?;
    }
    log.append_entry(entry(3, 5, 16))?.wait()?;

    assert_eq!(Some(5), log.end_index());
    assert_eq!(2, log.get_term_index(4).unwrap().term);
    assert_eq!(3, log.get_term_index(5).unwrap().term);

    log.close();

    let current = folder.path().join("current");
    assert!(current.join("log_0-4").exists());
    assert!(current.join("log_inprogress_5").exists());

    Ok(())
}

#[test]
fn oversized_entry_gets_its_own_segment() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    let (log, _server) = open_log(folder.path(), Config::default().segment_max_size(1_024))?;

    log.append_entry(entry(1, 0, 34))?;
    // Larger than any segment can nominally hold
    log.append_entry(entry(1, 1, 4_096))?;
    log.append_entry(entry(1, 2, 34))?.wait()?;

    assert_eq!(Some(2), log.end_index());
    assert_eq!(4_096, log.get(1)?.unwrap().data.len());

    log.close();

    let current = folder.path().join("current");
    assert!(current.join("log_0-0").exists());
    assert!(current.join("log_1-1").exists());
    assert!(current.join("log_inprogress_2").exists());

    Ok(())
}

#[test]
fn append_futures_complete_in_index_order() -> raft_core::Result<()> {
    let folder = tempfile::tempdir()?;

    let (log, _server) = open_log(folder.path(), Config::default())?;

    let futures = (0..64)
        .map(|index| log.append_entry(entry(1, index, 8)))
        .collect::<raft_core::Result<Vec<_>>>()?;

    let mut last = None;
    for future in futures {
        let index = future.wait()?;
        assert!(last.map_or(true, |previous| previous < index));
        last = Some(index);
    }

    assert_eq!(Some(63), last);
    assert_eq!(Some(63), log.flushed_index());

    log.close();
    Ok(())
}

#[test]
#[should_panic(expected = "term must not go backward")]
fn term_regression_panics() {
    let folder = tempfile::tempdir().unwrap();

    let (log, _server) = open_log(folder.path(), Config::default()).unwrap();

    log.append_entry(entry(3, 0, 8)).unwrap();
    let _ = log.append_entry(entry(2, 1, 8));
}
