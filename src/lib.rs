// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Core building blocks of a Raft consensus implementation: the
//! segmented durable log and the retrying client.
//!
//! The log stores replicated entries as a sequence of segment files:
//!
//! ```text
//! <dir>/current/
//!   log_0-127            ← closed segment (immutable)
//!   log_128-255          ← closed segment
//!   log_inprogress_256   ← open segment (appendable)
//!   raft-meta            ← (currentTerm, votedFor)
//! ```
//!
//! Appends go through a write lock into an in-memory segment cache and
//! are queued to a single write-behind I/O worker, which batches
//! fsyncs and resolves durability futures in index order. Closed
//! segments drop their in-memory entries once no follower, the
//! durability pipeline, nor the state machine can need them again.
//!
//! The client pipelines requests through per-target sliding windows
//! that deliver replies in sequence order, retrying transient failures
//! and refreshing the peer set on leader hints. The server-side retry
//! cache, keyed by `(clientId, callId)`, makes retries at-most-once.
//!
//! The consensus state machine itself (elections, commit index,
//! snapshots) and the RPC transport are external collaborators behind
//! the [`RaftServer`] and [`Transport`] traits.
//!
//! # Example usage
//!
//! ```
//! use raft_core::{Config, LogEntry, MockServer, RaftLog};
//! use std::sync::Arc;
//!
//! # fn main() -> raft_core::Result<()> {
//! # let folder = tempfile::tempdir()?;
//! let server = Arc::new(MockServer::default());
//!
//! // Open or recover the log from disk
//! let log = RaftLog::open(folder.path(), Config::default(), server, None, &mut |_entry| {})?;
//!
//! // Write some entries
//! let mut futures = vec![];
//! for index in 0..5 {
//!     futures.push(log.append_entry(LogEntry::new(1, index, b"payload".as_slice()))?);
//! }
//!
//! // Futures resolve in index order, once durable
//! for future in futures {
//!     future.wait()?;
//! }
//!
//! assert_eq!(Some(4), log.end_index());
//! log.close();
//! #
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]

mod cache;
mod coding;
mod config;
mod entry;
mod error;
mod log;
mod metadata;
mod mock;
mod segment;
mod server;
mod slice;
mod storage;
mod worker;

pub mod client;

pub(crate) type HashMap<K, V> = std::collections::HashMap<K, V, xxhash_rust::xxh3::Xxh3Builder>;

pub use {
    client::{
        ClientId, PeerId, RaftClient, RaftReply, RaftRequest, ReplyFuture, RequestType, Transport,
    },
    config::{ClientConfig, Config, FlushPolicy},
    entry::{LogEntry, TermIndex},
    error::{Error, Result},
    log::RaftLog,
    metadata::Metadata,
    server::RaftServer,
    slice::Slice,
    worker::TaskFuture,
};

#[doc(hidden)]
pub use cache::{LogCache, TruncatePlan};

#[doc(hidden)]
pub use storage::{SegmentFileName, StorageDirectory};

#[doc(hidden)]
pub use mock::{ok_reply, MockServer, MockTransport};
