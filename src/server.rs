// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{client::PeerId, entry::LogEntry, HashMap};

/// View of the Raft server consumed by the log
///
/// The consensus state machine proper lives outside this crate; the log
/// only needs follower progress (to bound cache eviction), the applied
/// index, and a way to fail client requests attached to truncated
/// entries.
pub trait RaftServer: Send + Sync {
    /// This server's peer id.
    fn id(&self) -> PeerId;

    /// Next log index to send, per follower.
    ///
    /// Entries below the minimum of these are replicated everywhere and
    /// safe to drop from memory.
    fn follower_next_indices(&self) -> HashMap<PeerId, u64>;

    /// Highest index applied to the state machine, if any.
    fn last_applied_index(&self) -> Option<u64>;

    /// Notifies the server that a client request attached to `entry`
    /// can never commit because the entry was truncated away.
    fn fail_client_request(&self, entry: &LogEntry);
}
