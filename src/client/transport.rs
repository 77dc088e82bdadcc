// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Request/reply vocabulary and the RPC transport seam.

use crate::Slice;
use std::sync::Arc;

/// Identifies a server in the Raft group
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

/// Identifies a client process; paired with the call id it keys the
/// server-side retry cache
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a random client id.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{:016x}", self.0)
    }
}

/// What a request asks the group to do
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RequestType {
    /// Replicated write through consensus
    Write,

    /// Linearizable read through consensus
    Read,

    /// Read served locally by one peer whose applied index is high
    /// enough
    StaleRead {
        /// Minimum applied index the serving peer must have reached
        min_index: u64,
    },

    /// Replace the group's peer set
    SetConfiguration {
        /// The new peer set
        peers: Vec<PeerId>,
    },

    /// Force the target peer to join a new group
    Reinitialize {
        /// Target group id
        group: String,
    },

    /// Query a peer's server state
    Info,
}

/// One outbound request
///
/// `call_id` is unique per client process and stable across retries;
/// `seq_num` is assigned by the sliding window the request goes through.
#[derive(Clone, Debug)]
pub struct RaftRequest {
    /// Issuing client
    pub client_id: ClientId,

    /// Process-unique id, stable across retries
    pub call_id: u64,

    /// Window-assigned sequence number
    pub seq_num: u64,

    /// Operation kind
    pub rtype: RequestType,

    /// Fixed target peer; `None` routes to the current leader
    pub target: Option<PeerId>,

    /// Opaque payload
    pub payload: Slice,
}

/// Reply to a [`RaftRequest`]
#[derive(Clone, Debug)]
pub struct RaftReply {
    /// Echoed call id
    pub call_id: u64,

    /// Whether the operation succeeded
    pub success: bool,

    /// Opaque payload
    pub payload: Slice,
}

/// RPC transport collaborator
///
/// `send` blocks for one round trip. `Ok(None)` means the request was
/// dropped or timed out and should be retried; Raft-level failures come
/// back as the matching [`Error`](crate::Error) variants.
pub trait Transport: Send + Sync {
    /// Sends `request` to `target` and waits for its reply.
    ///
    /// # Errors
    ///
    /// Will return `Err` for Raft-level and transport-level failures.
    fn send(&self, target: &PeerId, request: &RaftRequest)
        -> crate::Result<Option<RaftReply>>;

    /// Makes freshly discovered peers addressable.
    fn add_peers(&self, peers: &[PeerId]);

    /// Releases transport resources.
    fn close(&self);
}
