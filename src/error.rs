// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    client::PeerId,
    coding::{DecodeError, EncodeError},
};

/// Represents errors that can occur in the log or client
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// On-disk state violates a structural invariant
    Corrupt(&'static str),

    /// The log hit a fatal I/O error earlier and refuses further writes
    /// until reopened
    LogPoisoned(String),

    /// The contacted peer is not the leader; carries the refreshed peer
    /// list and an optional leader hint
    NotLeader {
        /// Updated peer set reported by the contacted server
        peers: Vec<PeerId>,

        /// Suggested leader, if the server knows one
        suggested_leader: Option<PeerId>,
    },

    /// The leader has not yet committed an entry of its own term
    LeaderNotReady,

    /// The request was sent to a server belonging to a different group
    GroupMismatch,

    /// The state machine rejected the request
    StateMachine(String),

    /// The client was closed while requests were still pending
    ClientClosed,
}

impl Error {
    /// Returns `true` if the retry loop must give up and surface
    /// this error to the caller.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::GroupMismatch | Self::StateMachine(_) | Self::ClientClosed
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RaftCoreError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Crate result
pub type Result<T> = std::result::Result<T, Error>;
