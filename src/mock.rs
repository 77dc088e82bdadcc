// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    client::{PeerId, RaftReply, RaftRequest, Transport},
    entry::LogEntry,
    server::RaftServer,
    HashMap,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex, RwLock,
};

/// Mock in-memory Raft server view
#[allow(clippy::module_name_repetitions)]
pub struct MockServer {
    id: PeerId,
    next_indices: RwLock<HashMap<PeerId, u64>>,

    /// Applied index + 1; 0 = nothing applied
    applied: AtomicU64,

    failed: Mutex<Vec<LogEntry>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            id: PeerId::from("s0"),
            next_indices: RwLock::new(HashMap::default()),
            applied: AtomicU64::new(0),
            failed: Mutex::new(Vec::new()),
        }
    }
}

impl MockServer {
    /// Sets one follower's next index.
    pub fn set_follower_next_index(&self, peer: &str, next: u64) {
        self.next_indices
            .write()
            .expect("lock is poisoned")
            .insert(PeerId::from(peer), next);
    }

    /// Sets the applied index.
    pub fn set_last_applied_index(&self, index: u64) {
        self.applied.store(index + 1, Ordering::Release);
    }

    /// Entries whose client requests were failed.
    #[must_use]
    pub fn failed_entries(&self) -> Vec<LogEntry> {
        self.failed.lock().expect("lock is poisoned").clone()
    }
}

impl RaftServer for MockServer {
    fn id(&self) -> PeerId {
        self.id.clone()
    }

    fn follower_next_indices(&self) -> HashMap<PeerId, u64> {
        self.next_indices.read().expect("lock is poisoned").clone()
    }

    fn last_applied_index(&self) -> Option<u64> {
        self.applied.load(Ordering::Acquire).checked_sub(1)
    }

    fn fail_client_request(&self, entry: &LogEntry) {
        self.failed.lock().expect("lock is poisoned").push(entry.clone());
    }
}

type SendHandler =
    dyn FnMut(&PeerId, &RaftRequest) -> crate::Result<Option<RaftReply>> + Send;

/// Scripted mock transport
///
/// Behavior is supplied as a closure mapping `(target, request)` to an
/// outcome; every send is recorded for assertions.
#[allow(clippy::module_name_repetitions)]
pub struct MockTransport {
    handler: Mutex<Box<SendHandler>>,
    sent: Mutex<Vec<(PeerId, u64, u64)>>,
    added_peers: Mutex<Vec<PeerId>>,
    closed: AtomicBool,
}

impl MockTransport {
    /// Creates a transport driven by `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&PeerId, &RaftRequest) -> crate::Result<Option<RaftReply>> + Send + 'static,
    {
        Self {
            handler: Mutex::new(Box::new(handler)),
            sent: Mutex::new(Vec::new()),
            added_peers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Every `(target, call_id, seq_num)` sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(PeerId, u64, u64)> {
        self.sent.lock().expect("lock is poisoned").clone()
    }

    /// Peers added via `add_peers`.
    #[must_use]
    pub fn added_peers(&self) -> Vec<PeerId> {
        self.added_peers.lock().expect("lock is poisoned").clone()
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        target: &PeerId,
        request: &RaftRequest,
    ) -> crate::Result<Option<RaftReply>> {
        self.sent.lock().expect("lock is poisoned").push((
            target.clone(),
            request.call_id,
            request.seq_num,
        ));

        let mut handler = self.handler.lock().expect("lock is poisoned");
        (*handler)(target, request)
    }

    fn add_peers(&self, peers: &[PeerId]) {
        self.added_peers
            .lock()
            .expect("lock is poisoned")
            .extend_from_slice(peers);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Builds a successful reply echoing `call_id`.
#[must_use]
pub fn ok_reply(call_id: u64) -> RaftReply {
    RaftReply {
        call_id,
        success: true,
        payload: [].into(),
    }
}
