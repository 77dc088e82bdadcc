// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Client-side request pipeline: sliding windows, retry timers and
//! leader tracking.

pub mod transport;

mod scheduler;
mod semaphore;
mod window;

pub use transport::{ClientId, PeerId, RaftReply, RaftRequest, RequestType, Transport};
pub use window::ReplyFuture;

use crate::{config::ClientConfig, HashMap, Slice};
use scheduler::RetryScheduler;
use semaphore::{Permit, Semaphore};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use window::SlidingWindow;

/// Window key for the shared leader-routed request stream
const RAFT_WINDOW: &str = "RAFT";

/// Raft client with retrying, ordered request pipelines
///
/// Every request is routed through a per-target [`SlidingWindow`] that
/// assigns sequence numbers and delivers replies in order. Transient
/// failures are retried on a timer pool; leader hints refresh the peer
/// set. The server-side retry cache, keyed by `(clientId, callId)`,
/// makes retries at-most-once.
#[derive(Clone)]
pub struct RaftClient(Arc<RaftClientInner>);

impl std::ops::Deref for RaftClient {
    type Target = RaftClientInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Shared state backing a [`RaftClient`] handle.
#[allow(clippy::module_name_repetitions)]
pub struct RaftClientInner {
    client_id: ClientId,
    transport: Arc<dyn Transport>,
    config: ClientConfig,

    call_id: AtomicU64,
    semaphore: Semaphore,
    scheduler: RetryScheduler,

    windows: Mutex<HashMap<String, Arc<SlidingWindow>>>,

    /// Peer set snapshot; swapped wholesale so readers never observe a
    /// partial update
    peers: Mutex<Arc<Vec<PeerId>>>,

    leader: Mutex<Option<PeerId>>,

    closed: AtomicBool,
}

impl RaftClient {
    /// Creates a client talking to `peers`, optionally with a known
    /// leader.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        peers: Vec<PeerId>,
        leader: Option<PeerId>,
        config: ClientConfig,
    ) -> Self {
        let scheduler = RetryScheduler::new(config.scheduler_threads);
        let semaphore = Semaphore::new(config.max_outstanding_requests);

        Self(Arc::new(RaftClientInner {
            client_id: ClientId::random(),
            transport,
            config,
            call_id: AtomicU64::new(0),
            semaphore,
            scheduler,
            windows: Mutex::new(HashMap::default()),
            peers: Mutex::new(Arc::new(peers)),
            leader: Mutex::new(leader),
            closed: AtomicBool::new(false),
        }))
    }

    /// This client's id.
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Currently assumed leader.
    #[must_use]
    pub fn leader(&self) -> Option<PeerId> {
        self.leader.lock().expect("lock is poisoned").clone()
    }

    /// Current peer set snapshot.
    #[must_use]
    pub fn peers(&self) -> Arc<Vec<PeerId>> {
        self.peers.lock().expect("lock is poisoned").clone()
    }

    /// Sends a replicated write, blocking for the reply.
    ///
    /// # Errors
    ///
    /// Will return `Err` on terminal request failure or shutdown.
    pub fn send<D: Into<Slice>>(&self, message: D) -> crate::Result<RaftReply> {
        self.dispatch(
            RAFT_WINDOW,
            self.make_request(RequestType::Write, None, message.into()),
            None,
            true,
        )
        .wait()
    }

    /// Sends a replicated write without blocking; bounded by the
    /// outstanding-request semaphore.
    #[must_use]
    pub fn send_async<D: Into<Slice>>(&self, message: D) -> ReplyFuture {
        let permit = self.semaphore.acquire();

        self.dispatch(
            RAFT_WINDOW,
            self.make_request(RequestType::Write, None, message.into()),
            Some(permit),
            false,
        )
    }

    /// Sends a linearizable read, blocking for the reply.
    ///
    /// # Errors
    ///
    /// Will return `Err` on terminal request failure or shutdown.
    pub fn send_read_only<D: Into<Slice>>(&self, message: D) -> crate::Result<RaftReply> {
        self.dispatch(
            RAFT_WINDOW,
            self.make_request(RequestType::Read, None, message.into()),
            None,
            true,
        )
        .wait()
    }

    /// Async variant of [`RaftClient::send_read_only`].
    #[must_use]
    pub fn send_read_only_async<D: Into<Slice>>(&self, message: D) -> ReplyFuture {
        let permit = self.semaphore.acquire();

        self.dispatch(
            RAFT_WINDOW,
            self.make_request(RequestType::Read, None, message.into()),
            Some(permit),
            false,
        )
    }

    /// Reads from `server` directly, requiring its applied index to
    /// have reached `min_index`.
    ///
    /// # Errors
    ///
    /// Will return `Err` on terminal request failure or shutdown.
    pub fn send_stale_read<D: Into<Slice>>(
        &self,
        message: D,
        min_index: u64,
        server: PeerId,
    ) -> crate::Result<RaftReply> {
        self.dispatch(
            server.as_str(),
            self.make_request(
                RequestType::StaleRead { min_index },
                Some(server.clone()),
                message.into(),
            ),
            None,
            true,
        )
        .wait()
    }

    /// Async variant of [`RaftClient::send_stale_read`].
    #[must_use]
    pub fn send_stale_read_async<D: Into<Slice>>(
        &self,
        message: D,
        min_index: u64,
        server: PeerId,
    ) -> ReplyFuture {
        let permit = self.semaphore.acquire();

        self.dispatch(
            server.as_str(),
            self.make_request(
                RequestType::StaleRead { min_index },
                Some(server.clone()),
                message.into(),
            ),
            Some(permit),
            false,
        )
    }

    /// Replaces the group's peer set, blocking for the reply.
    ///
    /// # Errors
    ///
    /// Will return `Err` on terminal request failure or shutdown.
    pub fn set_configuration(&self, peers: Vec<PeerId>) -> crate::Result<RaftReply> {
        self.dispatch(
            RAFT_WINDOW,
            self.make_request(RequestType::SetConfiguration { peers }, None, [].into()),
            None,
            true,
        )
        .wait()
    }

    /// Forces `server` to join the group named `group`.
    ///
    /// # Errors
    ///
    /// Will return `Err` on terminal request failure or shutdown.
    pub fn reinitialize(&self, group: &str, server: PeerId) -> crate::Result<RaftReply> {
        self.dispatch(
            server.as_str(),
            self.make_request(
                RequestType::Reinitialize {
                    group: group.into(),
                },
                Some(server.clone()),
                [].into(),
            ),
            None,
            true,
        )
        .wait()
    }

    /// Queries `server`'s state.
    ///
    /// # Errors
    ///
    /// Will return `Err` on terminal request failure or shutdown.
    pub fn server_information(&self, server: PeerId) -> crate::Result<RaftReply> {
        self.dispatch(
            server.as_str(),
            self.make_request(RequestType::Info, Some(server.clone()), [].into()),
            None,
            true,
        )
        .wait()
    }

    /// Fails all outstanding requests and closes the transport.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let windows = self
            .windows
            .lock()
            .expect("lock is poisoned")
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for window in windows {
            window.fail_all();
        }

        // Queued retry jobs capture the client; drop them so the
        // client can actually be freed
        self.scheduler.clear_pending();

        self.transport.close();
    }

    fn make_request(
        &self,
        rtype: RequestType,
        target: Option<PeerId>,
        payload: Slice,
    ) -> RaftRequest {
        RaftRequest {
            client_id: self.client_id,
            call_id: self.call_id.fetch_add(1, Ordering::Relaxed) + 1,
            seq_num: 0,
            rtype,
            target,
            payload,
        }
    }

    fn window(&self, key: &str) -> Arc<SlidingWindow> {
        self.windows
            .lock()
            .expect("lock is poisoned")
            .entry(key.into())
            .or_insert_with(|| Arc::new(SlidingWindow::new(key)))
            .clone()
    }

    /// Registers the request in its window and runs the first send
    /// attempt.
    ///
    /// Blocking callers (`inline`) spend their own thread on the first
    /// attempt; async callers hand it to the timer pool. Retries always
    /// go through the pool.
    fn dispatch(
        &self,
        key: &str,
        request: RaftRequest,
        permit: Option<Permit>,
        inline: bool,
    ) -> ReplyFuture {
        let window = self.window(key);
        let (seq, future) = window.submit(request, permit);

        if self.closed.load(Ordering::Acquire) {
            window.record_reply(seq, Err(crate::Error::ClientClosed));
            return future;
        }

        if inline {
            self.run_attempt(&window, seq);
        } else {
            let client = self.clone();
            self.scheduler.submit(move || client.run_attempt(&window, seq));
        }

        future
    }

    /// One send attempt; transient failures re-schedule this via the
    /// retry timer with the same sequence number.
    fn run_attempt(&self, window: &Arc<SlidingWindow>, seq: u64) {
        if self.closed.load(Ordering::Acquire) {
            window.record_reply(seq, Err(crate::Error::ClientClosed));
            return;
        }

        // Delivered or cancelled in the meantime
        let Some(request) = window.request(seq) else {
            return;
        };

        let target = match &request.target {
            Some(peer) => peer.clone(),
            None => match self.leader_or_random() {
                Some(peer) => peer,
                None => {
                    log::warn!("No peers known, retrying seq {seq} later");
                    self.schedule_retry(window, seq);
                    return;
                }
            },
        };

        log::trace!(
            "Sending call {} (window {}, seq {seq}) to {target}",
            request.call_id,
            window.name(),
        );

        match self.transport.send(&target, &request) {
            Ok(Some(reply)) => window.record_reply(seq, Ok(reply)),

            // Null reply: timed out or dropped somewhere transient
            Ok(None) => self.schedule_retry(window, seq),

            Err(e) => self.handle_error(window, seq, &target, e),
        }
    }

    fn schedule_retry(&self, window: &Arc<SlidingWindow>, seq: u64) {
        if self.closed.load(Ordering::Acquire) {
            window.record_reply(seq, Err(crate::Error::ClientClosed));
            return;
        }

        let client = self.clone();
        let window = window.clone();

        self.scheduler
            .schedule(self.config.retry_interval, move || {
                client.run_attempt(&window, seq);
            });
    }

    /// The retry state machine's error transitions.
    fn handle_error(
        &self,
        window: &Arc<SlidingWindow>,
        seq: u64,
        target: &PeerId,
        error: crate::Error,
    ) {
        match error {
            crate::Error::NotLeader {
                peers,
                suggested_leader,
            } => {
                log::debug!(
                    "{target} is not the leader, suggested: {suggested_leader:?}",
                );

                if !peers.is_empty() {
                    self.transport.add_peers(&peers);
                    *self.peers.lock().expect("lock is poisoned") = Arc::new(peers);
                }

                *self.leader.lock().expect("lock is poisoned") = suggested_leader;

                window.reset_first_seq_num();
                self.schedule_retry(window, seq);
            }

            crate::Error::LeaderNotReady => {
                log::trace!("{target} is elected but not ready, retrying seq {seq}");
                self.schedule_retry(window, seq);
            }

            error if error.is_terminal() => {
                window.record_reply(seq, Err(error));
            }

            error => {
                log::debug!("I/O failure talking to {target}: {error}, retrying");

                // If the failed peer is still recorded as leader, guess
                // a different one; another request may have moved the
                // leader already
                {
                    let mut leader = self.leader.lock().expect("lock is poisoned");

                    if leader.as_ref().map_or(true, |current| current == target) {
                        *leader = self.random_other_peer(target);
                        log::debug!("Trying {:?} as leader candidate", *leader);

                        window.reset_first_seq_num();
                    }
                }

                self.schedule_retry(window, seq);
            }
        }
    }

    /// Current leader, or a random peer adopted as the leader guess.
    fn leader_or_random(&self) -> Option<PeerId> {
        let mut leader = self.leader.lock().expect("lock is poisoned");

        if let Some(peer) = leader.as_ref() {
            return Some(peer.clone());
        }

        use rand::seq::SliceRandom;
        let peers = self.peers.lock().expect("lock is poisoned").clone();
        let pick = peers.choose(&mut rand::thread_rng()).cloned();

        leader.clone_from(&pick);
        pick
    }

    /// A random peer other than `exclude`.
    fn random_other_peer(&self, exclude: &PeerId) -> Option<PeerId> {
        use rand::seq::SliceRandom;

        let peers = self.peers.lock().expect("lock is poisoned").clone();
        let candidates = peers
            .iter()
            .filter(|peer| *peer != exclude)
            .cloned()
            .collect::<Vec<_>>();

        candidates.choose(&mut rand::thread_rng()).cloned()
    }
}

impl Drop for RaftClientInner {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}
