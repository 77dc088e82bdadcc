// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::client::{
    semaphore::Permit,
    transport::{RaftReply, RaftRequest},
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

/// Future for one request's reply
///
/// Dropping the future cancels waiting and releases the request's
/// semaphore permit; the request itself keeps retrying until the
/// window delivers or discards it.
pub struct ReplyFuture {
    rx: Receiver<crate::Result<RaftReply>>,
    permit: Arc<Mutex<Option<Permit>>>,
}

impl ReplyFuture {
    /// Blocks until the reply arrives.
    ///
    /// # Errors
    ///
    /// Will return `Err` on terminal request failure or client
    /// shutdown.
    pub fn wait(self) -> crate::Result<RaftReply> {
        match self.rx.recv() {
            Ok(result) => result,
            Err(_) => Err(crate::Error::ClientClosed),
        }
    }

    /// Like [`ReplyFuture::wait`], but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Will return `Err` on timeout, terminal failure or client
    /// shutdown.
    pub fn wait_timeout(self, timeout: Duration) -> crate::Result<RaftReply> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no reply in time",
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(crate::Error::ClientClosed),
        }
    }
}

impl Drop for ReplyFuture {
    fn drop(&mut self) {
        // Give the permit back even if the caller never waited
        self.permit.lock().expect("lock is poisoned").take();
    }
}

struct Pending {
    request: RaftRequest,

    /// Reply that arrived while an earlier request is still open
    reply: Option<crate::Result<RaftReply>>,

    done: Sender<crate::Result<RaftReply>>,
    permit: Arc<Mutex<Option<Permit>>>,
}

struct WindowState {
    /// Seq of the first request the current leader stream starts at
    first_seq: u64,

    next_seq: u64,

    pending: BTreeMap<u64, Pending>,
}

/// Per-target FIFO enforcing ordered at-most-once reply delivery
///
/// Sequence numbers are assigned on submit; replies are handed to their
/// futures strictly in sequence order, holding back replies that arrive
/// out of order until the prefix completes.
pub struct SlidingWindow {
    name: String,
    state: Mutex<WindowState>,
}

impl SlidingWindow {
    /// Creates an empty window.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(WindowState {
                first_seq: 0,
                next_seq: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Target name the window is keyed by.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assigns the next sequence number to `request` and registers it.
    ///
    /// Returns the sequence number and the caller's reply future.
    pub fn submit(&self, mut request: RaftRequest, permit: Option<Permit>) -> (u64, ReplyFuture) {
        let (done, rx) = bounded(1);
        let permit = Arc::new(Mutex::new(permit));

        let mut state = self.state.lock().expect("lock is poisoned");

        let seq = state.next_seq;
        state.next_seq += 1;
        request.seq_num = seq;

        state.pending.insert(
            seq,
            Pending {
                request,
                reply: None,
                done,
                permit: permit.clone(),
            },
        );

        log::trace!("Window {}: submitted seq {seq}", self.name);

        (seq, ReplyFuture { rx, permit })
    }

    /// Clones the registered request for a (re)send.
    ///
    /// Returns `None` once the request was delivered or discarded.
    #[must_use]
    pub fn request(&self, seq: u64) -> Option<RaftRequest> {
        self.state
            .lock()
            .expect("lock is poisoned")
            .pending
            .get(&seq)
            .map(|pending| pending.request.clone())
    }

    /// Records the final result for `seq` and delivers every completed
    /// reply at the front of the window, in sequence order.
    ///
    /// A result for an already-delivered sequence number is dropped;
    /// the server-side retry cache makes duplicate replies harmless.
    pub fn record_reply(&self, seq: u64, result: crate::Result<RaftReply>) {
        let mut state = self.state.lock().expect("lock is poisoned");

        let Some(pending) = state.pending.get_mut(&seq) else {
            log::trace!("Window {}: dropping duplicate reply for seq {seq}", self.name);
            return;
        };

        pending.reply = Some(result);

        // Deliver the completed prefix
        loop {
            let Some((&front, pending)) = state.pending.iter().next() else {
                break;
            };

            if pending.reply.is_none() {
                break;
            }

            let pending = state.pending.remove(&front).expect("front entry exists");

            // Release the permit before handing out the reply
            pending.permit.lock().expect("lock is poisoned").take();

            let reply = pending.reply.expect("reply was recorded");
            if pending.done.send(reply).is_err() {
                log::trace!("Window {}: future for seq {front} was dropped", self.name);
            }

            state.first_seq = front + 1;
        }
    }

    /// Restarts the window against a new leader: subsequent sends begin
    /// again from the lowest outstanding sequence number.
    ///
    /// Re-sending is safe because the server-side retry cache, keyed by
    /// `(clientId, callId)`, dedupes.
    pub fn reset_first_seq_num(&self) {
        let mut state = self.state.lock().expect("lock is poisoned");

        let first = state
            .pending
            .keys()
            .next()
            .copied()
            .unwrap_or(state.next_seq);
        state.first_seq = first;

        log::debug!("Window {}: first seq reset to {first}", self.name);
    }

    /// Lowest sequence number not yet delivered.
    #[allow(unused)]
    #[must_use]
    pub fn first_seq_num(&self) -> u64 {
        self.state.lock().expect("lock is poisoned").first_seq
    }

    /// Number of undelivered requests.
    #[allow(unused)]
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("lock is poisoned").pending.len()
    }

    /// Fails every outstanding request; used on client shutdown.
    pub fn fail_all(&self) {
        let mut state = self.state.lock().expect("lock is poisoned");

        for (_, pending) in std::mem::take(&mut state.pending) {
            pending.permit.lock().expect("lock is poisoned").take();
            let _ = pending.done.send(Err(crate::Error::ClientClosed));
        }

        state.first_seq = state.next_seq;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::client::transport::{ClientId, RequestType};
    use test_log::test;

    fn request(call_id: u64) -> RaftRequest {
        RaftRequest {
            client_id: ClientId::random(),
            call_id,
            seq_num: 0,
            rtype: RequestType::Write,
            target: None,
            payload: [].into(),
        }
    }

    fn reply(call_id: u64) -> RaftReply {
        RaftReply {
            call_id,
            success: true,
            payload: [].into(),
        }
    }

    #[test]
    fn window_delivers_in_sequence_order() {
        let window = SlidingWindow::new("RAFT");

        let (s0, f0) = window.submit(request(10), None);
        let (s1, f1) = window.submit(request(11), None);
        let (s2, f2) = window.submit(request(12), None);
        assert_eq!((0, 1, 2), (s0, s1, s2));

        // Replies arrive out of order; nothing is delivered until the
        // prefix completes
        window.record_reply(s2, Ok(reply(12)));
        window.record_reply(s1, Ok(reply(11)));
        assert!(f0
            .wait_timeout(Duration::from_millis(20))
            .is_err());
        assert_eq!(3, window.pending_len());

        window.record_reply(s0, Ok(reply(10)));

        // f0 was consumed by the timed-out wait; the rest deliver in order
        assert_eq!(11, f1.wait().unwrap().call_id);
        assert_eq!(12, f2.wait().unwrap().call_id);
        assert_eq!(0, window.pending_len());
        assert_eq!(3, window.first_seq_num());
    }

    #[test]
    fn window_ignores_duplicate_replies() {
        let window = SlidingWindow::new("RAFT");

        let (seq, future) = window.submit(request(10), None);
        window.record_reply(seq, Ok(reply(10)));
        window.record_reply(seq, Ok(reply(10)));

        assert_eq!(10, future.wait().unwrap().call_id);
        assert_eq!(0, window.pending_len());
    }

    #[test]
    fn window_reset_points_at_lowest_outstanding() {
        let window = SlidingWindow::new("RAFT");

        let (s0, f0) = window.submit(request(10), None);
        let (_s1, _f1) = window.submit(request(11), None);

        window.record_reply(s0, Ok(reply(10)));
        f0.wait().unwrap();
        assert_eq!(1, window.first_seq_num());

        window.reset_first_seq_num();
        assert_eq!(1, window.first_seq_num());

        window.fail_all();
        assert_eq!(2, window.first_seq_num());
    }

    #[test]
    fn window_terminal_error_still_ordered() {
        let window = SlidingWindow::new("RAFT");

        let (s0, f0) = window.submit(request(10), None);
        let (s1, f1) = window.submit(request(11), None);

        window.record_reply(s1, Err(crate::Error::GroupMismatch));
        window.record_reply(s0, Ok(reply(10)));

        assert!(f0.wait().is_ok());
        assert!(matches!(f1.wait(), Err(crate::Error::GroupMismatch)));
    }
}
