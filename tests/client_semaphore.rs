// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use raft_core::{ClientConfig, Error, MockTransport, PeerId, RaftClient};
use std::{
    sync::{mpsc, Arc},
    time::{Duration, Instant},
};
use test_log::test;

fn peers() -> Vec<PeerId> {
    vec![PeerId::from("A"), PeerId::from("B"), PeerId::from("C")]
}

/// Polls until `condition` holds or the timeout expires.
fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    condition()
}

#[test]
fn semaphore_bounds_outstanding_requests() {
    // The transport never answers; retries are pushed far out so
    // requests stay outstanding
    let transport = Arc::new(MockTransport::new(|_target, _request| Ok(None)));

    let client = RaftClient::new(
        transport.clone(),
        peers(),
        Some(PeerId::from("A")),
        ClientConfig::default()
            .max_outstanding_requests(2)
            .retry_interval(Duration::from_secs(60)),
    );

    let (tx, rx) = mpsc::channel();

    let senders = (0..3)
        .map(|_| {
            let client = client.clone();
            let tx = tx.clone();

            std::thread::spawn(move || {
                // Blocks on the permit once saturated
                let future = client.send_async(b"x".as_slice());
                tx.send(future).unwrap();
            })
        })
        .collect::<Vec<_>>();

    // Exactly two requests got a permit and reached the transport
    assert!(eventually(Duration::from_secs(2), || {
        transport.sent().len() == 2
    }));

    let _first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();

    // The third sender is stuck acquiring its permit
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(2, transport.sent().len());
    assert!(senders.iter().any(|handle| !handle.is_finished()));

    // Cancelling one outstanding request frees its permit
    drop(second);

    assert!(eventually(Duration::from_secs(2), || {
        transport.sent().len() == 3
    }));

    for handle in senders {
        handle.join().unwrap();
    }

    client.close();
}

#[test]
fn close_fails_outstanding_requests() {
    let transport = Arc::new(MockTransport::new(|_target, _request| Ok(None)));

    let client = RaftClient::new(
        transport.clone(),
        peers(),
        Some(PeerId::from("A")),
        ClientConfig::default().retry_interval(Duration::from_secs(60)),
    );

    let future = client.send_async(b"x".as_slice());

    assert!(eventually(Duration::from_secs(2), || {
        !transport.sent().is_empty()
    }));

    client.close();

    assert!(matches!(future.wait(), Err(Error::ClientClosed)));
    assert!(transport.is_closed());
}

#[test]
fn blocking_send_skips_the_semaphore() {
    // Saturate the single async slot with a parked stale read, then
    // verify a blocking send still goes through
    let transport = Arc::new(MockTransport::new(|target, request| {
        if target == &PeerId::from("C") {
            // The async stale read parks forever
            Ok(None)
        } else {
            Ok(Some(raft_core::ok_reply(request.call_id)))
        }
    }));

    let client = RaftClient::new(
        transport.clone(),
        peers(),
        Some(PeerId::from("A")),
        ClientConfig::default()
            .max_outstanding_requests(1)
            .retry_interval(Duration::from_secs(60)),
    );

    let parked = client.send_stale_read_async(b"x".as_slice(), 0, PeerId::from("C"));

    assert!(eventually(Duration::from_secs(2), || {
        !transport.sent().is_empty()
    }));

    // Would deadlock here if sync sends took a permit
    let reply = client.send(b"payload".as_slice()).unwrap();
    assert!(reply.success);

    drop(parked);
    client.close();
}
