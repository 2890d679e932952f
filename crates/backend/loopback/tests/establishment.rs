//! End-to-end flows over the loopback fabric: the four-message connection
//! handshake, identity agreement, and typed message routing between two
//! endpoints.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use loopback::{LoopbackFabric, LoopbackTransport};
use serde::{Deserialize, Serialize};
use test_log::test;
use weft::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Chat {
    body: String,
}

impl TypedMessage for Chat {
    const KEY: TypeKey = TypeKey::new(7);
}

struct Peer {
    endpoint: Endpoint,
    transport: Arc<LoopbackTransport>,
}

fn peer_pair() -> (Peer, Peer) {
    let (left, right) = LoopbackFabric::pair();
    let pool: Arc<dyn WorkerPool> = Arc::new(CallerThreadPool);
    let a = Endpoint::new(
        EndpointConfig::default(),
        SessionId::new(1),
        Arc::clone(&left) as Arc<dyn Transport>,
        Arc::clone(&pool),
    )
    .unwrap();
    let b = Endpoint::new(
        EndpointConfig::default(),
        SessionId::new(2),
        Arc::clone(&right) as Arc<dyn Transport>,
        pool,
    )
    .unwrap();
    (
        Peer {
            endpoint: a,
            transport: left,
        },
        Peer {
            endpoint: b,
            transport: right,
        },
    )
}

/// Delivers queued frames back and forth until both sides go quiet. With the
/// caller-thread pool every handler runs inline, so one call settles the
/// whole exchange.
fn pump(peers: &[&Peer]) {
    loop {
        let mut moved = false;
        for peer in peers {
            for (conn, bytes) in peer.transport.drain_inbound() {
                moved = true;
                peer.endpoint.handle_inbound(&conn, &bytes).unwrap();
            }
        }
        if !moved {
            break;
        }
    }
}

#[test]
fn handshake_primes_connection_and_agrees_on_identity() {
    let (a, b) = peer_pair();
    let key = Chat::KEY;

    let handle = a.endpoint.establish(key).unwrap();
    assert!(!handle.is_fulfilled());
    pump(&[&a, &b]);

    handle.wait().unwrap();
    assert!(handle.is_fulfilled());

    let a_conn = a.endpoint.session().connections().get(key).unwrap();
    let b_conn = b.endpoint.session().connections().get(key).unwrap();
    assert!(a_conn.is_primed());
    assert!(b_conn.is_primed());

    let a_id = a.endpoint.session().identity();
    let b_id = b.endpoint.session().identity();
    assert!(!a_id.is_empty());
    assert_eq!(a_id, b_id, "both sides settle on one identity");
    assert!(!a.endpoint.coordinator().has_pending(key));
}

#[test]
fn initiator_keeps_a_preassigned_identity() {
    let (a, b) = peer_pair();
    let fixed = PeerId::generate();
    a.endpoint.session().assign_identity(fixed).unwrap();

    a.endpoint.establish(Chat::KEY).unwrap();
    pump(&[&a, &b]);

    assert_eq!(a.endpoint.session().identity(), fixed);
    assert_eq!(
        b.endpoint.session().identity(),
        fixed,
        "the responder adopts the initiator's identity"
    );
}

#[test]
fn waiter_thread_is_released_by_the_pump() {
    let (a, b) = peer_pair();
    let handle = a.endpoint.establish(Chat::KEY).unwrap();

    let waiter = std::thread::spawn(move || handle.wait());
    pump(&[&a, &b]);
    waiter.join().unwrap().unwrap();
}

#[test]
fn wait_timeout_expires_until_frames_flow() {
    let (a, b) = peer_pair();
    let handle = a.endpoint.establish(Chat::KEY).unwrap();
    assert!(!handle.wait_timeout(Duration::from_millis(10)).unwrap());

    pump(&[&a, &b]);
    assert!(handle.wait_timeout(Duration::from_millis(10)).unwrap());
}

#[test]
fn reestablishing_a_live_key_fails_fast() {
    let (a, b) = peer_pair();
    a.endpoint.establish(Chat::KEY).unwrap();
    pump(&[&a, &b]);

    let err = a.endpoint.establish(Chat::KEY).unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Handshake(HandshakeError::KeyAlreadyBound(key)) if key == Chat::KEY
    ));
}

#[test]
fn typed_messages_route_over_the_established_stream() {
    let (a, b) = peer_pair();
    a.endpoint.register_message::<Chat>().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    b.endpoint
        .register_message::<Chat>()
        .unwrap()
        .add_last(FnHandler::payload("chat.collect", move |chat: &Chat| {
            sink.lock().unwrap().push(chat.clone());
        }))
        .unwrap();

    a.endpoint.establish(Chat::KEY).unwrap();
    pump(&[&a, &b]);

    a.endpoint
        .send(&Chat {
            body: "over the new stream".into(),
        })
        .unwrap();
    pump(&[&a, &b]);

    let got = received.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].body, "over the new stream");
}

#[test]
fn unestablished_key_falls_back_to_the_default_connection() {
    let (a, b) = peer_pair();
    a.endpoint.register_message::<Chat>().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    b.endpoint
        .register_message::<Chat>()
        .unwrap()
        .add_last(FnHandler::full(
            "chat.collect",
            move |conn: &Arc<ConnectionHandle>, _session: &Session, chat: &Chat| {
                sink.lock().unwrap().push((conn.key(), chat.clone()));
            },
        ))
        .unwrap();

    a.endpoint.send(&Chat { body: "hi".into() }).unwrap();
    pump(&[&a, &b]);

    let got = received.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, TypeKey::DEFAULT_CONNECTION);
}

#[test]
fn unrouted_inbound_goes_to_default_handlers() {
    let (a, b) = peer_pair();
    a.endpoint.register_message::<Chat>().unwrap();
    // Decoder but no pipeline on the receiving side.
    b.endpoint.register_message::<Chat>().unwrap();
    b.endpoint.router().unregister::<Chat>();

    let hits = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&hits);
    b.endpoint
        .router()
        .add_default_handler(FnHandler::payload("chat.fallback", move |_: &Chat| {
            *counter.lock().unwrap() += 1;
        }));

    a.endpoint.send(&Chat { body: "hi".into() }).unwrap();
    pump(&[&a, &b]);
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn undecodable_frames_do_not_kill_the_reader_loop() {
    let (a, b) = peer_pair();
    a.endpoint.register_message::<Chat>().unwrap();
    // The receiver never learns about Chat.
    a.endpoint.send(&Chat { body: "lost".into() }).unwrap();

    let frames = b.transport.drain_inbound();
    assert_eq!(frames.len(), 1);
    let err = b.endpoint.handle_inbound(&frames[0].0, &frames[0].1).unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Codec(weft::codec::CodecError::UnknownKey(key)) if key == Chat::KEY
    ));

    // The link is still usable; a handshake completes afterwards.
    a.endpoint.establish(Chat::KEY).unwrap();
    pump(&[&a, &b]);
    assert!(a.endpoint.session().connections().get(Chat::KEY).unwrap().is_primed());
}

#[test]
fn oversized_frames_are_rejected_before_decoding() {
    let (left, right) = LoopbackFabric::pair();
    let config = EndpointConfig {
        max_frame_bytes: 16,
        ..EndpointConfig::default()
    };
    let small = Endpoint::new(
        config,
        SessionId::new(3),
        Arc::clone(&right) as Arc<dyn Transport>,
        Arc::new(CallerThreadPool),
    )
    .unwrap();

    let conn = left.open_connection(TypeKey::DEFAULT_CONNECTION).unwrap();
    left.write(&conn, bytes::Bytes::from(vec![0u8; 64])).unwrap();
    let frames = right.drain_inbound();
    let err = small.handle_inbound(&frames[0].0, &frames[0].1).unwrap_err();
    assert!(matches!(
        err,
        EndpointError::Codec(weft::codec::CodecError::FrameTooLarge { size: 64, max: 16 })
    ));
}

#[test]
fn tokio_pool_endpoints_settle_the_handshake() {
    let (left, right) = LoopbackFabric::pair();
    let a = Endpoint::with_tokio_pool(
        EndpointConfig::default(),
        SessionId::new(1),
        Arc::clone(&left) as Arc<dyn Transport>,
    )
    .unwrap();
    let b = Endpoint::with_tokio_pool(
        EndpointConfig::default(),
        SessionId::new(2),
        Arc::clone(&right) as Arc<dyn Transport>,
    )
    .unwrap();

    let handle = a.establish(Chat::KEY).unwrap();
    // Handlers run on worker threads here, so the pump has to poll until the
    // ping round trip lands.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !handle.is_fulfilled() && std::time::Instant::now() < deadline {
        for (conn, bytes) in left.drain_inbound() {
            a.handle_inbound(&conn, &bytes).unwrap();
        }
        for (conn, bytes) in right.drain_inbound() {
            b.handle_inbound(&conn, &bytes).unwrap();
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(a.wait_established(&handle).unwrap());
    assert!(a.session().connections().get(Chat::KEY).unwrap().is_primed());
}
