use super::*;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::codec::MessageWriter;
use crate::connection::{ConnectionError, Direction, MessageRead, Path};
use crate::message::{ConnectionType, InitMessage, ServerRequest};
use crate::waiter::Waiter;

struct Harness {
    manager: Arc<PeerConnectionManager>,
    server_rx: mpsc::UnboundedReceiver<ServerRequest>,
    message_rx: mpsc::UnboundedReceiver<MessageRead>,
}

fn harness(wait_timeout: Duration) -> Harness {
    let waiter = Arc::new(Waiter::default());
    let (server_tx, server_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let mut options = PeerConnectionManagerOptions::new("us");
    options.wait_timeout = wait_timeout;
    // Slow test hosts must not trip the inactivity timer mid-assert.
    options.message_options.inactivity_timeout = None;
    options.transfer_options.inactivity_timeout = None;
    let manager = PeerConnectionManager::new(options, waiter, server_tx, message_tx);
    Harness {
        manager,
        server_rx,
        message_rx,
    }
}

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// An endpoint nothing listens on; direct connects fail fast.
async fn dead_endpoint() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn read_init_frame(socket: &mut TcpStream) -> InitMessage {
    let mut prefix = [0u8; 4];
    socket.read_exact(&mut prefix).await.unwrap();
    let length = u32::from_le_bytes(prefix) as usize;
    let mut body = vec![0u8; length];
    socket.read_exact(&mut body).await.unwrap();
    InitMessage::decode(Bytes::from(body)).unwrap()
}

fn cancel_token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn test_direct_wins_race() {
    let mut h = harness(Duration::from_secs(5));
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let token = cancel_token();
    let (connected, accepted) = tokio::join!(
        h.manager
            .get_or_add_message_connection("alice", addr, &token),
        peer.accept(),
    );
    let connection = connected.unwrap();
    let (mut peer_socket, _) = accepted.unwrap();

    assert_eq!(connection.username(), "alice");
    assert_eq!(connection.connection().direction(), Direction::Outbound);
    assert_eq!(connection.connection().path(), Path::Direct);

    // The first thing on the wire is our PeerInit handshake.
    match read_init_frame(&mut peer_socket).await {
        InitMessage::PeerInit {
            username,
            connection_type,
            ..
        } => {
            assert_eq!(username, "us");
            assert_eq!(connection_type, ConnectionType::Peer);
        }
        other => panic!("expected PeerInit, got {:?}", other),
    }

    // The parallel solicitation went out, and losing the race removed its
    // pending entry.
    let request = timeout(Duration::from_secs(1), h.server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        request,
        ServerRequest::ConnectToPeer {
            connection_type: ConnectionType::Peer,
            ..
        }
    ));
    assert_eq!(h.manager.pending_solicitations(), 0);
    assert!(h.manager.has_message_connection("alice"));
}

#[tokio::test]
async fn test_indirect_wins_when_direct_fails() {
    let mut h = harness(Duration::from_secs(5));
    let dead = dead_endpoint().await;

    let manager = h.manager.clone();
    let connect = tokio::spawn(async move {
        manager
            .get_or_add_message_connection("henry", dead, &cancel_token())
            .await
    });

    // The solicitation goes out; answer it the way the listener would on a
    // PierceFirewall bearing our token.
    let request = timeout(Duration::from_secs(2), h.server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let token = match request {
        ServerRequest::ConnectToPeer {
            token, username, ..
        } => {
            assert_eq!(username, "henry");
            token
        }
        other => panic!("expected ConnectToPeer, got {:?}", other),
    };
    assert_eq!(h.manager.solicited_username(token).as_deref(), Some("henry"));

    let (ours, mut theirs) = socket_pair().await;
    h.manager.pierce_firewall(token, ours).await.unwrap();

    let connection = timeout(Duration::from_secs(2), connect)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(connection.connection().path(), Path::Indirect);
    assert_eq!(connection.connection().direction(), Direction::Outbound);
    assert_eq!(h.manager.pending_solicitations(), 0);

    // No PeerInit goes out on the indirect path; the peer already
    // handshook with its PierceFirewall.
    let mut probe = [0u8; 1];
    assert!(timeout(Duration::from_millis(200), theirs.read(&mut probe))
        .await
        .is_err());

    // Continuous reading is live: a frame from the peer surfaces.
    theirs
        .write_all(&MessageWriter::new(4).build())
        .await
        .unwrap();
    let read = timeout(Duration::from_secs(2), h.message_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.username, "henry");
}

#[tokio::test]
async fn test_inbound_supersedes_cached_connection() {
    let h = harness(Duration::from_secs(5));

    let (first_ours, mut first_theirs) = socket_pair().await;
    let first = h
        .manager
        .add_message_connection("bob", first_ours)
        .await
        .unwrap();
    assert!(h.manager.has_message_connection("bob"));

    let (second_ours, mut second_theirs) = socket_pair().await;
    let second = h
        .manager
        .add_message_connection("bob", second_ours)
        .await
        .unwrap();
    assert_ne!(first.connection().id(), second.connection().id());

    // The superseded connection is disposed; its peer sees EOF.
    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(2), first_theirs.read(&mut probe))
        .await
        .expect("superseded socket should close")
        .unwrap();
    assert_eq!(read, 0);

    // A lookup returns the newer connection, and writes reach its socket.
    let cached = h
        .manager
        .get_or_add_message_connection(
            "bob",
            "127.0.0.1:9".parse().unwrap(),
            &cancel_token(),
        )
        .await
        .unwrap();
    assert_eq!(cached.connection().id(), second.connection().id());

    cached
        .write_frame(MessageWriter::new(4).build(), &cancel_token())
        .await
        .unwrap();
    let mut frame = [0u8; 8];
    second_theirs.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame[0..4], &4u32.to_le_bytes());
}

#[tokio::test]
async fn test_transfer_direct_sends_init_then_token() {
    let h = harness(Duration::from_secs(5));
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let token = cancel_token();
    let (connected, accepted) = tokio::join!(
        h.manager
            .get_transfer_connection("carol", addr, 42, &token),
        peer.accept(),
    );
    let connection = connected.unwrap();
    let (mut peer_socket, _) = accepted.unwrap();

    assert_eq!(connection.direction(), Direction::Outbound);
    assert_eq!(connection.path(), Path::Direct);

    match read_init_frame(&mut peer_socket).await {
        InitMessage::PeerInit {
            username,
            connection_type,
            token,
        } => {
            assert_eq!(username, "us");
            assert_eq!(connection_type, ConnectionType::Transfer);
            assert_eq!(token, 42);
        }
        other => panic!("expected PeerInit, got {:?}", other),
    }

    // The raw token preamble follows: 2a 00 00 00.
    let mut preamble = [0u8; 4];
    peer_socket.read_exact(&mut preamble).await.unwrap();
    assert_eq!(preamble, [0x2a, 0, 0, 0]);

    // Transfer connections are never cached.
    assert!(!h.manager.has_message_connection("carol"));
}

#[tokio::test]
async fn test_inbound_transfer_rendezvous() {
    let h = harness(Duration::from_secs(5));

    let (ours, mut theirs) = socket_pair().await;
    theirs.write_all(&42u32.to_le_bytes()).await.unwrap();

    let token = cancel_token();
    let (waited, added) = tokio::join!(
        h.manager
            .await_transfer_connection("carol", 42, &token),
        h.manager.add_transfer_connection("carol", 7, ours),
    );
    added.unwrap();
    let connection = waited.unwrap();
    assert_eq!(connection.direction(), Direction::Inbound);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_pierce_firewall_without_solicitation_is_rejected() {
    let h = harness(Duration::from_secs(5));
    let (ours, _theirs) = socket_pair().await;

    let err = h.manager.pierce_firewall(999, ours).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Protocol(_)));
}

#[tokio::test]
async fn test_both_branches_failing_raises_connect() {
    let h = harness(Duration::from_millis(200));
    let dead = dead_endpoint().await;

    let err = h
        .manager
        .get_or_add_message_connection("ivan", dead, &cancel_token())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Connect(_)));

    // The failed slot is gone so a later call can retry, and the
    // solicitation entry did not leak.
    assert!(!h.manager.has_message_connection("ivan"));
    assert_eq!(h.manager.pending_solicitations(), 0);
}

#[tokio::test]
async fn test_cancellation_cancels_both_branches() {
    let h = harness(Duration::from_secs(5));
    let dead = dead_endpoint().await;

    let cancel = cancel_token();
    cancel.cancel();
    let err = h
        .manager
        .get_or_add_message_connection("judy", dead, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::Cancelled);
    assert_eq!(h.manager.pending_solicitations(), 0);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_attempt() {
    let h = harness(Duration::from_secs(5));
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let first = h.manager.clone();
    let second = h.manager.clone();
    let (one, two, accepted) = tokio::join!(
        async move {
            first
                .get_or_add_message_connection("kate", addr, &cancel_token())
                .await
        },
        async move {
            second
                .get_or_add_message_connection("kate", addr, &cancel_token())
                .await
        },
        peer.accept(),
    );
    let _keep = accepted.unwrap();

    // Both callers share the single established connection.
    assert_eq!(
        one.unwrap().connection().id(),
        two.unwrap().connection().id()
    );
}

#[tokio::test]
async fn test_closed_connection_is_evicted() {
    let h = harness(Duration::from_secs(5));

    let (ours, theirs) = socket_pair().await;
    h.manager
        .add_message_connection("bob", ours)
        .await
        .unwrap();
    assert!(h.manager.has_message_connection("bob"));

    // The peer closes; the read loop fails and the monitor evicts.
    drop(theirs);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while h.manager.has_message_connection("bob") {
        assert!(
            tokio::time::Instant::now() < deadline,
            "closed connection never evicted"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_dispose_drains_everything() {
    let h = harness(Duration::from_secs(5));

    let (ours, mut theirs) = socket_pair().await;
    h.manager
        .add_message_connection("bob", ours)
        .await
        .unwrap();

    h.manager.dispose().await;

    assert!(!h.manager.has_message_connection("bob"));
    assert_eq!(h.manager.pending_solicitations(), 0);

    let mut probe = [0u8; 1];
    let read = timeout(Duration::from_secs(2), theirs.read(&mut probe))
        .await
        .expect("disposed connection should close")
        .unwrap();
    assert_eq!(read, 0);

    // The manager refuses new work after disposal.
    let err = h
        .manager
        .get_or_add_message_connection(
            "bob",
            "127.0.0.1:9".parse().unwrap(),
            &cancel_token(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::Cancelled);
}

#[tokio::test]
async fn test_dispose_faults_parked_indirect_waits() {
    let mut h = harness(Duration::from_secs(10));
    let dead = dead_endpoint().await;

    let manager = h.manager.clone();
    let connect = tokio::spawn(async move {
        manager
            .get_or_add_message_connection("nora", dead, &cancel_token())
            .await
    });

    // Once the solicitation is out, the caller is parked on the indirect
    // rendezvous with the direct branch already failed.
    let request = timeout(Duration::from_secs(2), h.server_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(request, ServerRequest::ConnectToPeer { .. }));

    h.manager.dispose().await;

    // Disposal faults the parked wait instead of leaving it to run out
    // the ten-second wait timeout.
    let err = timeout(Duration::from_secs(2), connect)
        .await
        .expect("parked wait should fault on disposal")
        .unwrap()
        .unwrap_err();
    assert_eq!(err, ConnectionError::Cancelled);
}

#[tokio::test]
async fn test_solicited_message_connection_answers_pierce_firewall() {
    let h = harness(Duration::from_secs(5));
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let response = crate::message::ConnectToPeerResponse {
        username: "laura".to_string(),
        connection_type: ConnectionType::Peer,
        address: "127.0.0.1".parse().unwrap(),
        port: addr.port(),
        token: 314,
        privileged: false,
    };

    let token = cancel_token();
    let (connected, accepted) = tokio::join!(
        h.manager
            .get_or_add_message_connection_from_response(&response, &token),
        peer.accept(),
    );
    let connection = connected.unwrap();
    let (mut peer_socket, _) = accepted.unwrap();

    // We answer the solicitation with PierceFirewall carrying their token,
    // tagged as an outbound indirect connection.
    assert_eq!(connection.connection().direction(), Direction::Outbound);
    assert_eq!(connection.connection().path(), Path::Indirect);
    match read_init_frame(&mut peer_socket).await {
        InitMessage::PierceFirewall { token } => assert_eq!(token, 314),
        other => panic!("expected PierceFirewall, got {:?}", other),
    }
    assert!(h.manager.has_message_connection("laura"));
}

#[tokio::test]
async fn test_solicited_transfer_connection_completes_waiter() {
    let h = harness(Duration::from_secs(5));
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let response = crate::message::ConnectToPeerResponse {
        username: "mike".to_string(),
        connection_type: ConnectionType::Transfer,
        address: "127.0.0.1".parse().unwrap(),
        port: addr.port(),
        token: 271,
        privileged: false,
    };

    let manager = h.manager.clone();
    let solicited = tokio::spawn(async move {
        manager
            .get_transfer_connection_from_response(&response, &cancel_token())
            .await
    });

    let (mut peer_socket, _) = peer.accept().await.unwrap();
    match read_init_frame(&mut peer_socket).await {
        InitMessage::PierceFirewall { token } => assert_eq!(token, 271),
        other => panic!("expected PierceFirewall, got {:?}", other),
    }
    peer_socket.write_all(&42u32.to_le_bytes()).await.unwrap();

    let remote_token = timeout(Duration::from_secs(2), solicited)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(remote_token, 42);

    // The transfer waiter resolves with the established connection.
    let connection = h
        .manager
        .await_transfer_connection("mike", 42, &cancel_token())
        .await
        .unwrap();
    assert_eq!(connection.path(), Path::Indirect);
}
