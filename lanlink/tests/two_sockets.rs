//! Two sockets on one host sharing a control port. The second one opened reaches
//! the first through the loopback port scan.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::time::Duration;

use lanlink::{Handlers, KeyPair, P2PError, P2PMessage, Socket, SocketConfig};

const WAIT: Duration = Duration::from_secs(10);

fn config(port: u16) -> SocketConfig {
    SocketConfig {
        port,
        port_count: 10,
        hello_interval_ms: 0,
        find_timeout_ms: 1_000,
        find_retries: 3,
        stream_timeout_ms: 30_000,
        ..SocketConfig::default()
    }
}

fn echo() -> Handlers {
    Handlers::new().on_receive_message(|req| {
        let mut reply = b"echo:".to_vec();
        reply.extend_from_slice(req.message.as_bytes());
        P2PMessage::new(reply)
    })
}

#[test]
fn broadcast_arrives_byte_identical() {
    let (tx, rx) = mpsc::channel();
    let a = Socket::open(
        config(43000),
        Handlers::new().on_receive_broadcast(move |req| {
            let _ = tx.send((req.sender, req.message.as_bytes().to_vec()));
        }),
    )
    .unwrap();
    let b = Socket::open(config(43000), Handlers::new()).unwrap();
    assert!(b.bound_port() > a.bound_port());

    let payload: Vec<u8> = (0u8..=255).collect();
    b.send_broadcast(payload.clone());
    let (sender, got) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(sender, b.local_node_id());
    assert_eq!(got, payload);
}

#[test]
fn sequential_sends_share_one_handshake() {
    let a = Socket::open(config(43100), echo()).unwrap();
    let b = Socket::open(config(43100), Handlers::new()).unwrap();

    for text in ["one", "two"] {
        let (tx, rx) = mpsc::channel();
        b.send_message(a.local_node_id(), text, move |r| {
            let _ = tx.send(r);
        });
        let response = rx.recv_timeout(WAIT).unwrap();
        let expected = format!("echo:{}", text);
        assert_eq!(response.message().and_then(|m| m.text()), Some(expected.as_str()));
    }
    let stats = b.stats();
    assert_eq!(stats.tcp_handshakes, 1);
    assert_eq!(stats.tcp_dials, 1);
    assert_eq!(stats.pooled_reuses, 1);
    assert_eq!(a.stats().messages_received, 2);
}

#[test]
fn unknown_node_exhausts_lookup_budget() {
    let s = Socket::open(
        SocketConfig {
            find_timeout_ms: 100,
            ..config(43200)
        },
        Handlers::new(),
    )
    .unwrap();
    let (tx, rx) = mpsc::channel();
    s.send_message(KeyPair::generate().node_id(), "anyone?", move |r| {
        let _ = tx.send(r);
    });
    let response = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(response.error(), Some(&P2PError::NodeNotFound));
    assert_eq!(s.stats().find_node_sent, 4);
}

#[test]
fn per_call_timeout_fires() {
    let s = Socket::open(
        SocketConfig {
            find_timeout_ms: 5_000,
            ..config(43300)
        },
        Handlers::new(),
    )
    .unwrap();
    let (tx, rx) = mpsc::channel();
    s.send_message_with_timeout(
        KeyPair::generate().node_id(),
        "x",
        Some(Duration::from_millis(200)),
        move |r| {
            let _ = tx.send(r);
        },
    );
    let response = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(response.error(), Some(&P2PError::Timeout));
}

#[test]
fn empty_reply_is_ok() {
    let a = Socket::open(config(43400), Handlers::new()).unwrap();
    let b = Socket::open(config(43400), Handlers::new()).unwrap();
    let (tx, rx) = mpsc::channel();
    b.send_message(a.local_node_id(), P2PMessage::empty(), move |r| {
        let _ = tx.send(r);
    });
    let response = rx.recv_timeout(WAIT).unwrap();
    assert!(response.is_ok());
    assert!(response.message().unwrap().is_empty());
}

#[test]
fn datagram_reaches_handler() {
    let (tx, rx) = mpsc::channel();
    let a = Socket::open(
        config(43500),
        Handlers::new().on_receive_datagram(move |req| {
            let _ = tx.send(req.message.as_bytes().to_vec());
        }),
    )
    .unwrap();
    let b = Socket::open(config(43500), Handlers::new()).unwrap();
    b.send_datagram(
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, a.bound_port()),
        b"fire and forget".to_vec(),
    );
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), b"fire and forget");
}

#[test]
fn hello_prefix_is_stripped() {
    let (tx, rx) = mpsc::channel();
    let prefixed = |port| SocketConfig {
        hello_prefix: "app/".into(),
        ..config(port)
    };
    let a = Socket::open(
        prefixed(43600),
        Handlers::new().on_receive_hello(move |req| {
            let _ = tx.send((req.sender, req.message.as_bytes().to_vec()));
        }),
    )
    .unwrap();
    let b = Socket::open(
        SocketConfig {
            hello_message: "room-7".into(),
            ..prefixed(43600)
        },
        Handlers::new(),
    )
    .unwrap();
    let (sender, body) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(sender, b.local_node_id());
    assert_eq!(body, b"room-7");
    drop(a);
}

#[test]
fn connect_node_verifies_peer() {
    let (tx, rx) = mpsc::channel();
    let a = Socket::open(config(43700), Handlers::new()).unwrap();
    let b = Socket::open(
        config(43700),
        Handlers::new().on_connect_node(move |node, addr| {
            let _ = tx.send((node, addr));
        }),
    )
    .unwrap();
    b.connect_node(a.local_node_id());
    let (node, addr) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(node, a.local_node_id());
    assert_eq!(addr.port(), a.bound_port());
    assert_eq!(b.known_nodes(), 1);
}

#[tokio::test]
async fn request_from_another_runtime() {
    let a = Socket::open(config(43800), echo()).unwrap();
    let b = Socket::open(config(43800), Handlers::new()).unwrap();
    let response = b.request(a.local_node_id(), "ping", None).await;
    assert_eq!(response.message().and_then(|m| m.text()), Some("echo:ping"));
    b.close();
    let after = b.request(a.local_node_id(), "ping", None).await;
    assert_eq!(after.error(), Some(&P2PError::Closed));
}
