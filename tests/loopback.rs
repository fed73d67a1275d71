//! End-to-end loopback scenarios over real sockets: framed round trips,
//! chunked deframing, oversized-frame teardown, and disconnect semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use keel::{Client, DstreamFramer, MsgFramer, RawFramer, Server};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(300);

fn bound_port(server: &Server) -> u16 {
    server
        .local_endpoint()
        .expect("server reports its endpoint")
        .parse::<std::net::SocketAddr>()
        .expect("tcp endpoint parses")
        .port()
}

/// S1: msg ping/pong with exactly one disconnect event per side.
#[test]
fn msg_loopback_ping_pong() {
    keel::logging::init();

    let mut server = Server::new();
    let (server_received_tx, server_received) = mpsc::channel();
    let (server_disconnect_tx, server_disconnect) = mpsc::channel();
    server.on_new_connection(move |conn| {
        let received = server_received_tx.clone();
        conn.on_receive(move |conn, unit| {
            received.send(unit.as_bytes().to_vec()).unwrap();
            assert!(conn.send_bytes(b"PONG"));
        })
        .detach();
        let disconnect = server_disconnect_tx.clone();
        conn.on_disconnect(move |_| disconnect.send(()).unwrap()).detach();
    });
    server
        .start(
            Server::configure_tcp()
                .address("127.0.0.1", 0)
                .protocol(MsgFramer::new())
                .worker_name("ping-server"),
        )
        .unwrap();
    assert!(server.wait());
    let port = bound_port(&server);

    let mut client = Client::new();
    let (client_received_tx, client_received) = mpsc::channel();
    let (client_disconnect_tx, client_disconnect) = mpsc::channel();
    client.on_connect(move |conn| {
        let received = client_received_tx.clone();
        conn.on_receive(move |_, unit| received.send(unit.as_bytes().to_vec()).unwrap())
            .detach();
        let disconnect = client_disconnect_tx.clone();
        conn.on_disconnect(move |_| disconnect.send(()).unwrap()).detach();
        assert!(conn.send_bytes(b"PING"));
    });
    client.on_fail(|reason| panic!("client failed: {reason}"));
    let config = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(MsgFramer::new())
        .timeout_connect(Duration::from_secs(5));
    assert!(client.connect(config).unwrap());

    assert_eq!(server_received.recv_timeout(RECV_TIMEOUT).unwrap(), b"PING");
    assert_eq!(client_received.recv_timeout(RECV_TIMEOUT).unwrap(), b"PONG");

    // A second connect while a connection is owned aborts synchronously.
    let retry = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(MsgFramer::new());
    assert!(!client.connect(retry).unwrap());

    client.disconnect();

    client_disconnect.recv_timeout(RECV_TIMEOUT).unwrap();
    server_disconnect.recv_timeout(RECV_TIMEOUT).unwrap();
    // Exactly one disconnect event per side.
    assert!(client_disconnect.recv_timeout(SETTLE).is_err());
    assert!(server_disconnect.recv_timeout(SETTLE).is_err());
    assert!(!client.is_connected());

    server.stop(true);
    assert_eq!(server.connection_count(), 0);
    assert!(!server.is_running());
}

/// S2: two back-to-back msg frames in a single write deframe into two
/// receive callbacks in order.
#[test]
fn msg_chunked_deframing_two_frames_one_write() {
    let mut server = Server::new();
    let (received_tx, received) = mpsc::channel();
    server.on_new_connection(move |conn| {
        let received = received_tx.clone();
        conn.on_receive(move |_, unit| received.send(unit.as_bytes().to_vec()).unwrap())
            .detach();
    });
    server
        .start(
            Server::configure_tcp()
                .address("127.0.0.1", 0)
                .protocol(MsgFramer::new()),
        )
        .unwrap();
    assert!(server.wait());
    let port = bound_port(&server);

    // A raw client writes both frames as one 12-byte batch.
    let mut client = Client::new();
    let (connected_tx, connected) = mpsc::channel();
    client.on_connect(move |conn| {
        assert!(conn.send_bytes(b"\x05HELLO\x05WORLD"));
        connected_tx.send(()).unwrap();
    });
    let config = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(RawFramer::new());
    assert!(client.connect(config).unwrap());
    connected.recv_timeout(RECV_TIMEOUT).unwrap();

    assert_eq!(received.recv_timeout(RECV_TIMEOUT).unwrap(), b"HELLO");
    assert_eq!(received.recv_timeout(RECV_TIMEOUT).unwrap(), b"WORLD");

    server.stop(true);
}

/// S3: a frame longer than the codec bound tears the connection down
/// without any receive callback.
#[test]
fn msg_oversized_frame_rejected() {
    let mut server = Server::new();
    let received_count = Arc::new(AtomicUsize::new(0));
    let received_probe = received_count.clone();
    let (disconnect_tx, disconnect) = mpsc::channel();
    server.on_new_connection(move |conn| {
        let count = received_probe.clone();
        conn.on_receive(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .detach();
        let disconnect = disconnect_tx.clone();
        conn.on_disconnect(move |_| disconnect.send(()).unwrap()).detach();
    });
    server
        .start(
            Server::configure_tcp()
                .address("127.0.0.1", 0)
                .protocol(MsgFramer::with_max_size(10)),
        )
        .unwrap();
    assert!(server.wait());
    let port = bound_port(&server);

    let mut client = Client::new();
    client.on_connect(|conn| {
        // Varint length 128 with a few payload bytes behind it.
        assert!(conn.send_bytes(b"\x80\x01junk-bytes"));
    });
    let config = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(RawFramer::new());
    assert!(client.connect(config).unwrap());

    disconnect.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(received_count.load(Ordering::SeqCst), 0);

    server.stop(true);
}

/// S4: dstream payloads split across writes deframe in order with the
/// delimiter discarded.
#[test]
fn dstream_split_writes() {
    let mut server = Server::new();
    let (received_tx, received) = mpsc::channel();
    server.on_new_connection(move |conn| {
        let received = received_tx.clone();
        conn.on_receive(move |_, unit| received.send(unit.as_bytes().to_vec()).unwrap())
            .detach();
    });
    server
        .start(
            Server::configure_tcp()
                .address("127.0.0.1", 0)
                .protocol(DstreamFramer::new()),
        )
        .unwrap();
    assert!(server.wait());
    let port = bound_port(&server);

    let mut client = Client::new();
    client.on_connect(|conn| {
        // "alpha\r\n\r\nbeta\r\n\r\n" as writes of 4 and 13 bytes.
        assert!(conn.send_bytes(b"alph"));
        assert!(conn.send_bytes(b"a\r\n\r\nbeta\r\n\r\n"));
    });
    let config = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(RawFramer::new());
    assert!(client.connect(config).unwrap());

    assert_eq!(received.recv_timeout(RECV_TIMEOUT).unwrap(), b"alpha");
    assert_eq!(received.recv_timeout(RECV_TIMEOUT).unwrap(), b"beta");

    server.stop(true);
}

/// Unix-domain round trip through a process-unique preserved socket path.
#[test]
fn unix_domain_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let server_config = Server::configure_unix()
        .preserve_socket_file(dir.path())
        .protocol(MsgFramer::new())
        .worker_name("uds-server");
    let socket_path = server_config.current_socket_path().unwrap().to_path_buf();

    let mut server = Server::new();
    let (received_tx, received) = mpsc::channel();
    server.on_new_connection(move |conn| {
        let received = received_tx.clone();
        conn.on_receive(move |conn, unit| {
            received.send(unit.as_bytes().to_vec()).unwrap();
            assert!(conn.send_bytes(b"ACK"));
        })
        .detach();
    });
    server.start(server_config).unwrap();
    assert!(server.wait());
    assert!(socket_path.exists());

    let mut client = Client::new();
    let (client_received_tx, client_received) = mpsc::channel();
    client.on_connect(move |conn| {
        let received = client_received_tx.clone();
        conn.on_receive(move |_, unit| received.send(unit.as_bytes().to_vec()).unwrap())
            .detach();
        assert!(conn.send_bytes(b"local"));
    });
    let config = Client::configure_unix()
        .socket_path(&socket_path)
        .protocol(MsgFramer::new());
    assert!(client.connect(config).unwrap());

    assert_eq!(received.recv_timeout(RECV_TIMEOUT).unwrap(), b"local");
    assert_eq!(client_received.recv_timeout(RECV_TIMEOUT).unwrap(), b"ACK");

    server.stop(true);
    // The preserved socket file is unlinked on shutdown by default.
    assert!(!socket_path.exists());
}

/// Property: after disconnect() returns, no further receive callbacks fire,
/// even with more complete frames already buffered.
#[test]
fn no_receive_callbacks_after_disconnect() {
    let mut server = Server::new();
    let (connected_tx, connected) = mpsc::channel();
    server.on_new_connection(move |conn| {
        // Ten frames in one write; the peer disconnects on the first.
        for _ in 0..10 {
            assert!(conn.post_bytes(b"burst"));
        }
        assert!(conn.commit());
        connected_tx.send(()).unwrap();
    });
    server
        .start(
            Server::configure_tcp()
                .address("127.0.0.1", 0)
                .protocol(MsgFramer::new()),
        )
        .unwrap();
    assert!(server.wait());
    let port = bound_port(&server);

    let received_count = Arc::new(AtomicUsize::new(0));
    let received_probe = received_count.clone();
    let (disconnect_tx, disconnect) = mpsc::channel();
    let mut client = Client::new();
    client.on_connect(move |conn| {
        let count = received_probe.clone();
        conn.on_receive(move |conn, _| {
            count.fetch_add(1, Ordering::SeqCst);
            conn.disconnect();
        })
        .detach();
        let disconnect = disconnect_tx.clone();
        conn.on_disconnect(move |_| disconnect.send(()).unwrap()).detach();
    });
    let config = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(MsgFramer::new());
    assert!(client.connect(config).unwrap());

    connected.recv_timeout(RECV_TIMEOUT).unwrap();
    disconnect.recv_timeout(RECV_TIMEOUT).unwrap();
    std::thread::sleep(SETTLE);
    assert_eq!(received_count.load(Ordering::SeqCst), 1);

    server.stop(true);
}

/// Asynchronous connect failure surfaces through on_fail, not on_connect.
#[test]
fn connect_refused_routes_to_on_fail() {
    // Grab a port with no listener behind it.
    let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = vacant.local_addr().unwrap().port();
    drop(vacant);

    let mut client = Client::new();
    let (fail_tx, fail) = mpsc::channel();
    client.on_connect(|_| panic!("connect must not succeed"));
    client.on_fail(move |reason| fail_tx.send(reason.to_string()).unwrap());
    let config = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(MsgFramer::new())
        .timeout_connect(Duration::from_secs(2));
    assert!(client.connect(config).unwrap());

    let reason = fail.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(reason.contains(&port.to_string()));
}

/// An invalid configuration is an error, reported both through the return
/// value and the fail callback.
#[test]
fn invalid_config_errors_and_fails() {
    let mut client = Client::new();
    let (fail_tx, fail) = mpsc::channel();
    client.on_fail(move |reason| fail_tx.send(reason.to_string()).unwrap());

    // No port, no protocol.
    assert!(client.connect(Client::configure_tcp()).is_err());
    fail.recv_timeout(RECV_TIMEOUT).unwrap();
}

/// Batched posts flush as one commit and arrive as distinct frames.
#[test]
fn post_commit_batching() {
    let mut server = Server::new();
    let (received_tx, received) = mpsc::channel();
    server.on_new_connection(move |conn| {
        let received = received_tx.clone();
        conn.on_receive(move |_, unit| received.send(unit.as_bytes().to_vec()).unwrap())
            .detach();
    });
    server
        .start(
            Server::configure_tcp()
                .address("127.0.0.1", 0)
                .protocol(MsgFramer::new()),
        )
        .unwrap();
    assert!(server.wait());
    let port = bound_port(&server);

    let mut client = Client::new();
    client.on_connect(|conn| {
        assert!(conn.post_bytes(b"one"));
        assert!(conn.post_bytes(b"two"));
        assert!(conn.post_bytes(b"three"));
        assert!(conn.commit());
    });
    let config = Client::configure_tcp()
        .address("127.0.0.1", port)
        .protocol(MsgFramer::new());
    assert!(client.connect(config).unwrap());

    for expected in [b"one".as_slice(), b"two", b"three"] {
        assert_eq!(received.recv_timeout(RECV_TIMEOUT).unwrap(), expected);
    }

    server.stop(true);
}
