//! End-to-end messaging over the concrete transports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use xcm::{AttrMap, AttrValue, Condition, ErrorKind};

static NEXT_TAG: AtomicU64 = AtomicU64::new(0);

fn unique_name(prefix: &str) -> String {
    let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{tag}", std::process::id())
}

#[test]
fn ux_roundtrip() {
    let addr = format!("ux:{}", unique_name("xcm-msg-ux"));
    let mut server = xcm::server(&addr).unwrap();

    assert_eq!(server.transport(), "ux");
    assert_eq!(server.local_addr().unwrap(), addr);

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&client_addr).unwrap();
        assert_eq!(conn.transport(), "ux");
        assert_eq!(conn.remote_addr().unwrap(), client_addr);

        conn.send(b"hello").unwrap();

        let mut buf = [0u8; 64];
        let len = conn.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"olleh");
    });

    let mut conn = server.accept().unwrap();
    assert_eq!(conn.transport(), "ux");

    let mut buf = [0u8; 64];
    let len = conn.receive(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello");

    let mut reply = buf[..len].to_vec();
    reply.reverse();
    conn.send(&reply).unwrap();

    client.join().unwrap();
}

#[test]
fn uxf_roundtrip_and_unlink() {
    let dir = std::env::temp_dir().join(unique_name("xcm-msg-uxf"));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("server.sock");
    let addr = format!("uxf:{}", path.display());

    let server = xcm::server(&addr).unwrap();
    assert!(path.exists());

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&client_addr).unwrap();
        assert_eq!(conn.transport(), "uxf");
        conn.send(b"over-a-path").unwrap();
    });

    let mut server = server;
    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 64];
    let len = conn.receive(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"over-a-path");
    client.join().unwrap();

    server.close();
    assert!(!path.exists(), "socket file should be unlinked on close");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn tcp_roundtrip_in_order() {
    let mut server = xcm::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    assert!(addr.starts_with("tcp:127.0.0.1:"));

    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&addr).unwrap();
        assert_eq!(conn.transport(), "tcp");

        for i in 0..100u32 {
            conn.send(format!("msg-{i}").as_bytes()).unwrap();
        }

        let mut buf = [0u8; 64];
        let len = conn.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"done");
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 64];
    for i in 0..100u32 {
        let len = conn.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], format!("msg-{i}").as_bytes());
    }
    conn.send(b"done").unwrap();

    client.join().unwrap();
}

#[test]
fn tcp_counters_track_messages() {
    let mut server = xcm::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&addr).unwrap();
        conn.send(b"first").unwrap();
        conn.send(b"second").unwrap();

        let cnt = conn.counters();
        assert_eq!(cnt.from_app_msgs, 2);
        assert_eq!(cnt.from_app_bytes, 11);
        assert!(cnt.from_app_msgs >= cnt.to_lower_msgs);

        let mut buf = [0u8; 64];
        let len = conn.receive(&mut buf).unwrap();
        assert_eq!(len, 3);

        let cnt = conn.counters();
        assert_eq!(cnt.to_app_msgs, 1);
        assert_eq!(cnt.to_app_bytes, 3);
        assert!(cnt.from_lower_msgs >= cnt.to_app_msgs);
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(conn.receive(&mut buf).unwrap(), 5);
    assert_eq!(conn.receive(&mut buf).unwrap(), 6);
    conn.send(b"ack").unwrap();

    let cnt = conn.counters();
    assert_eq!(cnt.to_app_msgs, 2);
    assert_eq!(cnt.from_app_msgs, 1);

    client.join().unwrap();
}

#[test]
fn message_size_limits() {
    let addr = format!("ux:{}", unique_name("xcm-msg-limits"));
    let mut server = xcm::server(&addr).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&client_addr).unwrap();
        assert_eq!(conn.max_msg(), 65535);

        let oversized = vec![0u8; conn.max_msg() + 1];
        let err = conn.send(&oversized).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageTooLarge);

        let err = conn.send(b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // The failed sends must not have poisoned the connection.
        conn.send(b"still-alive").unwrap();
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 64];
    let len = conn.receive(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"still-alive");

    client.join().unwrap();
}

#[test]
fn receive_zero_after_peer_close() {
    let addr = format!("ux:{}", unique_name("xcm-msg-close"));
    let mut server = xcm::server(&addr).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let conn = xcm::connect(&client_addr).unwrap();
        conn.close();
    });

    let mut conn = server.accept().unwrap();
    client.join().unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(conn.receive(&mut buf).unwrap(), 0);
    // Closed-by-peer is not transient; it repeats.
    assert_eq!(conn.receive(&mut buf).unwrap(), 0);
}

#[test]
fn nonblocking_receive_would_block() {
    let addr = format!("ux:{}", unique_name("xcm-msg-nonblock"));
    let mut server = xcm::server(&addr).unwrap();

    let mut attrs = AttrMap::new();
    attrs.set_bool("xcm.blocking", false);

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect_with(&client_addr, &attrs).unwrap();
        assert!(!conn.is_blocking());

        conn.await_condition(Condition::READABLE).unwrap();
        let mut buf = [0u8; 64];
        let err = conn.receive(&mut buf).unwrap_err();
        assert!(err.is_would_block());

        conn.finish().unwrap();
    });

    let _conn = server.accept().unwrap();
    client.join().unwrap();
}

#[test]
fn connect_refused_without_listener() {
    let addr = format!("ux:{}", unique_name("xcm-msg-norun"));
    let err = xcm::connect(&addr).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
}

#[test]
fn await_condition_validates_socket_type() {
    let addr = format!("ux:{}", unique_name("xcm-msg-await"));
    let mut server = xcm::server(&addr).unwrap();

    let err = server.await_condition(Condition::READABLE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    server.await_condition(Condition::ACCEPTABLE).unwrap();
    server.await_condition(Condition::NONE).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&client_addr).unwrap();
        let err = conn.await_condition(Condition::ACCEPTABLE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        conn.await_condition(Condition::READABLE | Condition::WRITABLE)
            .unwrap();
    });

    let _conn = server.accept().unwrap();
    client.join().unwrap();
}

#[test]
fn common_attrs_roundtrip() {
    let addr = format!("ux:{}", unique_name("xcm-msg-attrs"));
    let mut server = xcm::server(&addr).unwrap();

    assert_eq!(
        server.attr("xcm.type").unwrap(),
        AttrValue::Str("server".to_string())
    );
    assert_eq!(
        server.attr("xcm.transport").unwrap(),
        AttrValue::Str("ux".to_string())
    );
    let err = server.attr("xcm.max_msg_size").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&client_addr).unwrap();

        assert_eq!(conn.attr("xcm.blocking").unwrap(), AttrValue::Bool(true));
        conn.set_attr("xcm.blocking", &AttrValue::Bool(false)).unwrap();
        assert_eq!(conn.attr("xcm.blocking").unwrap(), AttrValue::Bool(false));

        assert_eq!(
            conn.attr("xcm.type").unwrap(),
            AttrValue::Str("connection".to_string())
        );
        assert_eq!(conn.attr("xcm.max_msg_size").unwrap(), AttrValue::Int64(65535));
        assert_eq!(conn.attr("xcm.to_app_msgs").unwrap(), AttrValue::Int64(0));

        // Read-only attributes reject writes.
        let err = conn
            .set_attr("xcm.type", &AttrValue::Str("server".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);

        let err = conn.attr("xcm.no_such_attr").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut seen = Vec::new();
        conn.visit_attrs(|name, _value| seen.push(name.to_string()));
        assert!(seen.contains(&"xcm.transport".to_string()));
        assert!(seen.contains(&"xcm.from_lower_bytes".to_string()));
    });

    let _conn = server.accept().unwrap();
    client.join().unwrap();
}

#[test]
fn tcp_local_addr_attr_binds_source() {
    let mut server = xcm::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let mut attrs = AttrMap::new();
    attrs.set_str("xcm.local_addr", "tcp:127.0.0.1:0");

    let client = thread::spawn(move || {
        let mut conn = xcm::connect_with(&addr, &attrs).unwrap();
        let local = conn.local_addr().unwrap();
        assert!(local.starts_with("tcp:127.0.0.1:"));

        // Bound sockets no longer accept a local address.
        let err = conn
            .set_attr("xcm.local_addr", &AttrValue::Str("tcp:127.0.0.1:0".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    });

    let _conn = server.accept().unwrap();
    client.join().unwrap();
}

#[test]
fn set_local_addr_rejected_without_transport_support() {
    let addr = format!("ux:{}", unique_name("xcm-msg-setlocal"));
    let mut server = xcm::server(&addr).unwrap();

    let client_addr = addr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&client_addr).unwrap();
        let err = conn
            .set_attr("xcm.local_addr", &AttrValue::Str("ux:other".to_string()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    });

    let _conn = server.accept().unwrap();
    client.join().unwrap();
}

#[test]
fn unknown_proto_is_rejected() {
    let err = xcm::connect("nope:127.0.0.1:80").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtoNotAvailable);

    let err = xcm::server("not-an-address").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Addr);
}

#[test]
fn tcp_stream_attrs_present() {
    let mut server = xcm::server("tcp:127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&addr).unwrap();
        match conn.attr("tcp.rtt").unwrap() {
            AttrValue::Int64(rtt) => assert!(rtt >= 0),
            other => panic!("unexpected value: {other:?}"),
        }
        assert_eq!(conn.attr("tcp.total_retrans").unwrap(), AttrValue::Int64(0));
    });

    let _conn = server.accept().unwrap();
    client.join().unwrap();
}
