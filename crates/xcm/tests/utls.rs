//! The hybrid transport: local IPC when co-resident, TLS otherwise.

use std::thread;

use xcm::{AttrMap, AttrValue, ErrorKind};

#[test]
fn local_peer_resolves_to_local_ipc() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    assert_eq!(server.transport(), "utls");

    let laddr = server.local_addr().unwrap();
    assert!(laddr.starts_with("utls:127.0.0.1:"));
    let (_, port) = xcm_addr::parse_utls(&laddr).unwrap();
    assert!(port > 0, "port 0 bind must resolve to a kernel-assigned port");

    let client_addr = laddr.clone();
    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&client_addr).unwrap();

        // Co-resident peer: the connection masquerades as local IPC.
        assert_eq!(conn.transport(), "ux");
        assert_eq!(
            conn.attr("xcm.transport").unwrap(),
            AttrValue::Str("ux".to_string())
        );

        conn.send(b"hello").unwrap();

        let mut buf = [0u8; 64];
        let len = conn.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
    });

    let mut conn = server.accept().unwrap();
    assert_eq!(conn.transport(), "ux");
    assert_eq!(conn.max_msg(), 65535);

    let mut buf = [0u8; 64];
    let len = conn.receive(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello");
    conn.send(&buf[..len]).unwrap();

    client.join().unwrap();

    // The server socket never masquerades.
    assert_eq!(server.transport(), "utls");
    assert_eq!(
        server.attr("xcm.transport").unwrap(),
        AttrValue::Str("utls".to_string())
    );
}

#[test]
fn server_local_addr_is_stable_and_reusable() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    let laddr = server.local_addr().unwrap();

    // Reported address re-parses to the same host and port.
    let (host, port) = xcm_addr::parse_utls(&laddr).unwrap();
    assert_eq!(xcm_addr::make_utls(&host, port), laddr);
    assert_eq!(server.local_addr().unwrap(), laddr);

    // A second client using the reported address still lands on local IPC.
    for _ in 0..2 {
        let client_addr = laddr.clone();
        let client = thread::spawn(move || {
            let mut conn = xcm::connect(&client_addr).unwrap();
            assert_eq!(conn.transport(), "ux");
            conn.send(b"ping").unwrap();
        });

        let mut conn = server.accept().unwrap();
        let mut buf = [0u8; 64];
        let len = conn.receive(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        client.join().unwrap();
    }
}

#[test]
fn messages_survive_intact_in_order() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    let laddr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&laddr).unwrap();
        for i in 0..50u32 {
            let msg = vec![i as u8; (i as usize % 60) + 1];
            conn.send(&msg).unwrap();
        }
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 128];
    for i in 0..50u32 {
        let len = conn.receive(&mut buf).unwrap();
        assert_eq!(len, (i as usize % 60) + 1);
        assert!(buf[..len].iter().all(|&b| b == i as u8));
    }

    client.join().unwrap();
}

#[test]
fn conn_local_addr_delegates_to_active_sub() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    let laddr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&laddr).unwrap();
        // The resolved connection reports its sub-transport's address
        // form, if it has one at all.
        if let Some(local) = conn.local_addr() {
            assert!(local.starts_with("ux:"));
        }
        assert!(conn.remote_addr().unwrap().starts_with("ux:"));
        conn.send(b"bye").unwrap();
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 64];
    conn.receive(&mut buf).unwrap();
    client.join().unwrap();
}

#[test]
fn connect_without_any_server_fails() {
    // No local listener: the local IPC probe is refused, and the TLS
    // fallback cannot come up either (nothing listens, and this test
    // environment provisions no certificates). The connect must fail
    // with a real error, not would-block.
    let err = xcm::connect("utls:127.0.0.1:1").unwrap_err();
    assert!(!err.is_would_block());
}

#[test]
fn malformed_address_rejected() {
    let err = xcm::server("utls:127.0.0.1").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Addr);

    let err = xcm::connect("utls:[::1:80").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Addr);
}

#[test]
fn counters_proxy_to_active_sub() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    let laddr = server.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut conn = xcm::connect(&laddr).unwrap();
        conn.send(b"12345").unwrap();
        conn.send(b"678").unwrap();

        let cnt = conn.counters();
        assert_eq!(cnt.from_app_msgs, 2);
        assert_eq!(cnt.from_app_bytes, 8);
        assert!(cnt.from_app_msgs >= cnt.to_lower_msgs);

        assert_eq!(
            conn.attr("xcm.from_app_msgs").unwrap(),
            AttrValue::Int64(2)
        );
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(conn.receive(&mut buf).unwrap(), 5);
    assert_eq!(conn.receive(&mut buf).unwrap(), 3);

    let cnt = conn.counters();
    assert_eq!(cnt.to_app_msgs, 2);
    assert!(cnt.from_lower_msgs >= cnt.to_app_msgs);

    client.join().unwrap();
}

#[test]
fn tls_attrs_reachable_through_proxy() {
    // Before a connection resolves, the composite exposes both
    // sub-sockets' transport attributes through its proxy table. The
    // server keeps both subs for its whole lifetime.
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();

    let mut names = Vec::new();
    server.visit_attrs(|name, _value| names.push(name.to_string()));
    assert!(names.contains(&"tls.cert_file".to_string()));

    match server.attr("tls.cert_file").unwrap() {
        AttrValue::Str(path) => assert!(path.ends_with("cert.pem")),
        other => panic!("unexpected value: {other:?}"),
    }
}

#[test]
fn attr_map_applies_before_connect() {
    let mut server = xcm::server("utls:127.0.0.1:0").unwrap();
    let laddr = server.local_addr().unwrap();

    let mut attrs = AttrMap::new();
    attrs.set_str("tls.tc_file", "/nonexistent/tc.pem");

    let client = thread::spawn(move || {
        // The TLS sub-socket never handshakes on the local IPC path, so
        // the bogus trust-root path is harmless but must be accepted.
        let mut conn = xcm::connect_with(&laddr, &attrs).unwrap();
        assert_eq!(conn.transport(), "ux");
        conn.send(b"attrs").unwrap();
    });

    let mut conn = server.accept().unwrap();
    let mut buf = [0u8; 64];
    conn.receive(&mut buf).unwrap();
    client.join().unwrap();
}
