//! Extensible Connection-oriented Messaging.
//!
//! A uniform, message-preserving, reliable, in-order transport
//! abstraction over several link technologies: local IPC (`ux:`/`uxf:`),
//! framed TCP (`tcp:`), framed TLS (`tls:`) and the hybrid `utls:`
//! transport, which transparently prefers local IPC when client and
//! server share a host and falls back to TLS otherwise.
//!
//! The API is BSD-socket-like with message semantics. Sockets are
//! blocking by default; in non-blocking mode every operation may report
//! would-block, and the caller retries when the socket's [`Socket::fd`]
//! signals readable in its own event loop. After a wake-up with no
//! send/receive/accept to issue, call [`Socket::finish`] so background
//! work proceeds.
//!
//! ```no_run
//! let mut server = xcm::server("utls:127.0.0.1:13001")?;
//! let mut conn = server.accept()?;
//!
//! let mut buf = [0u8; 65535];
//! let len = conn.receive(&mut buf)?;
//! conn.send(&buf[..len])?;
//! # Ok::<(), xcm::Error>(())
//! ```
//!
//! Every socket additionally carries typed attributes (`xcm.*` plus
//! transport-specific ones) and, when the control directory exists, an
//! out-of-band control listener through which local introspection tools
//! read them without disturbing the owner's I/O.

pub mod attr;
pub mod ctl;
mod error;
mod event;
mod socket;
mod sys;
mod tp;
pub mod transport;

use std::sync::Arc;

pub use attr::{AttrMap, AttrMode, AttrSpec, AttrType, AttrValue};
pub use error::{Error, ErrorKind, Result};
pub use event::Epoll;
pub use socket::{Condition, ConnCounters, Socket, SocketCore, SocketType};
pub use tp::tls::{DEFAULT_TLS_CERT_DIR, TLS_CERT_DIR_ENV};

/// Apply an attribute map to a freshly created socket, before its
/// connect/bind operation runs.
pub(crate) fn apply_attrs(sock: &mut Socket, attrs: &AttrMap) -> Result<()> {
    for (name, value) in attrs.iter() {
        sock.set_attr(name, value)?;
    }
    Ok(())
}

fn create_socket(addr: &str, sock_type: SocketType, attrs: &AttrMap) -> Result<Socket> {
    let proto = transport::find_by_addr(addr)?;
    let epoll = Arc::new(Epoll::new().map_err(Error::from_io)?);
    let mut sock = Socket::create(proto, sock_type, epoll, true)?;
    apply_attrs(&mut sock, attrs)?;
    Ok(sock)
}

/// Connect to a remote endpoint. Blocking (unless the attribute map in
/// the `_with` variant says otherwise): returns once the connection is
/// established.
pub fn connect(remote_addr: &str) -> Result<Socket> {
    connect_with(remote_addr, &AttrMap::new())
}

/// Connect with socket attributes applied before the connection attempt.
pub fn connect_with(remote_addr: &str, attrs: &AttrMap) -> Result<Socket> {
    let mut sock = create_socket(remote_addr, SocketType::Conn, attrs)?;

    sock.connect_op(remote_addr)?;

    if sock.is_blocking() {
        // Drive establishment (and any handshake) to completion.
        loop {
            match sock.finish_once() {
                Ok(()) => break,
                Err(err) if err.is_would_block() => sock.wait_ready()?,
                Err(err) => return Err(err),
            }
        }
    }

    sock.enable_ctl();
    Ok(sock)
}

/// Bind a server socket at a local address.
pub fn server(local_addr: &str) -> Result<Socket> {
    server_with(local_addr, &AttrMap::new())
}

/// Bind a server socket with socket attributes applied before the bind.
pub fn server_with(local_addr: &str, attrs: &AttrMap) -> Result<Socket> {
    let mut sock = create_socket(local_addr, SocketType::Server, attrs)?;
    sock.server_op(local_addr)?;
    sock.enable_ctl();
    Ok(sock)
}
