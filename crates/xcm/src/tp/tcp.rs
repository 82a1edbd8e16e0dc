//! Framed TCP transport.
//!
//! A TCP byte stream carrying length-prefixed messages. Connects are
//! non-blocking (`EINPROGRESS` resolved later via `finish`); partial
//! writes are buffered and flushed as background work, partial reads
//! accumulate until a complete message is available. At most one message
//! is buffered on the send side; further sends report would-block.

use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use socket2::{Domain, Protocol, SockAddr, Socket as OsSocket, TcpKeepalive, Type};
use tracing::debug;

use crate::attr::{AttrMode, AttrSpec, AttrType, AttrValue};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{Epoll, Registration, Trigger, IN, OUT};
use crate::socket::{Condition, Socket, SocketCore, SocketType};
use crate::sys;
use crate::tp::frame;
use crate::transport::{self, TpSocket};

const READ_CHUNK_SIZE: usize = 8 * 1024;
const LISTEN_BACKLOG: i32 = 128;

pub(crate) const ATTR_TCP_RTT: &str = "tcp.rtt";
pub(crate) const ATTR_TCP_TOTAL_RETRANS: &str = "tcp.total_retrans";

pub(crate) fn new(_sock_type: SocketType) -> Box<dyn TpSocket> {
    Box::new(TcpSocket {
        state: State::Init { local: None },
    })
}

/// Resolve a host/port pair into a socket address. DNS names resolve
/// synchronously; the first result wins.
pub(crate) fn resolve(host: &xcm_addr::Host, port: u16) -> Result<SocketAddr> {
    if let Some(ip) = host.ip() {
        return Ok(SocketAddr::new(ip, port));
    }

    let xcm_addr::Host::Name(name) = host else {
        return Err(Error::InvalidArgument("unresolvable host".to_string()));
    };

    (name.as_str(), port)
        .to_socket_addrs()
        .map_err(Error::from_io)?
        .next()
        .ok_or(Error::Unreachable)
}

fn apply_keepalive(sock: &OsSocket) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(1))
        .with_interval(Duration::from_secs(1))
        .with_retries(3);
    if let Err(err) = sock.set_tcp_keepalive(&keepalive) {
        debug!("failed to configure TCP keepalive: {err}");
    }
}

/// Begin a non-blocking TCP connect. Returns the socket and whether the
/// connection is already established.
pub(crate) fn start_connect(
    remote: &SocketAddr,
    local: Option<&SocketAddr>,
) -> Result<(OsSocket, bool)> {
    let sock = OsSocket::new(
        Domain::for_address(*remote),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(Error::from_io)?;
    sock.set_nonblocking(true).map_err(Error::from_io)?;
    sock.set_nodelay(true).map_err(Error::from_io)?;
    apply_keepalive(&sock);

    if let Some(local) = local {
        sock.bind(&SockAddr::from(*local)).map_err(Error::from_io)?;
    }

    match sock.connect(&SockAddr::from(*remote)) {
        Ok(()) => Ok((sock, true)),
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok((sock, false)),
        Err(err) => Err(Error::from_io(err)),
    }
}

/// Resolve an in-progress connect: `Ok(())` once established, would-block
/// while pending, the connect error otherwise.
pub(crate) fn try_establish(sock: &OsSocket, established: &mut bool) -> Result<()> {
    if *established {
        return Ok(());
    }

    if let Some(err) = sock.take_error().map_err(Error::from_io)? {
        return Err(Error::from_io(err));
    }

    match sock.peer_addr() {
        Ok(_) => {
            *established = true;
            Ok(())
        }
        Err(err) if err.raw_os_error() == Some(libc::ENOTCONN) => Err(Error::WouldBlock),
        Err(err) => Err(Error::from_io(err)),
    }
}

/// Create a non-blocking TCP listener.
pub(crate) fn make_listener(local: &SocketAddr) -> Result<OsSocket> {
    let sock = OsSocket::new(
        Domain::for_address(*local),
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(Error::from_io)?;
    sock.set_nonblocking(true).map_err(Error::from_io)?;
    sock.set_reuse_address(true).map_err(Error::from_io)?;
    sock.bind(&SockAddr::from(*local)).map_err(Error::from_io)?;
    sock.listen(LISTEN_BACKLOG).map_err(Error::from_io)?;
    Ok(sock)
}

/// The kernel-assigned local address of a bound inet socket.
pub(crate) fn bound_addr(sock: &OsSocket) -> Result<SocketAddr> {
    sock.local_addr()
        .map_err(Error::from_io)?
        .as_socket()
        .ok_or_else(|| Error::InvalidArgument("not an inet socket".to_string()))
}

fn canonical(addr: &SocketAddr) -> String {
    xcm_addr::make_tcp(&xcm_addr::Host::Ip(addr.ip()), addr.port())
}

pub(crate) struct StreamConn {
    pub(crate) sock: OsSocket,
    pub(crate) reg: Registration,
    pub(crate) trigger: Trigger,
    pub(crate) established: bool,
    pub(crate) remote: String,
    pub(crate) fault: Option<ErrorKind>,
}

impl StreamConn {
    pub(crate) fn new(
        sock: OsSocket,
        epoll: Arc<Epoll>,
        established: bool,
        remote: String,
    ) -> Result<StreamConn> {
        let fd = sock.as_raw_fd();
        let trigger = Trigger::new(Arc::clone(&epoll)).map_err(Error::from_io)?;
        Ok(StreamConn {
            sock,
            reg: Registration::new(epoll, fd),
            trigger,
            established,
            remote,
            fault: None,
        })
    }

    pub(crate) fn sticky(&mut self, err: Error) -> Error {
        if !err.is_would_block() {
            self.fault = Some(err.kind());
        }
        err
    }

    pub(crate) fn check_fault(&self) -> Result<()> {
        match self.fault {
            Some(fault) => Err(Error::from(fault)),
            None => Ok(()),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.reg.clear();
        self.trigger.deactivate();
    }
}

struct Conn {
    io: StreamConn,
    txbuf: BytesMut,
    rxbuf: BytesMut,
    // Payload length of the (single) message still being flushed.
    tx_pending: Option<usize>,
    peer_closed: bool,
}

impl Conn {
    fn new(io: StreamConn) -> Conn {
        Conn {
            io,
            txbuf: BytesMut::new(),
            rxbuf: BytesMut::new(),
            tx_pending: None,
            peer_closed: false,
        }
    }

    /// Push buffered output to the kernel. Stops on would-block.
    fn flush(&mut self, core: &mut SocketCore) -> Result<()> {
        while !self.txbuf.is_empty() {
            match sys::send(self.io.sock.as_raw_fd(), &self.txbuf) {
                Ok(n) => {
                    let _ = self.txbuf.split_to(n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(self.io.sticky(Error::from_io(err))),
            }
        }

        if self.txbuf.is_empty() {
            if let Some(payload_len) = self.tx_pending.take() {
                core.counters_mut().count_to_lower(payload_len);
            }
        }

        Ok(())
    }

    /// Read from the kernel until a complete message has accumulated or
    /// the read would block.
    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while !frame::has_complete_msg(&self.rxbuf) {
            match sys::recv(self.io.sock.as_raw_fd(), &mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => self.rxbuf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(self.io.sticky(Error::from_io(err))),
            }
        }
        Ok(())
    }
}

struct Server {
    sock: OsSocket,
    reg: Registration,
    laddr: String,
}

enum State {
    Init { local: Option<SocketAddr> },
    Conn(Conn),
    Server(Server),
    Closed,
}

pub(crate) struct TcpSocket {
    state: State,
}

impl TcpSocket {
    fn conn(&mut self) -> Result<&mut Conn> {
        match &mut self.state {
            State::Conn(conn) => Ok(conn),
            _ => Err(Error::Permission),
        }
    }
}

impl TpSocket for TcpSocket {
    fn connect(&mut self, core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        let local = match &self.state {
            State::Init { local } => *local,
            _ => return Err(Error::Permission),
        };
        if core.sock_type() != SocketType::Conn {
            return Err(Error::Permission);
        }

        let (host, port) = xcm_addr::parse_tcp(remote_addr)?;
        let remote = resolve(&host, port)?;

        let (sock, established) = start_connect(&remote, local.as_ref())?;
        debug!(addr = remote_addr, established, "TCP connect initiated");

        let io = StreamConn::new(sock, core.epoll().clone(), established, canonical(&remote))?;
        self.state = State::Conn(Conn::new(io));
        Ok(())
    }

    fn server(&mut self, core: &mut SocketCore, local_addr: &str) -> Result<()> {
        if !matches!(self.state, State::Init { .. }) || core.sock_type() != SocketType::Server {
            return Err(Error::Permission);
        }

        let (host, port) = xcm_addr::parse_tcp(local_addr)?;
        let local = resolve(&host, port)?;
        let sock = make_listener(&local)?;
        let laddr = canonical(&bound_addr(&sock)?);

        debug!(addr = %laddr, "TCP server socket bound");

        let reg = Registration::new(core.epoll().clone(), sock.as_raw_fd());
        self.state = State::Server(Server { sock, reg, laddr });
        Ok(())
    }

    fn accept(&mut self, _core: &mut SocketCore, conn_epoll: &Arc<Epoll>) -> Result<Socket> {
        let server = match &mut self.state {
            State::Server(server) => server,
            _ => return Err(Error::Permission),
        };

        let (sock, peer) = server.sock.accept().map_err(Error::from_io)?;
        sock.set_nonblocking(true).map_err(Error::from_io)?;
        sock.set_nodelay(true).map_err(Error::from_io)?;
        apply_keepalive(&sock);

        let remote = peer
            .as_socket()
            .map(|addr| canonical(&addr))
            .unwrap_or_default();
        debug!(remote = %remote, "TCP connection accepted");

        let io = StreamConn::new(sock, conn_epoll.clone(), true, remote)?;

        let proto = transport::find_by_name(xcm_addr::PROTO_TCP)
            .ok_or_else(|| Error::ProtoNotAvailable(xcm_addr::PROTO_TCP.to_string()))?;

        Ok(Socket::from_parts(
            proto,
            SocketType::Conn,
            conn_epoll.clone(),
            Box::new(TcpSocket {
                state: State::Conn(Conn::new(io)),
            }),
        ))
    }

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        let conn = self.conn()?;

        conn.io.check_fault()?;
        if conn.peer_closed {
            return Err(conn.io.sticky(Error::BrokenPipe));
        }

        match try_establish(&conn.io.sock, &mut conn.io.established) {
            Ok(()) => {}
            Err(err) => return Err(conn.io.sticky(err)),
        }

        conn.flush(core)?;
        if !conn.txbuf.is_empty() {
            return Err(Error::WouldBlock);
        }

        frame::encode_msg(buf, &mut conn.txbuf)?;
        core.counters_mut().count_from_app(buf.len());
        conn.tx_pending = Some(buf.len());

        conn.flush(core)
    }

    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        let conn = self.conn()?;

        conn.io.check_fault()?;

        if !conn.peer_closed {
            match try_establish(&conn.io.sock, &mut conn.io.established) {
                Ok(()) => conn.fill()?,
                Err(err) => return Err(conn.io.sticky(err)),
            }
        }

        match frame::decode_msg(&mut conn.rxbuf) {
            Ok(Some(msg)) => {
                core.counters_mut().count_from_lower(msg.len());
                let len = msg.len().min(buf.len());
                buf[..len].copy_from_slice(&msg[..len]);
                core.counters_mut().count_to_app(len);
                Ok(len)
            }
            Ok(None) => {
                if conn.peer_closed {
                    Ok(0)
                } else {
                    Err(Error::WouldBlock)
                }
            }
            Err(err) => Err(conn.io.sticky(err)),
        }
    }

    fn update(&mut self, core: &mut SocketCore) {
        let condition = core.condition();
        match &mut self.state {
            State::Conn(conn) => {
                if conn.io.fault.is_some() {
                    // Keep the event fd hot so the user discovers the
                    // failure on its next op.
                    conn.io.reg.clear();
                    conn.io.trigger.arm();
                    return;
                }

                if !conn.io.established {
                    conn.io.reg.set(OUT);
                    conn.io.trigger.disarm();
                    return;
                }

                let mut events = 0;
                if condition.contains(Condition::READABLE) {
                    events |= IN;
                }
                if condition.contains(Condition::WRITABLE) || !conn.txbuf.is_empty() {
                    events |= OUT;
                }
                conn.io.reg.set(events);

                conn.io
                    .trigger
                    .set(frame::has_complete_msg(&conn.rxbuf) || conn.peer_closed);
            }
            State::Server(server) => {
                let events = if condition.contains(Condition::ACCEPTABLE) {
                    IN
                } else {
                    0
                };
                server.reg.set(events);
            }
            State::Init { .. } | State::Closed => {}
        }
    }

    fn finish(&mut self, core: &mut SocketCore) -> Result<()> {
        match &mut self.state {
            State::Conn(conn) => {
                conn.io.check_fault()?;
                match try_establish(&conn.io.sock, &mut conn.io.established) {
                    Ok(()) => {}
                    Err(err) => return Err(conn.io.sticky(err)),
                }
                conn.flush(core)?;
                if conn.txbuf.is_empty() {
                    Ok(())
                } else {
                    Err(Error::WouldBlock)
                }
            }
            _ => Ok(()),
        }
    }

    fn close(&mut self, _core: &mut SocketCore) {
        if let State::Conn(conn) = &mut self.state {
            conn.io.shutdown();
        }
        self.state = State::Closed;
    }

    fn cleanup(&mut self, core: &mut SocketCore) {
        self.close(core);
    }

    fn remote_addr(&self, _core: &SocketCore) -> Option<String> {
        match &self.state {
            State::Conn(conn) => Some(conn.io.remote.clone()),
            _ => None,
        }
    }

    fn local_addr(&mut self, _core: &mut SocketCore) -> Option<String> {
        match &self.state {
            State::Server(server) => Some(server.laddr.clone()),
            State::Conn(conn) => bound_addr(&conn.io.sock).ok().map(|a| canonical(&a)),
            State::Init { local } => local.map(|a| canonical(&a)),
            State::Closed => None,
        }
    }

    fn set_local_addr(&mut self, _core: &mut SocketCore, local_addr: &str) -> Result<()> {
        match &mut self.state {
            State::Init { local } => {
                let (host, port) = xcm_addr::parse_tcp(local_addr)?;
                *local = Some(resolve(&host, port)?);
                Ok(())
            }
            _ => Err(Error::Permission),
        }
    }

    fn max_msg(&self, _core: &SocketCore) -> usize {
        frame::MAX_MSG
    }

    fn attr_specs(&mut self, core: &mut SocketCore) -> Vec<AttrSpec> {
        stream_attr_specs(core)
    }

    fn attr_get(&mut self, core: &mut SocketCore, name: &str) -> Result<AttrValue> {
        match &self.state {
            State::Conn(conn) => stream_attr_get(core, &conn.io.sock, name),
            _ => Err(Error::NotFound(name.to_string())),
        }
    }
}

/// TCP-level attributes, shared with the TLS transport (whose lower layer
/// is a TCP socket).
pub(crate) fn stream_attr_specs(core: &mut SocketCore) -> Vec<AttrSpec> {
    if core.sock_type() != SocketType::Conn {
        return Vec::new();
    }
    vec![
        AttrSpec::new(ATTR_TCP_RTT, AttrType::Int64, AttrMode::ReadOnly),
        AttrSpec::new(ATTR_TCP_TOTAL_RETRANS, AttrType::Int64, AttrMode::ReadOnly),
    ]
}

pub(crate) fn stream_attr_get(
    core: &mut SocketCore,
    sock: &OsSocket,
    name: &str,
) -> Result<AttrValue> {
    if core.sock_type() != SocketType::Conn {
        return Err(Error::NotFound(name.to_string()));
    }

    match name {
        ATTR_TCP_RTT => {
            let info = sys::tcp_info(sock.as_raw_fd()).map_err(Error::from_io)?;
            Ok(AttrValue::Int64(info.rtt_us as i64))
        }
        ATTR_TCP_TOTAL_RETRANS => {
            let info = sys::tcp_info(sock.as_raw_fd()).map_err(Error::from_io)?;
            Ok(AttrValue::Int64(info.total_retrans as i64))
        }
        _ => Err(Error::NotFound(name.to_string())),
    }
}
