//! Framed TLS transport.
//!
//! The TCP state machine underneath a rustls session, with the same
//! length framing applied to the plaintext stream. Mutual authentication:
//! both ends present a certificate and verify the peer's chain against
//! the configured trust roots.
//!
//! Certificate material lives in the directory named by `XCM_TLS_CERT`
//! (default `/run/xcm/cert`) as `cert.pem`, `key.pem` and `tc.pem`, and
//! can be redirected per socket through the `tls.cert_file`,
//! `tls.key_file` and `tls.tc_file` attributes before connect/bind.
//! Loading is deferred to the first handshake, so a server socket binds
//! without touching the files.

use std::io::{BufReader, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use socket2::Socket as OsSocket;
use tracing::debug;

use crate::attr::{AttrMode, AttrSpec, AttrType, AttrValue};
use crate::error::{Error, Result};
use crate::event::{Epoll, Registration, IN, OUT};
use crate::socket::{Condition, Socket, SocketCore, SocketType};
use crate::tp::frame;
use crate::tp::tcp::{
    bound_addr, make_listener, resolve, start_connect, stream_attr_get, stream_attr_specs,
    try_establish, StreamConn,
};
use crate::transport::{self, TpSocket};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Environment variable naming the certificate directory.
pub const TLS_CERT_DIR_ENV: &str = "XCM_TLS_CERT";

/// Default certificate directory.
pub const DEFAULT_TLS_CERT_DIR: &str = "/run/xcm/cert";

pub(crate) const ATTR_TLS_CERT_FILE: &str = "tls.cert_file";
pub(crate) const ATTR_TLS_KEY_FILE: &str = "tls.key_file";
pub(crate) const ATTR_TLS_TC_FILE: &str = "tls.tc_file";

pub(crate) fn new(_sock_type: SocketType) -> Box<dyn TpSocket> {
    Box::new(TlsSocket {
        params: TlsParams::from_env(),
        state: State::Init { local: None },
    })
}

/// Where this socket reads its certificate, key and trust roots.
#[derive(Clone)]
struct TlsParams {
    cert_file: PathBuf,
    key_file: PathBuf,
    tc_file: PathBuf,
}

impl TlsParams {
    fn from_env() -> TlsParams {
        let dir = match std::env::var_os(TLS_CERT_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(DEFAULT_TLS_CERT_DIR),
        };
        TlsParams {
            cert_file: dir.join("cert.pem"),
            key_file: dir.join("key.pem"),
            tc_file: dir.join("tc.pem"),
        }
    }
}

fn proto_err(what: &str, err: impl std::fmt::Display) -> Error {
    Error::Protocol(format!("{what}: {err}"))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|err| proto_err("cannot open certificate", err))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|err| proto_err("cannot parse certificate", err))?;
    if certs.is_empty() {
        return Err(Error::Protocol(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|err| proto_err("cannot open key", err))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| proto_err("cannot parse key", err))?
        .ok_or_else(|| Error::Protocol(format!("no private key in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|err| proto_err("bad trust root", err))?;
    }
    Ok(roots)
}

fn client_config(params: &TlsParams) -> Result<Arc<ClientConfig>> {
    let roots = load_roots(&params.tc_file)?;
    let certs = load_certs(&params.cert_file)?;
    let key = load_key(&params.key_file)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|err| proto_err("client TLS configuration rejected", err))?;
    Ok(Arc::new(config))
}

fn server_config(params: &TlsParams) -> Result<Arc<ServerConfig>> {
    let roots = load_roots(&params.tc_file)?;
    let certs = load_certs(&params.cert_file)?;
    let key = load_key(&params.key_file)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| proto_err("client certificate verifier rejected", err))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|err| proto_err("server TLS configuration rejected", err))?;
    Ok(Arc::new(config))
}

fn server_name(host: &xcm_addr::Host) -> Result<ServerName<'static>> {
    let rendered = match host {
        xcm_addr::Host::Name(name) => name.clone(),
        xcm_addr::Host::Ip(ip) => ip.to_string(),
        _ => {
            return Err(Error::InvalidArgument(
                "wildcard host in remote address".to_string(),
            ))
        }
    };
    ServerName::try_from(rendered.as_str())
        .map(|name| name.to_owned())
        .map_err(|err| proto_err("bad server name", err))
}

fn canonical(addr: &SocketAddr) -> String {
    xcm_addr::make_tls(&xcm_addr::Host::Ip(addr.ip()), addr.port())
}

struct Conn {
    io: StreamConn,
    session: Connection,
    rxbuf: BytesMut,
    tx_pending: Option<usize>,
    peer_closed: bool,
}

impl Conn {
    fn new(io: StreamConn, session: Connection) -> Conn {
        Conn {
            io,
            session,
            rxbuf: BytesMut::new(),
            tx_pending: None,
            peer_closed: false,
        }
    }

    /// Exchange TLS records with the kernel socket until nothing further
    /// can move without blocking.
    fn pump(&mut self) -> Result<()> {
        loop {
            let mut progressed = false;

            while self.session.wants_write() {
                let mut sock = &self.io.sock;
                match self.session.write_tls(&mut sock as &mut dyn Write) {
                    Ok(0) => {
                        self.peer_closed = true;
                        break;
                    }
                    Ok(_) => progressed = true,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(self.io.sticky(Error::from_io(err))),
                }
            }

            if self.session.wants_read() && !self.peer_closed {
                let mut sock = &self.io.sock;
                match self.session.read_tls(&mut sock as &mut dyn Read) {
                    Ok(0) => {
                        self.peer_closed = true;
                    }
                    Ok(_) => {
                        if let Err(err) = self.session.process_new_packets() {
                            return Err(self.io.sticky(proto_err("TLS failure", err)));
                        }
                        progressed = true;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(self.io.sticky(Error::from_io(err))),
                }
            }

            if !progressed {
                return Ok(());
            }
        }
    }

    /// Move decrypted bytes from the session into the plaintext buffer.
    fn drain_plaintext(&mut self) {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.session.reader().read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => self.rxbuf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Peer went away without a close_notify.
                    self.peer_closed = true;
                    break;
                }
                Err(err) => {
                    let _ = self.io.sticky(Error::from_io(err));
                    break;
                }
            }
        }
    }

    /// Credit the to-lower counters once the pending message has fully
    /// left for the kernel.
    fn settle_tx(&mut self, core: &mut SocketCore) {
        if !self.session.wants_write() {
            if let Some(payload_len) = self.tx_pending.take() {
                core.counters_mut().count_to_lower(payload_len);
            }
        }
    }

    fn drive(&mut self, core: &mut SocketCore) -> Result<()> {
        try_establish(&self.io.sock, &mut self.io.established)
            .map_err(|err| self.io.sticky(err))?;
        self.pump()?;
        self.settle_tx(core);
        Ok(())
    }
}

struct Server {
    sock: OsSocket,
    reg: Registration,
    laddr: String,
    config: Option<Arc<ServerConfig>>,
}

enum State {
    Init { local: Option<SocketAddr> },
    Conn(Conn),
    Server(Server),
    Closed,
}

pub(crate) struct TlsSocket {
    params: TlsParams,
    state: State,
}

impl TlsSocket {
    fn conn(&mut self) -> Result<&mut Conn> {
        match &mut self.state {
            State::Conn(conn) => Ok(conn),
            _ => Err(Error::Permission),
        }
    }
}

impl TpSocket for TlsSocket {
    fn connect(&mut self, core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        let local = match &self.state {
            State::Init { local } => *local,
            _ => return Err(Error::Permission),
        };
        if core.sock_type() != SocketType::Conn {
            return Err(Error::Permission);
        }

        let (host, port) = xcm_addr::parse_tls(remote_addr)?;
        let name = server_name(&host)?;
        let remote = resolve(&host, port)?;
        let config = client_config(&self.params)?;

        let (sock, established) = start_connect(&remote, local.as_ref())?;
        debug!(addr = remote_addr, established, "TLS connect initiated");

        let session = ClientConnection::new(config, name)
            .map_err(|err| proto_err("TLS client session setup failed", err))?;

        let io = StreamConn::new(sock, core.epoll().clone(), established, canonical(&remote))?;
        self.state = State::Conn(Conn::new(io, Connection::from(session)));
        Ok(())
    }

    fn server(&mut self, core: &mut SocketCore, local_addr: &str) -> Result<()> {
        if !matches!(self.state, State::Init { .. }) || core.sock_type() != SocketType::Server {
            return Err(Error::Permission);
        }

        let (host, port) = xcm_addr::parse_tls(local_addr)?;
        let local = resolve(&host, port)?;
        let sock = make_listener(&local)?;
        let laddr = canonical(&bound_addr(&sock)?);

        debug!(addr = %laddr, "TLS server socket bound");

        let reg = Registration::new(core.epoll().clone(), sock.as_raw_fd());
        self.state = State::Server(Server {
            sock,
            reg,
            laddr,
            config: None,
        });
        Ok(())
    }

    fn accept(&mut self, _core: &mut SocketCore, conn_epoll: &Arc<Epoll>) -> Result<Socket> {
        let params = self.params.clone();
        let server = match &mut self.state {
            State::Server(server) => server,
            _ => return Err(Error::Permission),
        };

        let (sock, peer) = server.sock.accept().map_err(Error::from_io)?;
        sock.set_nonblocking(true).map_err(Error::from_io)?;
        sock.set_nodelay(true).map_err(Error::from_io)?;

        let config = match &server.config {
            Some(config) => Arc::clone(config),
            None => {
                let config = server_config(&params)?;
                server.config = Some(Arc::clone(&config));
                config
            }
        };

        let session = ServerConnection::new(config)
            .map_err(|err| proto_err("TLS server session setup failed", err))?;

        let remote = peer
            .as_socket()
            .map(|addr| canonical(&addr))
            .unwrap_or_default();
        debug!(remote = %remote, "TLS connection accepted");

        let io = StreamConn::new(sock, conn_epoll.clone(), true, remote)?;

        let proto = transport::find_by_name(xcm_addr::PROTO_TLS)
            .ok_or_else(|| Error::ProtoNotAvailable(xcm_addr::PROTO_TLS.to_string()))?;

        Ok(Socket::from_parts(
            proto,
            SocketType::Conn,
            conn_epoll.clone(),
            Box::new(TlsSocket {
                params,
                state: State::Conn(Conn::new(io, Connection::from(session))),
            }),
        ))
    }

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        let conn = self.conn()?;

        conn.io.check_fault()?;
        if conn.peer_closed {
            return Err(conn.io.sticky(Error::BrokenPipe));
        }

        conn.drive(core)?;

        if conn.session.is_handshaking() || conn.session.wants_write() {
            return Err(Error::WouldBlock);
        }

        let mut framed = BytesMut::new();
        frame::encode_msg(buf, &mut framed)?;

        conn.session
            .writer()
            .write_all(&framed)
            .map_err(|err| conn.io.sticky(Error::from_io(err)))?;
        core.counters_mut().count_from_app(buf.len());
        conn.tx_pending = Some(buf.len());

        conn.pump()?;
        conn.settle_tx(core);
        Ok(())
    }

    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        let conn = self.conn()?;

        conn.io.check_fault()?;

        if !conn.peer_closed {
            conn.drive(core)?;
        }
        conn.drain_plaintext();
        conn.io.check_fault()?;

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
                if condition.contains(Condition::READABLE)
                    || conn.session.is_handshaking() && conn.session.wants_read()
                {
                    events |= IN;
                }
                if condition.contains(Condition::WRITABLE) || conn.session.wants_write() {
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
                conn.drive(core)?;
                if conn.session.is_handshaking() || conn.session.wants_write() {
                    Err(Error::WouldBlock)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    fn close(&mut self, _core: &mut SocketCore) {
        if let State::Conn(conn) = &mut self.state {
            // Best-effort close_notify; the peer may already be gone.
            conn.session.send_close_notify();
            let _ = conn.pump();
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
                let (host, port) = xcm_addr::parse_tls(local_addr)?;
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
        let mut specs = vec![
            AttrSpec::new(ATTR_TLS_CERT_FILE, AttrType::Str, AttrMode::ReadWrite),
            AttrSpec::new(ATTR_TLS_KEY_FILE, AttrType::Str, AttrMode::ReadWrite),
            AttrSpec::new(ATTR_TLS_TC_FILE, AttrType::Str, AttrMode::ReadWrite),
        ];
        specs.extend(stream_attr_specs(core));
        specs
    }

    fn attr_get(&mut self, core: &mut SocketCore, name: &str) -> Result<AttrValue> {
        let path = match name {
            ATTR_TLS_CERT_FILE => &self.params.cert_file,
            ATTR_TLS_KEY_FILE => &self.params.key_file,
            ATTR_TLS_TC_FILE => &self.params.tc_file,
            _ => {
                return match &self.state {
                    State::Conn(conn) => stream_attr_get(core, &conn.io.sock, name),
                    _ => Err(Error::NotFound(name.to_string())),
                }
            }
        };
        Ok(AttrValue::Str(path.to_string_lossy().into_owned()))
    }

    fn attr_set(&mut self, _core: &mut SocketCore, name: &str, value: &AttrValue) -> Result<()> {
        let target = match name {
            ATTR_TLS_CERT_FILE => &mut self.params.cert_file,
            ATTR_TLS_KEY_FILE => &mut self.params.key_file,
            ATTR_TLS_TC_FILE => &mut self.params.tc_file,
            _ => return Err(Error::NotFound(name.to_string())),
        };

        // Certificate paths only matter before the first handshake.
        if !matches!(self.state, State::Init { .. }) {
            return Err(Error::Permission);
        }

        match value {
            AttrValue::Str(path) => {
                *target = PathBuf::from(path);
                Ok(())
            }
            _ => Err(Error::InvalidArgument(format!("{name} takes a string value"))),
        }
    }
}
