//! Local IPC transport over `SOCK_SEQPACKET` Unix sockets.
//!
//! Registered twice: `ux` uses the Linux abstract namespace, `uxf` a
//! filesystem path. Seqpacket sockets preserve message boundaries, so no
//! framing is needed, and a non-blocking connect either completes
//! immediately or fails with connection-refused, the property the UTLS
//! transport builds its local-or-not probe on.

use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use socket2::{SockAddr, Socket as OsSocket};
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};
use crate::event::{Epoll, Registration, IN, OUT};
use crate::socket::{Condition, Socket, SocketCore, SocketType};
use crate::sys;
use crate::transport::{self, TpSocket};

const UX_MAX_MSG: usize = 65535;

const LISTEN_BACKLOG: i32 = 32;

pub(crate) fn new_abstract(_sock_type: SocketType) -> Box<dyn TpSocket> {
    Box::new(UxSocket {
        flavor: Flavor::Abstract,
        state: State::Init,
    })
}

pub(crate) fn new_path(_sock_type: SocketType) -> Box<dyn TpSocket> {
    Box::new(UxSocket {
        flavor: Flavor::Path,
        state: State::Init,
    })
}

#[derive(Clone, Copy)]
enum Flavor {
    Abstract,
    Path,
}

impl Flavor {
    fn proto(self) -> &'static str {
        match self {
            Flavor::Abstract => xcm_addr::PROTO_UX,
            Flavor::Path => xcm_addr::PROTO_UXF,
        }
    }

    fn parse(self, addr: &str) -> Result<String> {
        let name = match self {
            Flavor::Abstract => xcm_addr::parse_ux(addr)?,
            Flavor::Path => xcm_addr::parse_uxf(addr)?,
        };
        Ok(name)
    }

    fn format(self, name: &str) -> String {
        format!("{}:{name}", self.proto())
    }

    fn sockaddr(self, name: &str) -> io::Result<SockAddr> {
        match self {
            Flavor::Abstract => sys::abstract_sockaddr(name),
            Flavor::Path => SockAddr::unix(name),
        }
    }
}

struct ConnState {
    sock: OsSocket,
    reg: Registration,
    remote: Option<String>,
    rxbuf: Vec<u8>,
    peer_closed: bool,
    fault: Option<ErrorKind>,
}

struct ServerState {
    sock: OsSocket,
    reg: Registration,
    name: String,
    unlink_path: Option<PathBuf>,
}

enum State {
    Init,
    Conn(ConnState),
    Server(ServerState),
    Closed,
}

pub(crate) struct UxSocket {
    flavor: Flavor,
    state: State,
}

impl UxSocket {
    fn conn(&mut self) -> Result<&mut ConnState> {
        match &mut self.state {
            State::Conn(conn) => Ok(conn),
            _ => Err(Error::Permission),
        }
    }

    fn new_conn_state(
        sock: OsSocket,
        epoll: Arc<Epoll>,
        remote: Option<String>,
    ) -> ConnState {
        let reg = Registration::new(epoll, sock.as_raw_fd());
        ConnState {
            sock,
            reg,
            remote,
            rxbuf: vec![0u8; UX_MAX_MSG],
            peer_closed: false,
            fault: None,
        }
    }
}

impl TpSocket for UxSocket {
    fn connect(&mut self, core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        if !matches!(self.state, State::Init) || core.sock_type() != SocketType::Conn {
            return Err(Error::Permission);
        }

        let name = self.flavor.parse(remote_addr)?;
        let sock = sys::seqpacket_socket().map_err(Error::from_io)?;
        let addr = self.flavor.sockaddr(&name).map_err(Error::from_io)?;

        sock.connect(&addr).map_err(Error::from_io)?;

        debug!(addr = remote_addr, "local IPC connection established");

        let remote = Some(self.flavor.format(&name));
        self.state = State::Conn(UxSocket::new_conn_state(
            sock,
            core.epoll().clone(),
            remote,
        ));
        Ok(())
    }

    fn server(&mut self, core: &mut SocketCore, local_addr: &str) -> Result<()> {
        if !matches!(self.state, State::Init) || core.sock_type() != SocketType::Server {
            return Err(Error::Permission);
        }

        let name = self.flavor.parse(local_addr)?;

        let mut unlink_path = None;
        if let Flavor::Path = self.flavor {
            let path = PathBuf::from(&name);
            // Reclaim a stale socket file, but never remove anything else.
            if let Ok(meta) = std::fs::symlink_metadata(&path) {
                use std::os::unix::fs::FileTypeExt;
                if meta.file_type().is_socket() {
                    debug!(path = %path.display(), "removing stale socket file");
                    std::fs::remove_file(&path).map_err(Error::from_io)?;
                } else {
                    return Err(Error::InvalidArgument(format!(
                        "existing path is not a socket: {name}"
                    )));
                }
            }
            unlink_path = Some(path);
        }

        let sock = sys::seqpacket_socket().map_err(Error::from_io)?;
        let addr = self.flavor.sockaddr(&name).map_err(Error::from_io)?;
        sock.bind(&addr).map_err(Error::from_io)?;
        sock.listen(LISTEN_BACKLOG).map_err(Error::from_io)?;

        debug!(addr = local_addr, "local IPC server socket bound");

        let reg = Registration::new(core.epoll().clone(), sock.as_raw_fd());
        self.state = State::Server(ServerState {
            sock,
            reg,
            name,
            unlink_path,
        });
        Ok(())
    }

    fn accept(&mut self, _core: &mut SocketCore, conn_epoll: &Arc<Epoll>) -> Result<Socket> {
        let server = match &mut self.state {
            State::Server(server) => server,
            _ => return Err(Error::Permission),
        };

        let (sock, _addr) = server.sock.accept().map_err(Error::from_io)?;
        sock.set_nonblocking(true).map_err(Error::from_io)?;

        debug!("local IPC connection accepted");

        let proto = transport::find_by_name(self.flavor.proto())
            .ok_or_else(|| Error::ProtoNotAvailable(self.flavor.proto().to_string()))?;

        let conn = UxSocket {
            flavor: self.flavor,
            state: State::Conn(UxSocket::new_conn_state(sock, conn_epoll.clone(), None)),
        };

        Ok(Socket::from_parts(
            proto,
            SocketType::Conn,
            conn_epoll.clone(),
            Box::new(conn),
        ))
    }

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        let conn = self.conn()?;

        if let Some(fault) = conn.fault {
            return Err(Error::from(fault));
        }
        if conn.peer_closed {
            return Err(Error::BrokenPipe);
        }
        if buf.is_empty() {
            return Err(Error::InvalidArgument(
                "zero-length messages are not allowed".to_string(),
            ));
        }
        if buf.len() > UX_MAX_MSG {
            return Err(Error::MessageTooLarge {
                size: buf.len(),
                max: UX_MAX_MSG,
            });
        }

        match sys::send(conn.sock.as_raw_fd(), buf) {
            Ok(_) => {
                // Seqpacket sends are all-or-nothing; the message reaches
                // the kernel in the same call it leaves the app.
                core.counters_mut().count_from_app(buf.len());
                core.counters_mut().count_to_lower(buf.len());
                Ok(())
            }
            Err(err) => {
                let err = Error::from_io(err);
                if !err.is_would_block() {
                    conn.fault = Some(err.kind());
                }
                Err(err)
            }
        }
    }

    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        let conn = self.conn()?;

        if let Some(fault) = conn.fault {
            return Err(Error::from(fault));
        }
        if conn.peer_closed {
            return Ok(0);
        }

        match sys::recv(conn.sock.as_raw_fd(), &mut conn.rxbuf) {
            Ok(0) => {
                conn.peer_closed = true;
                Ok(0)
            }
            Ok(n) => {
                core.counters_mut().count_from_lower(n);
                core.counters_mut().count_to_app(n);
                let len = n.min(buf.len());
                buf[..len].copy_from_slice(&conn.rxbuf[..len]);
                Ok(len)
            }
            Err(err) => {
                let err = Error::from_io(err);
                if !err.is_would_block() {
                    conn.fault = Some(err.kind());
                }
                Err(err)
            }
        }
    }

    fn update(&mut self, core: &mut SocketCore) {
        let condition = core.condition();
        match &mut self.state {
            State::Conn(conn) => {
                let mut events = 0;
                if condition.contains(Condition::READABLE) {
                    events |= IN;
                }
                if condition.contains(Condition::WRITABLE) {
                    events |= OUT;
                }
                conn.reg.set(events);
            }
            State::Server(server) => {
                let events = if condition.contains(Condition::ACCEPTABLE) {
                    IN
                } else {
                    0
                };
                server.reg.set(events);
            }
            State::Init | State::Closed => {}
        }
    }

    fn finish(&mut self, _core: &mut SocketCore) -> Result<()> {
        // Local IPC connections establish synchronously; there is never
        // outstanding background work.
        match &self.state {
            State::Conn(conn) => match conn.fault {
                Some(fault) => Err(Error::from(fault)),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn close(&mut self, _core: &mut SocketCore) {
        if let State::Server(server) = &mut self.state {
            if let Some(path) = server.unlink_path.take() {
                let _ = std::fs::remove_file(&path);
            }
        }
        self.state = State::Closed;
    }

    fn cleanup(&mut self, _core: &mut SocketCore) {
        // Leave the socket file to the owning process.
        self.state = State::Closed;
    }

    fn remote_addr(&self, _core: &SocketCore) -> Option<String> {
        match &self.state {
            State::Conn(conn) => conn.remote.clone(),
            _ => None,
        }
    }

    fn local_addr(&mut self, _core: &mut SocketCore) -> Option<String> {
        match &self.state {
            State::Server(server) => Some(self.flavor.format(&server.name)),
            State::Conn(conn) => {
                let name = sys::unix_sockname(conn.sock.as_raw_fd()).ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(self.flavor.format(&name))
            }
            _ => None,
        }
    }

    fn max_msg(&self, _core: &SocketCore) -> usize {
        UX_MAX_MSG
    }
}
