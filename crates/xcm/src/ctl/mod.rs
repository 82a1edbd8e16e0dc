//! The per-socket control channel.
//!
//! Every user socket may carry a local IPC listener through which sibling
//! processes enumerate and read its attributes. The listener lives in a
//! shared control directory under a `<pid>-<sock_id>` name, registers on
//! the socket's own event fd, and is serviced inline from user API calls,
//! throttled so it cannot inflate user-operation latency. All failures in
//! here are absorbed and logged; they never reach the user.

pub mod client;
pub mod proto;

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use socket2::{SockAddr, Socket as OsSocket};
use tracing::{debug, warn};

use crate::attr::AttrValue;
use crate::ctl::proto::{CtlMsg, WireAttr, CTL_ATTR_VALUE_MAX, CTL_MAX_ATTRS, MSG_SIZE};
use crate::error::Result;
use crate::event::{Registration, IN, OUT};
use crate::socket::{Socket, SocketCore};
use crate::sys;

/// Default control directory; overridable via the `XCM_CTL` environment
/// variable.
pub const DEFAULT_CTL_DIR: &str = "/run/xcm/ctl";

/// Environment variable naming the control directory.
pub const CTL_DIR_ENV: &str = "XCM_CTL";

const MAX_CLIENTS: usize = 2;

const DEFAULT_CALLS_PER_ACCEPT: u64 = 64;
const DEFAULT_CALLS_PER_SEND_RECEIVE: u64 = 8;

// Socket calls on kernel SCTP sockets are costly enough that the control
// interface turns sluggish unless it is serviced more often.
const SCTP_CALLS_PER_ACCEPT: u64 = 8;
const SCTP_CALLS_PER_SEND_RECEIVE: u64 = 2;

/// The control directory in effect for this process.
pub fn control_dir() -> PathBuf {
    match std::env::var_os(CTL_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(DEFAULT_CTL_DIR),
    }
}

/// The listener path for a socket in a control directory.
pub fn socket_ctl_path(dir: &Path, pid: u32, sock_id: i64) -> PathBuf {
    dir.join(format!("{pid}-{sock_id}"))
}

struct Client {
    sock: OsSocket,
    reg: Registration,
    response_pending: bool,
    response: Vec<u8>,
}

/// Control-channel state for one socket.
pub(crate) struct Ctl {
    path: PathBuf,
    listener: OsSocket,
    listener_reg: Registration,
    clients: Vec<Client>,
    recv_buf: Vec<u8>,
    calls_since_process: u64,
}

impl Ctl {
    /// Bind the control listener for a socket. Returns `None` (logged) if
    /// the control directory is missing or any socket call fails; the
    /// control channel is then simply disabled for this socket.
    pub(crate) fn create(core: &SocketCore) -> Option<Ctl> {
        let dir = control_dir();

        match std::fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                debug!(dir = %dir.display(), "control path is not a directory");
                return None;
            }
            Err(err) => {
                debug!(dir = %dir.display(), "control directory unavailable: {err}");
                return None;
            }
        }

        let path = socket_ctl_path(&dir, std::process::id(), core.sock_id());
        let _ = std::fs::remove_file(&path);

        let listener = match Ctl::bind_listener(&path) {
            Ok(listener) => listener,
            Err(err) => {
                debug!(path = %path.display(), "control listener setup failed: {err}");
                return None;
            }
        };

        let mut listener_reg = Registration::new(core.epoll().clone(), listener.as_raw_fd());
        listener_reg.set(IN);

        debug!(path = %path.display(), sock_id = core.sock_id(), "control listener created");

        Some(Ctl {
            path,
            listener,
            listener_reg,
            clients: Vec::with_capacity(MAX_CLIENTS),
            recv_buf: vec![0u8; MSG_SIZE],
            calls_since_process: 0,
        })
    }

    fn bind_listener(path: &Path) -> std::io::Result<OsSocket> {
        let listener = sys::seqpacket_socket()?;
        listener.bind(&SockAddr::unix(path)?)?;
        listener.listen(MAX_CLIENTS as i32)?;
        Ok(listener)
    }

    fn min_calls(&self, sock: &Socket) -> u64 {
        let active = !self.clients.is_empty();
        if sock.transport() == "sctp" {
            if active {
                SCTP_CALLS_PER_SEND_RECEIVE
            } else {
                SCTP_CALLS_PER_ACCEPT
            }
        } else if active {
            DEFAULT_CALLS_PER_SEND_RECEIVE
        } else {
            DEFAULT_CALLS_PER_ACCEPT
        }
    }

    /// One throttled service pass: step every client's state machine once,
    /// then accept at most one new client if there is room.
    pub(crate) fn process(&mut self, sock: &mut Socket) {
        self.calls_since_process += 1;
        if self.calls_since_process < self.min_calls(sock) {
            return;
        }
        self.calls_since_process = 0;

        'pass: loop {
            for idx in 0..self.clients.len() {
                if self.step_client(idx, sock).is_err() {
                    self.remove_client(idx);
                    continue 'pass;
                }
            }
            break;
        }

        if self.clients.len() < MAX_CLIENTS {
            self.accept_client(sock);
        }
    }

    /// Advance one client. `Err` means the slot is dead.
    fn step_client(&mut self, idx: usize, sock: &mut Socket) -> std::result::Result<(), ()> {
        let client = &mut self.clients[idx];

        if client.response_pending {
            match sys::send(client.sock.as_raw_fd(), &client.response) {
                Ok(n) if n == client.response.len() => {
                    client.response_pending = false;
                    client.reg.set(IN);
                    Ok(())
                }
                Ok(_) => {
                    debug!("short write on control client");
                    Err(())
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => {
                    debug!("control client send failed: {err}");
                    Err(())
                }
            }
        } else {
            match sys::recv(client.sock.as_raw_fd(), &mut self.recv_buf) {
                Ok(n) if n == MSG_SIZE => {
                    let request = match proto::decode(&self.recv_buf) {
                        Ok(request) => request,
                        Err(err) => {
                            debug!("malformed control request: {err}");
                            return Err(());
                        }
                    };
                    let response = handle_request(sock, &request).ok_or(())?;
                    match proto::encode(&response) {
                        Ok(wire) => {
                            client.response = wire;
                            client.response_pending = true;
                            client.reg.set(OUT);
                            Ok(())
                        }
                        Err(err) => {
                            warn!("control response encoding failed: {err}");
                            Err(())
                        }
                    }
                }
                Ok(0) => Err(()),
                Ok(_) => {
                    debug!("malformed control request record");
                    Err(())
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => {
                    debug!("control client recv failed: {err}");
                    Err(())
                }
            }
        }
    }

    fn remove_client(&mut self, idx: usize) {
        let was_full = self.clients.len() == MAX_CLIENTS;

        let mut client = self.clients.swap_remove(idx);
        client.reg.clear();

        if was_full {
            self.listener_reg.set(IN);
        }

        debug!(clients = self.clients.len(), "control client removed");
    }

    fn accept_client(&mut self, sock: &Socket) {
        let (client_sock, _addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    debug!("control accept failed: {err}");
                }
                return;
            }
        };

        if let Err(err) = client_sock.set_nonblocking(true) {
            debug!("failed to make control client non-blocking: {err}");
            return;
        }

        let mut reg = Registration::new(sock_epoll(sock), client_sock.as_raw_fd());
        reg.set(IN);

        self.clients.push(Client {
            sock: client_sock,
            reg,
            response_pending: false,
            response: Vec::with_capacity(MSG_SIZE),
        });

        if self.clients.len() == MAX_CLIENTS {
            self.listener_reg.clear();
        }

        debug!(clients = self.clients.len(), "control client accepted");
    }

    /// Tear down the control channel. The owner unlinks the listener path;
    /// a post-fork non-owner leaves the filesystem artifact to the owning
    /// process.
    pub(crate) fn destroy(mut self, owner: bool) {
        while !self.clients.is_empty() {
            self.remove_client(0);
        }
        self.listener_reg.clear();

        if owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn sock_epoll(sock: &Socket) -> std::sync::Arc<crate::event::Epoll> {
    sock.epoll_handle()
}

/// Compute the response for one request. `None` kills the client slot.
fn handle_request(sock: &mut Socket, request: &CtlMsg) -> Option<CtlMsg> {
    match request {
        CtlMsg::GetAttrReq { name } => {
            let mut value_buf = [0u8; CTL_ATTR_VALUE_MAX];
            match sock.attr_into(name, &mut value_buf) {
                Ok((value_type, len)) => Some(CtlMsg::GetAttrCfm {
                    attr: WireAttr {
                        name: name.clone(),
                        value_type,
                        value: value_buf[..len].to_vec(),
                    },
                }),
                Err(err) => Some(CtlMsg::GetAttrRej {
                    errno: err.to_errno(),
                }),
            }
        }
        CtlMsg::GetAllAttrReq => {
            let mut attrs: Vec<WireAttr> = Vec::new();
            sock.visit_attrs(|name, value| {
                if attrs.len() >= CTL_MAX_ATTRS {
                    return;
                }
                let mut value_buf = [0u8; CTL_ATTR_VALUE_MAX];
                match value.encode_into(&mut value_buf) {
                    Ok(len) => attrs.push(WireAttr {
                        name: name.to_string(),
                        value_type: value.attr_type(),
                        value: value_buf[..len].to_vec(),
                    }),
                    Err(_) => {
                        debug!(name, "attribute value does not fit on the wire");
                    }
                }
            });
            Some(CtlMsg::GetAllAttrCfm { attrs })
        }
        // Clients must not send confirmation records.
        _ => {
            debug!("unexpected control record from client");
            None
        }
    }
}

/// Query helpers shared by [`client`] and the introspection CLI.
pub fn decode_attr(attr: &WireAttr) -> Result<(String, AttrValue)> {
    let value = AttrValue::decode(attr.value_type, &attr.value)?;
    Ok((attr.name.clone(), value))
}
