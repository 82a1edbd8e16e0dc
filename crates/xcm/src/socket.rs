//! The generic per-socket record and the operation dispatch that routes
//! every user call through the owning transport.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::attr::{self, AttrSpec, AttrValue};
use crate::ctl::Ctl;
use crate::error::{Error, Result};
use crate::event::Epoll;
use crate::transport::{Proto, TpSocket};

/// The two socket roles. Only connection sockets carry messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Conn,
    Server,
}

impl SocketType {
    pub fn name(self) -> &'static str {
        match self {
            SocketType::Conn => "connection",
            SocketType::Server => "server",
        }
    }
}

/// The user's declared interest: which operations it intends to attempt
/// next. A pure hint; the socket may signal readiness for background work
/// regardless. Zero is legal and means "background progress only".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Condition(u32);

impl Condition {
    pub const NONE: Condition = Condition(0);
    pub const READABLE: Condition = Condition(1);
    pub const WRITABLE: Condition = Condition(2);
    pub const ACCEPTABLE: Condition = Condition(4);

    pub fn contains(self, other: Condition) -> bool {
        self.0 & other.0 == other.0
    }

    fn valid_for(self, sock_type: SocketType) -> bool {
        let allowed = match sock_type {
            SocketType::Conn => Condition::READABLE.0 | Condition::WRITABLE.0,
            SocketType::Server => Condition::ACCEPTABLE.0,
        };
        self.0 & !allowed == 0
    }
}

impl std::ops::BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Condition) -> Condition {
        Condition(self.0 | rhs.0)
    }
}

/// Message and byte counters for a connection socket. Monotone.
#[derive(Debug, Clone, Default)]
pub struct ConnCounters {
    pub to_app_msgs: u64,
    pub to_app_bytes: u64,
    pub from_app_msgs: u64,
    pub from_app_bytes: u64,
    pub to_lower_msgs: u64,
    pub to_lower_bytes: u64,
    pub from_lower_msgs: u64,
    pub from_lower_bytes: u64,
}

impl ConnCounters {
    pub(crate) fn count_to_app(&mut self, bytes: usize) {
        self.to_app_msgs += 1;
        self.to_app_bytes += bytes as u64;
    }

    pub(crate) fn count_from_app(&mut self, bytes: usize) {
        self.from_app_msgs += 1;
        self.from_app_bytes += bytes as u64;
    }

    pub(crate) fn count_to_lower(&mut self, bytes: usize) {
        self.to_lower_msgs += 1;
        self.to_lower_bytes += bytes as u64;
    }

    pub(crate) fn count_from_lower(&mut self, bytes: usize) {
        self.from_lower_msgs += 1;
        self.from_lower_bytes += bytes as u64;
    }
}

static NEXT_SOCK_ID: AtomicI64 = AtomicI64::new(0);

fn next_sock_id() -> i64 {
    NEXT_SOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// The transport-independent part of a socket: identity, event fd,
/// blocking flag, desired condition, counters and control handle.
pub struct SocketCore {
    pub(crate) sock_id: i64,
    pub(crate) sock_type: SocketType,
    pub(crate) proto: &'static Proto,
    pub(crate) epoll: Arc<Epoll>,
    pub(crate) blocking: bool,
    pub(crate) condition: Condition,
    pub(crate) cnt: ConnCounters,
    pub(crate) ctl: Option<Ctl>,
}

impl SocketCore {
    pub fn sock_id(&self) -> i64 {
        self.sock_id
    }

    pub fn sock_type(&self) -> SocketType {
        self.sock_type
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// The socket's event-fd instance, shared with any sub-sockets.
    pub fn epoll(&self) -> &Arc<Epoll> {
        &self.epoll
    }

    pub fn counters_mut(&mut self) -> &mut ConnCounters {
        &mut self.cnt
    }
}

/// An XCM socket: one [`SocketCore`] plus the owning transport's private
/// state behind the transport ops trait.
pub struct Socket {
    core: SocketCore,
    imp: Box<dyn TpSocket>,
    closed: bool,
}

impl Socket {
    pub(crate) fn create(
        proto: &'static Proto,
        sock_type: SocketType,
        epoll: Arc<Epoll>,
        blocking: bool,
    ) -> Result<Socket> {
        let imp = (proto.factory)(sock_type);
        let mut sock = Socket::assemble(proto, sock_type, epoll, blocking, imp);
        let (core, imp) = sock.split();
        if let Err(err) = imp.init(core) {
            // Failed init leaves no transport resources behind; skip the
            // close path.
            sock.closed = true;
            return Err(err);
        }
        Ok(sock)
    }

    /// Build a socket around pre-constructed transport state. Used by
    /// transports to wrap an accepted connection; `init` is not invoked.
    pub(crate) fn from_parts(
        proto: &'static Proto,
        sock_type: SocketType,
        epoll: Arc<Epoll>,
        imp: Box<dyn TpSocket>,
    ) -> Socket {
        Socket::assemble(proto, sock_type, epoll, false, imp)
    }

    fn assemble(
        proto: &'static Proto,
        sock_type: SocketType,
        epoll: Arc<Epoll>,
        blocking: bool,
        imp: Box<dyn TpSocket>,
    ) -> Socket {
        Socket {
            core: SocketCore {
                sock_id: next_sock_id(),
                sock_type,
                proto,
                epoll,
                blocking,
                condition: Condition::NONE,
                cnt: ConnCounters::default(),
                ctl: None,
            },
            imp,
            closed: false,
        }
    }

    fn split(&mut self) -> (&mut SocketCore, &mut dyn TpSocket) {
        (&mut self.core, self.imp.as_mut())
    }

    /// Service the control channel for this socket, throttled by its tick
    /// counter. Runs on every user operation except `update` and the pure
    /// getters.
    fn tick_ctl(&mut self) {
        if let Some(mut ctl) = self.core.ctl.take() {
            ctl.process(self);
            self.core.ctl = Some(ctl);
        }
    }

    /// Block until the event fd signals readiness.
    pub(crate) fn wait_ready(&self) -> Result<()> {
        self.core.epoll.wait(-1).map_err(Error::from_io)?;
        Ok(())
    }

    /// Run a non-blocking op in a retry loop with a temporary desired
    /// condition, waiting on the event fd between attempts.
    fn blocking_op<T>(
        &mut self,
        wanted: Condition,
        mut op: impl FnMut(&mut Socket) -> Result<T>,
    ) -> Result<T> {
        let saved = self.core.condition;
        self.core.condition = wanted;
        self.update_op();

        let result = loop {
            match op(self) {
                Err(err) if err.is_would_block() => {
                    if let Err(err) = self.wait_ready() {
                        break Err(err);
                    }
                }
                other => break other,
            }
        };

        self.core.condition = saved;
        self.update_op();
        result
    }

    // Dispatch-level operations: control tick, transport op, then update
    // so the transport reprograms its event registration.

    pub(crate) fn connect_op(&mut self, remote_addr: &str) -> Result<()> {
        self.tick_ctl();
        let rc = {
            let (core, imp) = self.split();
            imp.connect(core, remote_addr)
        };
        if rc.is_ok() {
            self.update_op();
        }
        rc
    }

    pub(crate) fn server_op(&mut self, local_addr: &str) -> Result<()> {
        self.tick_ctl();
        let rc = {
            let (core, imp) = self.split();
            imp.server(core, local_addr)
        };
        if rc.is_ok() {
            self.update_op();
        }
        rc
    }

    pub(crate) fn accept_once(&mut self, conn_epoll: &Arc<Epoll>) -> Result<Socket> {
        self.tick_ctl();
        let rc = {
            let (core, imp) = self.split();
            imp.accept(core, conn_epoll)
        };
        self.update_op();
        match rc {
            Ok(mut conn) => {
                conn.update_op();
                Ok(conn)
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn send_once(&mut self, buf: &[u8]) -> Result<()> {
        self.tick_ctl();
        let rc = {
            let (core, imp) = self.split();
            imp.send(core, buf)
        };
        self.update_op();
        rc
    }

    pub(crate) fn receive_once(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.tick_ctl();
        let rc = {
            let (core, imp) = self.split();
            imp.receive(core, buf)
        };
        self.update_op();
        rc
    }

    pub(crate) fn finish_once(&mut self) -> Result<()> {
        self.tick_ctl();
        let rc = {
            let (core, imp) = self.split();
            imp.finish(core)
        };
        self.update_op();
        rc
    }

    pub(crate) fn update_op(&mut self) {
        let (core, imp) = self.split();
        imp.update(core);
    }

    pub(crate) fn set_condition(&mut self, condition: Condition) {
        self.core.condition = condition;
    }

    pub(crate) fn epoll_handle(&self) -> Arc<Epoll> {
        Arc::clone(&self.core.epoll)
    }

    pub(crate) fn set_local_addr_op(&mut self, local_addr: &str) -> Result<()> {
        let (core, imp) = self.split();
        imp.set_local_addr(core, local_addr)
    }

    pub(crate) fn counters_ref(&self) -> &ConnCounters {
        self.imp.counters(&self.core)
    }

    pub(crate) fn transport_attr_specs(&mut self) -> Vec<AttrSpec> {
        let (core, imp) = self.split();
        imp.attr_specs(core)
    }

    pub(crate) fn transport_attr_get(&mut self, name: &str) -> Result<AttrValue> {
        let (core, imp) = self.split();
        imp.attr_get(core, name)
    }

    pub(crate) fn transport_attr_set(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        let (core, imp) = self.split();
        imp.attr_set(core, name, value)
    }

    // Public API.

    /// Send one message. In blocking mode, waits until the transport
    /// accepts the message; in non-blocking mode, may return would-block.
    pub fn send(&mut self, buf: &[u8]) -> Result<()> {
        if self.core.blocking {
            self.blocking_op(Condition::WRITABLE, |s| s.send_once(buf))
        } else {
            self.send_once(buf)
        }
    }

    /// Receive one message into `buf`. Returns the message length, `Ok(0)`
    /// once the peer has closed, or would-block in non-blocking mode.
    /// Messages longer than `buf` are truncated.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.core.blocking {
            self.blocking_op(Condition::READABLE, |s| s.receive_once(buf))
        } else {
            self.receive_once(buf)
        }
    }

    /// Accept a pending connection on a server socket.
    pub fn accept(&mut self) -> Result<Socket> {
        self.accept_with(&attr::AttrMap::new())
    }

    /// Accept a pending connection, then apply an attribute map to the new
    /// connection socket.
    pub fn accept_with(&mut self, attrs: &attr::AttrMap) -> Result<Socket> {
        let conn_epoll = Arc::new(Epoll::new().map_err(Error::from_io)?);

        let mut conn = if self.core.blocking {
            self.blocking_op(Condition::ACCEPTABLE, |s| s.accept_once(&conn_epoll))?
        } else {
            self.accept_once(&conn_epoll)?
        };

        conn.core.blocking = self.core.blocking;
        crate::apply_attrs(&mut conn, attrs)?;
        conn.enable_ctl();
        Ok(conn)
    }

    /// Complete outstanding background work: connection establishment,
    /// handshakes, buffered output. Must be called after a readiness
    /// wake-up if no send/receive/accept follows.
    pub fn finish(&mut self) -> Result<()> {
        if self.core.blocking {
            let condition = self.core.condition;
            self.blocking_op(condition, |s| s.finish_once())
        } else {
            self.finish_once()
        }
    }

    /// Declare which conditions the caller will wait for on the event fd.
    /// Connection sockets accept `READABLE`/`WRITABLE`, server sockets
    /// `ACCEPTABLE`; `NONE` asks only for background progress.
    pub fn await_condition(&mut self, condition: Condition) -> Result<()> {
        if !condition.valid_for(self.core.sock_type) {
            return Err(Error::InvalidArgument(format!(
                "condition invalid for {} socket",
                self.core.sock_type.name()
            )));
        }
        self.core.condition = condition;
        self.update_op();
        Ok(())
    }

    /// The fd to register (level-triggered, read-ready) in the caller's
    /// event loop. Stable for the socket's lifetime.
    pub fn fd(&self) -> RawFd {
        self.core.epoll.raw_fd()
    }

    pub fn is_blocking(&self) -> bool {
        self.core.blocking
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.core.blocking = blocking;
    }

    pub fn sock_id(&self) -> i64 {
        self.core.sock_id
    }

    pub fn sock_type(&self) -> SocketType {
        self.core.sock_type
    }

    /// The transport this socket uses. UTLS connection sockets masquerade
    /// as their resolved sub-transport; all other sockets report the name
    /// their transport registered under.
    pub fn transport(&self) -> &'static str {
        self.imp
            .transport(&self.core)
            .unwrap_or(self.core.proto.name)
    }

    pub fn local_addr(&mut self) -> Option<String> {
        let (core, imp) = self.split();
        imp.local_addr(core)
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.imp.remote_addr(&self.core)
    }

    /// Largest message this connection accepts.
    pub fn max_msg(&self) -> usize {
        self.imp.max_msg(&self.core)
    }

    /// Snapshot of the connection counters.
    pub fn counters(&self) -> ConnCounters {
        self.counters_ref().clone()
    }

    /// Attach the control channel to this socket. Failure (e.g. a missing
    /// control directory) disables the channel and is logged, not
    /// surfaced.
    pub fn enable_ctl(&mut self) {
        let handled = {
            let (core, imp) = self.split();
            imp.enable_ctl(core)
        };
        if !handled && self.core.ctl.is_none() {
            self.core.ctl = Ctl::create(&self.core);
        }
    }

    /// Read one attribute by name.
    pub fn attr(&mut self, name: &str) -> Result<AttrValue> {
        match name {
            attr::ATTR_BLOCKING => Ok(AttrValue::Bool(self.core.blocking)),
            attr::ATTR_TYPE => Ok(AttrValue::Str(self.core.sock_type.name().to_string())),
            attr::ATTR_TRANSPORT => Ok(AttrValue::Str(self.transport().to_string())),
            attr::ATTR_LOCAL_ADDR => self
                .local_addr()
                .map(AttrValue::Str)
                .ok_or_else(|| Error::NotFound(name.to_string())),
            attr::ATTR_REMOTE_ADDR if self.core.sock_type == SocketType::Conn => self
                .remote_addr()
                .map(AttrValue::Str)
                .ok_or_else(|| Error::NotFound(name.to_string())),
            attr::ATTR_MAX_MSG_SIZE if self.core.sock_type == SocketType::Conn => {
                Ok(AttrValue::Int64(self.max_msg() as i64))
            }
            _ => {
                if self.core.sock_type == SocketType::Conn {
                    if let Some(value) = self.counter_attr(name) {
                        return Ok(value);
                    }
                }
                self.transport_attr_get(name)
            }
        }
    }

    fn counter_attr(&self, name: &str) -> Option<AttrValue> {
        let cnt = self.counters_ref();
        let value = match name {
            attr::ATTR_TO_APP_MSGS => cnt.to_app_msgs,
            attr::ATTR_TO_APP_BYTES => cnt.to_app_bytes,
            attr::ATTR_FROM_APP_MSGS => cnt.from_app_msgs,
            attr::ATTR_FROM_APP_BYTES => cnt.from_app_bytes,
            attr::ATTR_TO_LOWER_MSGS => cnt.to_lower_msgs,
            attr::ATTR_TO_LOWER_BYTES => cnt.to_lower_bytes,
            attr::ATTR_FROM_LOWER_MSGS => cnt.from_lower_msgs,
            attr::ATTR_FROM_LOWER_BYTES => cnt.from_lower_bytes,
            _ => return None,
        };
        Some(AttrValue::Int64(value as i64))
    }

    /// Read one attribute into a caller-supplied buffer, returning its type
    /// and encoded length. A too-small buffer is an overflow error.
    pub fn attr_into(&mut self, name: &str, buf: &mut [u8]) -> Result<(attr::AttrType, usize)> {
        let value = self.attr(name)?;
        let len = value.encode_into(buf)?;
        Ok((value.attr_type(), len))
    }

    /// Write one attribute by name.
    pub fn set_attr(&mut self, name: &str, value: &AttrValue) -> Result<()> {
        match name {
            attr::ATTR_BLOCKING => match value {
                AttrValue::Bool(blocking) => {
                    self.set_blocking(*blocking);
                    Ok(())
                }
                _ => Err(Error::InvalidArgument(format!(
                    "{name} takes a bool value"
                ))),
            },
            attr::ATTR_LOCAL_ADDR => match value {
                AttrValue::Str(addr) => {
                    let addr = addr.clone();
                    self.set_local_addr_op(&addr)
                }
                _ => Err(Error::InvalidArgument(format!(
                    "{name} takes a string value"
                ))),
            },
            attr::ATTR_TYPE
            | attr::ATTR_TRANSPORT
            | attr::ATTR_REMOTE_ADDR
            | attr::ATTR_MAX_MSG_SIZE
            | attr::ATTR_TO_APP_MSGS
            | attr::ATTR_TO_APP_BYTES
            | attr::ATTR_FROM_APP_MSGS
            | attr::ATTR_FROM_APP_BYTES
            | attr::ATTR_TO_LOWER_MSGS
            | attr::ATTR_TO_LOWER_BYTES
            | attr::ATTR_FROM_LOWER_MSGS
            | attr::ATTR_FROM_LOWER_BYTES => Err(Error::Permission),
            _ => self.transport_attr_set(name, value),
        }
    }

    /// Invoke `f` once per readable attribute: the common set for this
    /// socket type, then the transport-specific set.
    pub fn visit_attrs<F: FnMut(&str, &AttrValue)>(&mut self, mut f: F) {
        for spec in attr::common_specs(self.core.sock_type) {
            if !spec.mode.readable() {
                continue;
            }
            if let Ok(value) = self.attr(&spec.name) {
                f(&spec.name, &value);
            }
        }

        for spec in self.transport_attr_specs() {
            if !spec.mode.readable() {
                continue;
            }
            if let Ok(value) = self.transport_attr_get(&spec.name) {
                f(&spec.name, &value);
            }
        }
    }

    fn destroy(&mut self, owner: bool) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(ctl) = self.core.ctl.take() {
            ctl.destroy(owner);
        }

        let (core, imp) = (&mut self.core, self.imp.as_mut());
        if owner {
            imp.close(core);
        } else {
            imp.cleanup(core);
        }
    }

    /// Close the socket, releasing kernel and filesystem resources.
    /// Dropping the socket has the same effect.
    pub fn close(mut self) {
        self.destroy(true);
    }

    /// Release the socket's local state without touching filesystem
    /// artifacts. For the non-owning side after fork; the owner retains
    /// the listener paths. Never blocks.
    pub fn cleanup(mut self) {
        self.destroy(false);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.destroy(true);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("sock_id", &self.core.sock_id)
            .field("type", &self.core.sock_type.name())
            .field("transport", &self.transport())
            .field("blocking", &self.core.blocking)
            .finish()
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        debug!(sock_id = self.sock_id, "socket destroyed");
    }
}
