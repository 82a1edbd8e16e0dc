//! The transport plugin contract and the process-wide transport registry.

use std::sync::{Arc, Mutex, OnceLock};

use tracing::debug;

use crate::attr::{AttrSpec, AttrValue};
use crate::error::{Error, Result};
use crate::event::Epoll;
use crate::socket::{ConnCounters, Socket, SocketCore, SocketType};

/// The operations every transport implements for its sockets.
///
/// One value of this trait is the transport-private state of one socket;
/// the shared per-socket record is passed in as [`SocketCore`]. Connection
/// and server sockets are distinguished by `core.sock_type()`.
///
/// All I/O is non-blocking; blocking mode is layered on top by the socket
/// dispatch, which waits on the socket's event fd between attempts.
pub trait TpSocket: Send {
    /// Post-construction initialization. UTLS uses this to allocate its
    /// sub-sockets; simple transports have nothing to do.
    fn init(&mut self, core: &mut SocketCore) -> Result<()> {
        let _ = core;
        Ok(())
    }

    fn connect(&mut self, core: &mut SocketCore, remote_addr: &str) -> Result<()>;

    fn server(&mut self, core: &mut SocketCore, local_addr: &str) -> Result<()>;

    /// Accept a pending connection on a server socket, producing the
    /// connection socket. Its kernel resources register on `conn_epoll`,
    /// the event fd of the socket being created.
    fn accept(&mut self, core: &mut SocketCore, conn_epoll: &Arc<Epoll>) -> Result<Socket>;

    fn send(&mut self, core: &mut SocketCore, buf: &[u8]) -> Result<()>;

    /// Receive one message. `Ok(0)` means the peer closed the connection;
    /// messages larger than `buf` are truncated.
    fn receive(&mut self, core: &mut SocketCore, buf: &mut [u8]) -> Result<usize>;

    /// Reprogram the event-fd registration to reflect the current desired
    /// condition and internal state. Idempotent.
    fn update(&mut self, core: &mut SocketCore);

    /// Drive outstanding background work (connection establishment,
    /// handshakes, buffered output) one step.
    fn finish(&mut self, core: &mut SocketCore) -> Result<()>;

    /// Owner-side teardown, releasing kernel and filesystem resources.
    fn close(&mut self, core: &mut SocketCore);

    /// Non-owner teardown (post-fork): release local state but leave
    /// filesystem artifacts to the owning process.
    fn cleanup(&mut self, core: &mut SocketCore);

    /// Run-time transport name override. UTLS connections masquerade as
    /// their resolved sub-transport through this hook; most transports
    /// keep the registered name by returning `None`.
    fn transport(&self, core: &SocketCore) -> Option<&'static str> {
        let _ = core;
        None
    }

    fn remote_addr(&self, core: &SocketCore) -> Option<String> {
        let _ = core;
        None
    }

    fn local_addr(&mut self, core: &mut SocketCore) -> Option<String>;

    /// Request a local address before connect/bind. Transports that do not
    /// support it inherit the permission error.
    fn set_local_addr(&mut self, core: &mut SocketCore, local_addr: &str) -> Result<()> {
        let _ = (core, local_addr);
        Err(Error::Permission)
    }

    /// Largest message this connection accepts.
    fn max_msg(&self, core: &SocketCore) -> usize;

    /// The counters backing the `xcm.*` counter attributes. The default is
    /// the socket's own record; UTLS redirects to its active sub-socket.
    fn counters<'a>(&'a self, core: &'a SocketCore) -> &'a ConnCounters {
        &core.cnt
    }

    /// Attach the control channel. Returning `false` lets the framework
    /// create a control listener on the socket itself; UTLS overrides this
    /// to fan out over its sub-sockets.
    fn enable_ctl(&mut self, core: &mut SocketCore) -> bool {
        let _ = core;
        false
    }

    /// Transport-specific attributes (the common `xcm.*` set is handled by
    /// the framework).
    fn attr_specs(&mut self, core: &mut SocketCore) -> Vec<AttrSpec> {
        let _ = core;
        Vec::new()
    }

    fn attr_get(&mut self, core: &mut SocketCore, name: &str) -> Result<AttrValue> {
        let _ = core;
        Err(Error::NotFound(name.to_string()))
    }

    fn attr_set(&mut self, core: &mut SocketCore, name: &str, value: &AttrValue) -> Result<()> {
        let _ = (core, value);
        Err(Error::NotFound(name.to_string()))
    }
}

/// Factory producing the transport-private state for a new socket.
pub type SocketFactory = fn(SocketType) -> Box<dyn TpSocket>;

/// A registered transport: name plus socket factory.
#[derive(Debug)]
pub struct Proto {
    pub name: &'static str,
    pub(crate) factory: SocketFactory,
}

/// Upper bound on registered transports.
const MAX_PROTOS: usize = 8;

struct Registry {
    protos: Mutex<Vec<&'static Proto>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let registry = Registry {
            protos: Mutex::new(Vec::with_capacity(MAX_PROTOS)),
        };
        crate::tp::register_builtins(&registry.protos);
        registry
    })
}

pub(crate) fn register_locked(
    protos: &Mutex<Vec<&'static Proto>>,
    name: &'static str,
    factory: SocketFactory,
) {
    let mut protos = protos.lock().expect("transport registry lock poisoned");
    debug_assert!(protos.len() < MAX_PROTOS);
    debug_assert!(protos.iter().all(|p| p.name != name));
    protos.push(Box::leak(Box::new(Proto { name, factory })));
}

/// Register an out-of-tree transport. Names are bounded by the address
/// grammar's protocol token length; duplicates are rejected.
pub fn register(name: &str, factory: SocketFactory) -> Result<()> {
    if name.is_empty() || name.len() > xcm_addr::MAX_PROTO_LEN {
        return Err(Error::InvalidArgument(format!(
            "transport name out of bounds: {name}"
        )));
    }

    let mut protos = registry()
        .protos
        .lock()
        .expect("transport registry lock poisoned");
    if protos.len() >= MAX_PROTOS {
        return Err(Error::InvalidArgument(
            "transport registry full".to_string(),
        ));
    }
    if protos.iter().any(|p| p.name == name) {
        return Err(Error::InvalidArgument(format!(
            "transport already registered: {name}"
        )));
    }

    let name: &'static str = Box::leak(name.to_string().into_boxed_str());
    protos.push(Box::leak(Box::new(Proto { name, factory })));
    debug!(name, "registered transport");
    Ok(())
}

/// Look up a transport by exact name.
pub(crate) fn find_by_name(name: &str) -> Option<&'static Proto> {
    registry()
        .protos
        .lock()
        .expect("transport registry lock poisoned")
        .iter()
        .copied()
        .find(|p| p.name == name)
}

/// Resolve the transport named by an address's protocol token.
pub(crate) fn find_by_addr(addr: &str) -> Result<&'static Proto> {
    let proto = xcm_addr::proto_of(addr)?;
    find_by_name(proto).ok_or_else(|| Error::ProtoNotAvailable(proto.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn builtins_are_registered() {
        for name in ["ux", "uxf", "tcp", "tls", "utls"] {
            assert!(find_by_name(name).is_some(), "missing builtin {name}");
        }
        assert!(find_by_name("sctp").is_none());
    }

    #[test]
    fn lookup_by_address() {
        assert_eq!(find_by_addr("tcp:127.0.0.1:80").unwrap().name, "tcp");
        assert_eq!(find_by_addr("ux:a-name").unwrap().name, "ux");

        let err = find_by_addr("nope:x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtoNotAvailable);

        let err = find_by_addr("not-an-address").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Addr);
    }

    #[test]
    fn register_rejects_bad_names() {
        assert!(register("", crate::tp::ux::new_abstract).is_err());
        assert!(register("overlongname", crate::tp::ux::new_abstract).is_err());
        assert!(register("ux", crate::tp::ux::new_abstract).is_err());
    }
}
