//! The UTLS hybrid transport.
//!
//! UTLS uses local IPC when client and server are co-resident on the
//! host, and TLS for everything else. From the user's perspective only
//! the `utls:` address family exists; internally a UTLS socket wraps a
//! `ux` sub-socket and a `tls` sub-socket, both registered on the
//! parent's event fd, and collapses to the winning one when a connection
//! resolves. Connection sockets then masquerade as the sub-transport;
//! server sockets keep both listeners armed and report `utls`.
//!
//! The address spaces are linked by construction: `utls:<host>:<port>`
//! maps to `tls:<host>:<port>`, whose `<host>:<port>` part in turn is the
//! abstract local IPC name.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::attr::{AttrSpec, AttrValue};
use crate::error::{Error, ErrorKind, Result};
use crate::event::Epoll;
use crate::socket::{ConnCounters, Socket, SocketCore, SocketType};
use crate::transport::{self, Proto, TpSocket};

pub(crate) fn new(_sock_type: SocketType) -> Box<dyn TpSocket> {
    Box::new(UtlsSocket {
        ux: None,
        tls: None,
        laddr: String::new(),
        proxy: Vec::new(),
    })
}

fn cached_proto(name: &'static str, slot: &OnceLock<&'static Proto>) -> Result<&'static Proto> {
    if let Some(&proto) = slot.get() {
        return Ok(proto);
    }
    let proto =
        transport::find_by_name(name).ok_or_else(|| Error::ProtoNotAvailable(name.to_string()))?;
    Ok(*slot.get_or_init(|| proto))
}

fn ux_proto() -> Result<&'static Proto> {
    static CACHED: OnceLock<&'static Proto> = OnceLock::new();
    cached_proto(xcm_addr::PROTO_UX, &CACHED)
}

fn tls_proto() -> Result<&'static Proto> {
    static CACHED: OnceLock<&'static Proto> = OnceLock::new();
    cached_proto(xcm_addr::PROTO_TLS, &CACHED)
}

fn utls_proto() -> Result<&'static Proto> {
    static CACHED: OnceLock<&'static Proto> = OnceLock::new();
    cached_proto(xcm_addr::PROTO_UTLS, &CACHED)
}

/// Derive the abstract local IPC address from a canonical TLS address:
/// the `<host>:<port>` part becomes the abstract name.
fn tls_to_ux_addr(tls_addr: &str) -> Result<String> {
    let name = tls_addr
        .strip_prefix("tls:")
        .ok_or_else(|| Error::InvalidArgument(format!("not a TLS address: {tls_addr}")))?;
    Ok(xcm_addr::make_ux(name)?)
}

/// Which sub-socket a proxied attribute belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubRef {
    Ux,
    Tls,
}

/// One entry of the attribute proxy table: the advertised descriptor plus
/// the handle (sub-socket and name) needed to reach the real attribute.
struct ProxyAttr {
    spec: AttrSpec,
    sub: SubRef,
}

pub(crate) struct UtlsSocket {
    ux: Option<Socket>,
    tls: Option<Socket>,
    // Canonical local address of a server socket, synthesized from the
    // TLS sub-socket's kernel-assigned port.
    laddr: String,
    proxy: Vec<ProxyAttr>,
}

impl UtlsSocket {
    /// The sub-socket a resolved connection runs on.
    fn active(&self) -> Option<&Socket> {
        self.ux.as_ref().or(self.tls.as_ref())
    }

    fn active_mut(&mut self) -> Option<&mut Socket> {
        self.ux.as_mut().or(self.tls.as_mut())
    }

    fn active_conn(&mut self) -> Result<&mut Socket> {
        self.active_mut().ok_or(Error::Permission)
    }

    fn sub(&mut self, which: SubRef) -> Option<&mut Socket> {
        match which {
            SubRef::Ux => self.ux.as_mut(),
            SubRef::Tls => self.tls.as_mut(),
        }
    }

    fn drop_both(&mut self) {
        self.ux = None;
        self.tls = None;
    }

    /// Rebuild the proxy table from the extant sub-sockets' attribute
    /// lists. Rebuilt lazily on each use; duplicates across sub-sockets
    /// are kept as-is.
    fn rebuild_proxy(&mut self) {
        self.proxy.clear();

        if let Some(ux) = self.ux.as_mut() {
            for spec in ux.transport_attr_specs() {
                self.proxy.push(ProxyAttr {
                    spec,
                    sub: SubRef::Ux,
                });
            }
        }
        if let Some(tls) = self.tls.as_mut() {
            for spec in tls.transport_attr_specs() {
                self.proxy.push(ProxyAttr {
                    spec,
                    sub: SubRef::Tls,
                });
            }
        }
    }

    fn proxy_lookup(&self, name: &str) -> Option<(SubRef, AttrSpec)> {
        self.proxy
            .iter()
            .find(|p| p.spec.name == name)
            .map(|p| (p.sub, p.spec.clone()))
    }

    fn sync_update(parent_core: &SocketCore, sub: &mut Socket) {
        sub.set_condition(parent_core.condition());
        sub.update_op();
    }
}

impl TpSocket for UtlsSocket {
    fn init(&mut self, core: &mut SocketCore) -> Result<()> {
        let sock_type = core.sock_type();
        let epoll = core.epoll().clone();

        let ux = Socket::create(ux_proto()?, sock_type, Arc::clone(&epoll), false)?;
        let tls = Socket::create(tls_proto()?, sock_type, epoll, false)?;

        self.ux = Some(ux);
        self.tls = Some(tls);
        Ok(())
    }

    fn connect(&mut self, _core: &mut SocketCore, remote_addr: &str) -> Result<()> {
        debug!(addr = remote_addr, "UTLS connect");

        let (host, port) = match xcm_addr::parse_utls(remote_addr) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.drop_both();
                return Err(err.into());
            }
        };

        let tls_addr = xcm_addr::make_tls(&host, port);
        let ux_addr = tls_to_ux_addr(&tls_addr)?;

        // A missing local server shows up as an immediate
        // connection-refused even on a non-blocking local IPC connect;
        // any other failure is genuine.
        let mut ux = self.ux.take().ok_or(Error::Permission)?;
        match ux.connect_op(&ux_addr) {
            Ok(()) => {
                self.tls = None;
                self.ux = Some(ux);
                debug!("UTLS resolved to local IPC");
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                debug!("no local server, falling back to TLS");
            }
            Err(err) => {
                self.drop_both();
                return Err(err);
            }
        }

        let mut tls = self.tls.take().ok_or(Error::Permission)?;
        match tls.connect_op(&tls_addr) {
            Ok(()) => {
                self.tls = Some(tls);
                Ok(())
            }
            Err(err) => {
                self.drop_both();
                Err(err)
            }
        }
    }

    fn server(&mut self, core: &mut SocketCore, local_addr: &str) -> Result<()> {
        debug!(addr = local_addr, "UTLS server bind");

        let (host, port) = match xcm_addr::parse_utls(local_addr) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.drop_both();
                return Err(err.into());
            }
        };

        let tls_addr = xcm_addr::make_tls(&host, port);

        // TLS binds first so a port-0 request resolves to the actual
        // kernel-assigned port before the local IPC name is derived. A
        // client connecting in this window lands on TLS even though the
        // local path is about to appear; a performance loss, not a
        // correctness one.
        let Some(tls) = self.tls.as_mut() else {
            self.drop_both();
            return Err(Error::Permission);
        };
        if let Err(err) = tls.server_op(&tls_addr) {
            self.drop_both();
            return Err(err);
        }

        let actual_addr = if port == 0 {
            let Some(bound) = tls.local_addr() else {
                self.drop_both();
                return Err(Error::Protocol(
                    "bound TLS socket has no local address".to_string(),
                ));
            };
            let (_, actual_port) = xcm_addr::parse_tls(&bound)?;
            debug!(port = actual_port, "kernel-assigned TCP port");
            bound
        } else {
            tls_addr
        };

        let ux_addr = tls_to_ux_addr(&actual_addr)?;
        let Some(ux) = self.ux.as_mut() else {
            self.drop_both();
            return Err(Error::Permission);
        };
        if let Err(err) = ux.server_op(&ux_addr) {
            self.drop_both();
            return Err(err);
        }

        debug!(sock_id = core.sock_id(), "UTLS server socket created");
        Ok(())
    }

    fn accept(&mut self, core: &mut SocketCore, conn_epoll: &Arc<Epoll>) -> Result<Socket> {
        let _ = core;

        if let Some(ux_server) = self.ux.as_mut() {
            if let Ok(ux_conn) = ux_server.accept_once(conn_epoll) {
                return wrap_accepted(Some(ux_conn), None, conn_epoll);
            }
        }

        let tls_server = self.tls.as_mut().ok_or(Error::Permission)?;
        let tls_conn = tls_server.accept_once(conn_epoll)?;
        wrap_accepted(None, Some(tls_conn), conn_epoll)
    }

    fn send(&mut self, _core: &mut SocketCore, buf: &[u8]) -> Result<()> {
        self.active_conn()?.send_once(buf)
    }

    fn receive(&mut self, _core: &mut SocketCore, buf: &mut [u8]) -> Result<usize> {
        self.active_conn()?.receive_once(buf)
    }

    fn update(&mut self, core: &mut SocketCore) {
        match core.sock_type() {
            SocketType::Conn => {
                if let Some(active) = self.active_mut() {
                    UtlsSocket::sync_update(core, active);
                }
            }
            SocketType::Server => {
                if let Some(ux) = self.ux.as_mut() {
                    UtlsSocket::sync_update(core, ux);
                }
                if let Some(tls) = self.tls.as_mut() {
                    UtlsSocket::sync_update(core, tls);
                }
            }
        }
    }

    fn finish(&mut self, core: &mut SocketCore) -> Result<()> {
        match core.sock_type() {
            SocketType::Conn => self.active_conn()?.finish_once(),
            SocketType::Server => {
                if let Some(ux) = self.ux.as_mut() {
                    ux.finish_once()?;
                }
                if let Some(tls) = self.tls.as_mut() {
                    tls.finish_once()?;
                }
                Ok(())
            }
        }
    }

    fn close(&mut self, _core: &mut SocketCore) {
        self.drop_both();
        self.proxy.clear();
    }

    fn cleanup(&mut self, _core: &mut SocketCore) {
        if let Some(ux) = self.ux.take() {
            ux.cleanup();
        }
        if let Some(tls) = self.tls.take() {
            tls.cleanup();
        }
        self.proxy.clear();
    }

    fn transport(&self, core: &SocketCore) -> Option<&'static str> {
        match core.sock_type() {
            // Masquerade as the transport the connection resolved to.
            SocketType::Conn => self.active().map(Socket::transport),
            SocketType::Server => Some(xcm_addr::PROTO_UTLS),
        }
    }

    fn remote_addr(&self, _core: &SocketCore) -> Option<String> {
        self.active().and_then(Socket::remote_addr)
    }

    fn local_addr(&mut self, core: &mut SocketCore) -> Option<String> {
        match core.sock_type() {
            SocketType::Conn => self.active_mut().and_then(Socket::local_addr),
            SocketType::Server => {
                let tls = self.tls.as_mut()?;
                let tls_addr = tls.local_addr()?;
                let (host, port) = xcm_addr::parse_tls(&tls_addr).ok()?;
                self.laddr = xcm_addr::make_utls(&host, port);
                Some(self.laddr.clone())
            }
        }
    }

    fn set_local_addr(&mut self, _core: &mut SocketCore, local_addr: &str) -> Result<()> {
        // Only meaningful while the TLS sub-socket is still unbound.
        let Some(tls) = self.tls.as_mut() else {
            return Err(Error::Permission);
        };

        let (host, port) = xcm_addr::parse_utls(local_addr)?;
        let tls_addr = xcm_addr::make_tls(&host, port);
        tls.set_local_addr_op(&tls_addr)
    }

    fn max_msg(&self, _core: &SocketCore) -> usize {
        self.active().map(Socket::max_msg).unwrap_or(0)
    }

    fn counters<'a>(&'a self, core: &'a SocketCore) -> &'a ConnCounters {
        match self.active() {
            Some(active) => active.counters_ref(),
            None => &core.cnt,
        }
    }

    fn enable_ctl(&mut self, core: &mut SocketCore) -> bool {
        match core.sock_type() {
            SocketType::Conn => {
                if let Some(active) = self.active_mut() {
                    active.enable_ctl();
                }
            }
            SocketType::Server => {
                // All three sockets get a control listener; exposing the
                // sub-sockets alongside the composite is mostly
                // historical, but tools depend on it.
                if let Some(ux) = self.ux.as_mut() {
                    ux.enable_ctl();
                }
                if let Some(tls) = self.tls.as_mut() {
                    tls.enable_ctl();
                }
                if core.ctl.is_none() {
                    core.ctl = crate::ctl::Ctl::create(core);
                }
            }
        }
        true
    }

    fn attr_specs(&mut self, _core: &mut SocketCore) -> Vec<AttrSpec> {
        self.rebuild_proxy();
        self.proxy.iter().map(|p| p.spec.clone()).collect()
    }

    fn attr_get(&mut self, _core: &mut SocketCore, name: &str) -> Result<AttrValue> {
        self.rebuild_proxy();
        let (sub, spec) = self
            .proxy_lookup(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let sub = self.sub(sub).ok_or(Error::Permission)?;
        sub.transport_attr_get(&spec.name)
    }

    fn attr_set(&mut self, _core: &mut SocketCore, name: &str, value: &AttrValue) -> Result<()> {
        self.rebuild_proxy();
        let (sub, spec) = self
            .proxy_lookup(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let sub = self.sub(sub).ok_or(Error::Permission)?;
        sub.transport_attr_set(&spec.name, value)
    }
}

/// Wrap an accepted sub-connection in a UTLS connection socket holding
/// only the winning sub-socket.
fn wrap_accepted(
    ux: Option<Socket>,
    tls: Option<Socket>,
    conn_epoll: &Arc<Epoll>,
) -> Result<Socket> {
    Ok(Socket::from_parts(
        utls_proto()?,
        SocketType::Conn,
        conn_epoll.clone(),
        Box::new(UtlsSocket {
            ux,
            tls,
            laddr: String::new(),
            proxy: Vec::new(),
        }),
    ))
}
