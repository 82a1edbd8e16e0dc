//! Built-in transports.

pub(crate) mod frame;
pub(crate) mod tcp;
pub(crate) mod tls;
pub(crate) mod utls;
pub(crate) mod ux;

use std::sync::Mutex;

use crate::transport::{register_locked, Proto};

pub(crate) fn register_builtins(protos: &Mutex<Vec<&'static Proto>>) {
    register_locked(protos, xcm_addr::PROTO_UX, ux::new_abstract);
    register_locked(protos, xcm_addr::PROTO_UXF, ux::new_path);
    register_locked(protos, xcm_addr::PROTO_TCP, tcp::new);
    register_locked(protos, xcm_addr::PROTO_TLS, tls::new);
    register_locked(protos, xcm_addr::PROTO_UTLS, utls::new);
}
