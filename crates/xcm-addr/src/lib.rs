//! Address grammar for XCM sockets.
//!
//! An XCM address is `<proto>:<proto-specific part>`. The local IPC protos
//! carry a name (`ux:`, abstract namespace) or a filesystem path (`uxf:`);
//! the inet-based protos (`tcp:`, `tls:`, `utls:`, `sctp:`) carry
//! `<host>:<port>` where host is an IPv4 dotted quad, a bracketed IPv6
//! address, a DNS name, or a wildcard (`*` / `[*]`).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Maximum length of a protocol token.
pub const MAX_PROTO_LEN: usize = 8;

/// Maximum length of a complete address string.
pub const MAX_ADDR_LEN: usize = 512;

/// Maximum length of a local IPC name (`sun_path` minus the leading NUL).
pub const MAX_UX_NAME_LEN: usize = 107;

pub const PROTO_UX: &str = "ux";
pub const PROTO_UXF: &str = "uxf";
pub const PROTO_TCP: &str = "tcp";
pub const PROTO_TLS: &str = "tls";
pub const PROTO_UTLS: &str = "utls";
pub const PROTO_SCTP: &str = "sctp";

/// Errors produced while parsing or formatting addresses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    /// The address has no `proto:` separator.
    #[error("address has no protocol separator: {0}")]
    MissingProto(String),

    /// The protocol token is empty or exceeds [`MAX_PROTO_LEN`].
    #[error("invalid protocol token: {0}")]
    BadProto(String),

    /// The address names a different protocol than the parser expects.
    #[error("expected protocol {expected}, got {actual}")]
    ProtoMismatch {
        expected: &'static str,
        actual: String,
    },

    /// The host part is malformed.
    #[error("invalid host: {0}")]
    BadHost(String),

    /// The port part is missing or not a 16-bit integer.
    #[error("invalid port: {0}")]
    BadPort(String),

    /// A local IPC name is empty or too long.
    #[error("invalid local IPC name: {0}")]
    BadName(String),

    /// The complete address exceeds [`MAX_ADDR_LEN`].
    #[error("address too long ({len} bytes, max {MAX_ADDR_LEN})")]
    TooLong { len: usize },
}

pub type Result<T> = std::result::Result<T, AddrError>;

/// The host part of an inet-based address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// Literal IPv4 or IPv6 address.
    Ip(IpAddr),
    /// DNS name, resolved at connect/bind time.
    Name(String),
    /// IPv4 wildcard (`*`).
    Any,
    /// IPv6 wildcard (`[*]`).
    Any6,
}

impl Host {
    /// The IP this host resolves to without consulting DNS, if any.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Host::Ip(ip) => Some(*ip),
            Host::Any => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            Host::Any6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            Host::Name(_) => None,
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{ip}"),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
            Host::Name(name) => f.write_str(name),
            Host::Any => f.write_str("*"),
            Host::Any6 => f.write_str("[*]"),
        }
    }
}

/// Split an address into its protocol token and the remainder.
pub fn split_proto(addr: &str) -> Result<(&str, &str)> {
    if addr.len() > MAX_ADDR_LEN {
        return Err(AddrError::TooLong { len: addr.len() });
    }

    let (proto, rest) = addr
        .split_once(':')
        .ok_or_else(|| AddrError::MissingProto(addr.to_string()))?;

    if proto.is_empty() || proto.len() > MAX_PROTO_LEN {
        return Err(AddrError::BadProto(proto.to_string()));
    }
    if !proto.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(AddrError::BadProto(proto.to_string()));
    }

    Ok((proto, rest))
}

/// The protocol token of an address.
pub fn proto_of(addr: &str) -> Result<&str> {
    split_proto(addr).map(|(proto, _)| proto)
}

fn expect_proto(addr: &str, expected: &'static str) -> Result<String> {
    let (proto, rest) = split_proto(addr)?;
    if proto != expected {
        return Err(AddrError::ProtoMismatch {
            expected,
            actual: proto.to_string(),
        });
    }
    Ok(rest.to_string())
}

fn validate_ux_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_UX_NAME_LEN || name.contains('\0') {
        return Err(AddrError::BadName(name.to_string()));
    }
    Ok(())
}

/// Parse a `ux:<name>` address into its abstract namespace name.
pub fn parse_ux(addr: &str) -> Result<String> {
    let name = expect_proto(addr, PROTO_UX)?;
    validate_ux_name(&name)?;
    Ok(name)
}

/// Parse a `uxf:<path>` address into its filesystem path.
pub fn parse_uxf(addr: &str) -> Result<String> {
    let path = expect_proto(addr, PROTO_UXF)?;
    validate_ux_name(&path)?;
    Ok(path)
}

/// Format an abstract local IPC address.
pub fn make_ux(name: &str) -> Result<String> {
    validate_ux_name(name)?;
    Ok(format!("{PROTO_UX}:{name}"))
}

/// Format a filesystem local IPC address.
pub fn make_uxf(path: &str) -> Result<String> {
    validate_ux_name(path)?;
    Ok(format!("{PROTO_UXF}:{path}"))
}

fn parse_host(host: &str) -> Result<Host> {
    if host == "*" {
        return Ok(Host::Any);
    }

    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| AddrError::BadHost(host.to_string()))?;
        if inner == "*" {
            return Ok(Host::Any6);
        }
        let ip: Ipv6Addr = inner
            .parse()
            .map_err(|_| AddrError::BadHost(host.to_string()))?;
        return Ok(Host::Ip(IpAddr::V6(ip)));
    }

    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(Host::Ip(IpAddr::V4(ip)));
    }

    if host.is_empty()
        || !host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_')
    {
        return Err(AddrError::BadHost(host.to_string()));
    }

    Ok(Host::Name(host.to_string()))
}

fn parse_host_port(rest: &str) -> Result<(Host, u16)> {
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| AddrError::BadPort(rest.to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| AddrError::BadPort(port.to_string()))?;

    Ok((parse_host(host)?, port))
}

fn parse_ip_proto(addr: &str, expected: &'static str) -> Result<(Host, u16)> {
    let rest = expect_proto(addr, expected)?;
    parse_host_port(&rest)
}

fn make_ip_proto(proto: &str, host: &Host, port: u16) -> String {
    format!("{proto}:{host}:{port}")
}

/// Parse a `tcp:<host>:<port>` address.
pub fn parse_tcp(addr: &str) -> Result<(Host, u16)> {
    parse_ip_proto(addr, PROTO_TCP)
}

/// Parse a `tls:<host>:<port>` address.
pub fn parse_tls(addr: &str) -> Result<(Host, u16)> {
    parse_ip_proto(addr, PROTO_TLS)
}

/// Parse a `utls:<host>:<port>` address.
pub fn parse_utls(addr: &str) -> Result<(Host, u16)> {
    parse_ip_proto(addr, PROTO_UTLS)
}

/// Parse an `sctp:<host>:<port>` address.
pub fn parse_sctp(addr: &str) -> Result<(Host, u16)> {
    parse_ip_proto(addr, PROTO_SCTP)
}

/// Format a `tcp:` address.
pub fn make_tcp(host: &Host, port: u16) -> String {
    make_ip_proto(PROTO_TCP, host, port)
}

/// Format a `tls:` address.
pub fn make_tls(host: &Host, port: u16) -> String {
    make_ip_proto(PROTO_TLS, host, port)
}

/// Format a `utls:` address.
pub fn make_utls(host: &Host, port: u16) -> String {
    make_ip_proto(PROTO_UTLS, host, port)
}

/// Format an `sctp:` address.
pub fn make_sctp(host: &Host, port: u16) -> String {
    make_ip_proto(PROTO_SCTP, host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_proto_token() {
        assert_eq!(split_proto("tcp:1.2.3.4:80").unwrap().0, "tcp");
        assert_eq!(split_proto("ux:some-name").unwrap().1, "some-name");
        assert!(matches!(
            split_proto("no-separator"),
            Err(AddrError::MissingProto(_))
        ));
        assert!(matches!(
            split_proto("waytoolongproto:x"),
            Err(AddrError::BadProto(_))
        ));
        assert!(matches!(split_proto(":x"), Err(AddrError::BadProto(_))));
    }

    #[test]
    fn ux_roundtrip() {
        let addr = make_ux("foo:4711").unwrap();
        assert_eq!(addr, "ux:foo:4711");
        assert_eq!(parse_ux(&addr).unwrap(), "foo:4711");
    }

    #[test]
    fn uxf_roundtrip() {
        let addr = make_uxf("/run/app/sock").unwrap();
        assert_eq!(parse_uxf(&addr).unwrap(), "/run/app/sock");
    }

    #[test]
    fn ux_name_limits() {
        assert!(make_ux("").is_err());
        assert!(make_ux(&"a".repeat(MAX_UX_NAME_LEN)).is_ok());
        assert!(make_ux(&"a".repeat(MAX_UX_NAME_LEN + 1)).is_err());
        assert!(parse_ux("uxf:/path").is_err());
    }

    #[test]
    fn tcp_ipv4() {
        let (host, port) = parse_tcp("tcp:127.0.0.1:4711").unwrap();
        assert_eq!(host, Host::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(port, 4711);
        assert_eq!(make_tcp(&host, port), "tcp:127.0.0.1:4711");
    }

    #[test]
    fn tls_ipv6() {
        let (host, port) = parse_tls("tls:[::1]:80").unwrap();
        assert_eq!(host, Host::Ip("::1".parse::<Ipv6Addr>().unwrap().into()));
        assert_eq!(port, 80);
        assert_eq!(make_tls(&host, port), "tls:[::1]:80");
    }

    #[test]
    fn utls_dns_name() {
        let (host, port) = parse_utls("utls:server.example.com:13001").unwrap();
        assert_eq!(host, Host::Name("server.example.com".to_string()));
        assert_eq!(make_utls(&host, port), "utls:server.example.com:13001");
    }

    #[test]
    fn wildcards() {
        let (host, port) = parse_tcp("tcp:*:0").unwrap();
        assert_eq!(host, Host::Any);
        assert_eq!(port, 0);
        assert_eq!(make_tcp(&host, port), "tcp:*:0");

        let (host, _) = parse_sctp("sctp:[*]:99").unwrap();
        assert_eq!(host, Host::Any6);
        assert_eq!(host.ip(), Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert_eq!(make_sctp(&host, 99), "sctp:[*]:99");
    }

    #[test]
    fn port_zero_requests_allocation() {
        let (_, port) = parse_utls("utls:127.0.0.1:0").unwrap();
        assert_eq!(port, 0);
    }

    #[test]
    fn bad_inputs() {
        assert!(matches!(
            parse_tcp("tcp:1.2.3.4"),
            Err(AddrError::BadPort(_))
        ));
        assert!(matches!(
            parse_tcp("tcp:1.2.3.4:notaport"),
            Err(AddrError::BadPort(_))
        ));
        assert!(matches!(
            parse_tcp("tcp:1.2.3.4:65536"),
            Err(AddrError::BadPort(_))
        ));
        assert!(matches!(
            parse_tls("tls:[::1:80"),
            Err(AddrError::BadHost(_))
        ));
        assert!(matches!(
            parse_tls("tls:ho st:80"),
            Err(AddrError::BadHost(_))
        ));
        assert!(matches!(
            parse_utls("tls:1.2.3.4:80"),
            Err(AddrError::ProtoMismatch { .. })
        ));
    }

    #[test]
    fn rejects_oversized_address() {
        let addr = format!("ux:{}", "a".repeat(MAX_ADDR_LEN));
        assert!(matches!(split_proto(&addr), Err(AddrError::TooLong { .. })));
    }
}
