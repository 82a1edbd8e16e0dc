//! Per-socket typed attributes.
//!
//! Every socket carries a common attribute set (`xcm.*`); transports add
//! their own. Values are typed; get/set go through the owning socket so a
//! transport can redirect them (UTLS proxies its sub-sockets' attributes).

use crate::error::{Error, Result};
use crate::socket::SocketType;

pub const ATTR_BLOCKING: &str = "xcm.blocking";
pub const ATTR_TYPE: &str = "xcm.type";
pub const ATTR_TRANSPORT: &str = "xcm.transport";
pub const ATTR_LOCAL_ADDR: &str = "xcm.local_addr";
pub const ATTR_REMOTE_ADDR: &str = "xcm.remote_addr";
pub const ATTR_MAX_MSG_SIZE: &str = "xcm.max_msg_size";
pub const ATTR_TO_APP_MSGS: &str = "xcm.to_app_msgs";
pub const ATTR_TO_APP_BYTES: &str = "xcm.to_app_bytes";
pub const ATTR_FROM_APP_MSGS: &str = "xcm.from_app_msgs";
pub const ATTR_FROM_APP_BYTES: &str = "xcm.from_app_bytes";
pub const ATTR_TO_LOWER_MSGS: &str = "xcm.to_lower_msgs";
pub const ATTR_TO_LOWER_BYTES: &str = "xcm.to_lower_bytes";
pub const ATTR_FROM_LOWER_MSGS: &str = "xcm.from_lower_msgs";
pub const ATTR_FROM_LOWER_BYTES: &str = "xcm.from_lower_bytes";

/// Attribute value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Bool,
    Int64,
    Str,
    Bin,
}

impl AttrType {
    /// Wire tag used by the control-channel protocol.
    pub(crate) fn tag(self) -> u32 {
        match self {
            AttrType::Bool => 1,
            AttrType::Int64 => 2,
            AttrType::Str => 3,
            AttrType::Bin => 4,
        }
    }

    pub(crate) fn from_tag(tag: u32) -> Option<AttrType> {
        match tag {
            1 => Some(AttrType::Bool),
            2 => Some(AttrType::Int64),
            3 => Some(AttrType::Str),
            4 => Some(AttrType::Bin),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AttrType::Bool => "bool",
            AttrType::Int64 => "int64",
            AttrType::Str => "str",
            AttrType::Bin => "bin",
        }
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    Int64(i64),
    Str(String),
    Bin(Vec<u8>),
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::Int64(_) => AttrType::Int64,
            AttrValue::Str(_) => AttrType::Str,
            AttrValue::Bin(_) => AttrType::Bin,
        }
    }

    /// Encode the value into a caller-supplied buffer.
    ///
    /// Booleans are one byte, int64s eight bytes in host order, strings are
    /// NUL-terminated. Returns the number of bytes written; a too-small
    /// buffer is an overflow error.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        match self {
            AttrValue::Bool(v) => {
                if buf.is_empty() {
                    return Err(Error::Overflow);
                }
                buf[0] = u8::from(*v);
                Ok(1)
            }
            AttrValue::Int64(v) => {
                let bytes = v.to_ne_bytes();
                if buf.len() < bytes.len() {
                    return Err(Error::Overflow);
                }
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
            AttrValue::Str(v) => {
                let bytes = v.as_bytes();
                if buf.len() < bytes.len() + 1 {
                    return Err(Error::Overflow);
                }
                buf[..bytes.len()].copy_from_slice(bytes);
                buf[bytes.len()] = 0;
                Ok(bytes.len() + 1)
            }
            AttrValue::Bin(v) => {
                if buf.len() < v.len() {
                    return Err(Error::Overflow);
                }
                buf[..v.len()].copy_from_slice(v);
                Ok(v.len())
            }
        }
    }

    /// Decode a value of the given type from its encoded form.
    pub fn decode(value_type: AttrType, bytes: &[u8]) -> Result<AttrValue> {
        match value_type {
            AttrType::Bool => {
                if bytes.len() != 1 {
                    return Err(Error::InvalidArgument(
                        "bool attribute must be one byte".to_string(),
                    ));
                }
                Ok(AttrValue::Bool(bytes[0] != 0))
            }
            AttrType::Int64 => {
                let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
                    Error::InvalidArgument("int64 attribute must be eight bytes".to_string())
                })?;
                Ok(AttrValue::Int64(i64::from_ne_bytes(bytes)))
            }
            AttrType::Str => {
                let bytes = match bytes.split_last() {
                    Some((&0, head)) => head,
                    _ => {
                        return Err(Error::InvalidArgument(
                            "string attribute must be NUL-terminated".to_string(),
                        ))
                    }
                };
                let s = std::str::from_utf8(bytes).map_err(|_| {
                    Error::InvalidArgument("string attribute is not UTF-8".to_string())
                })?;
                Ok(AttrValue::Str(s.to_string()))
            }
            AttrType::Bin => Ok(AttrValue::Bin(bytes.to_vec())),
        }
    }
}

/// Whether an attribute can be read, written, or both. The mode may depend
/// on the socket's lifecycle (e.g. `xcm.local_addr` stops accepting writes
/// once the socket is bound).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AttrMode {
    pub fn readable(self) -> bool {
        matches!(self, AttrMode::ReadOnly | AttrMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, AttrMode::WriteOnly | AttrMode::ReadWrite)
    }
}

/// Descriptor of one attribute: name, value type and access mode.
#[derive(Debug, Clone)]
pub struct AttrSpec {
    pub name: String,
    pub value_type: AttrType,
    pub mode: AttrMode,
}

impl AttrSpec {
    pub fn new(name: &str, value_type: AttrType, mode: AttrMode) -> AttrSpec {
        AttrSpec {
            name: name.to_string(),
            value_type,
            mode,
        }
    }
}

/// The common attribute set for a socket type.
pub(crate) fn common_specs(sock_type: SocketType) -> Vec<AttrSpec> {
    let mut specs = vec![
        AttrSpec::new(ATTR_BLOCKING, AttrType::Bool, AttrMode::ReadWrite),
        AttrSpec::new(ATTR_TYPE, AttrType::Str, AttrMode::ReadOnly),
        AttrSpec::new(ATTR_TRANSPORT, AttrType::Str, AttrMode::ReadOnly),
        AttrSpec::new(ATTR_LOCAL_ADDR, AttrType::Str, AttrMode::ReadWrite),
    ];

    if sock_type == SocketType::Conn {
        specs.push(AttrSpec::new(
            ATTR_REMOTE_ADDR,
            AttrType::Str,
            AttrMode::ReadOnly,
        ));
        specs.push(AttrSpec::new(
            ATTR_MAX_MSG_SIZE,
            AttrType::Int64,
            AttrMode::ReadOnly,
        ));
        for name in [
            ATTR_TO_APP_MSGS,
            ATTR_TO_APP_BYTES,
            ATTR_FROM_APP_MSGS,
            ATTR_FROM_APP_BYTES,
            ATTR_TO_LOWER_MSGS,
            ATTR_TO_LOWER_BYTES,
            ATTR_FROM_LOWER_MSGS,
            ATTR_FROM_LOWER_BYTES,
        ] {
            specs.push(AttrSpec::new(name, AttrType::Int64, AttrMode::ReadOnly));
        }
    }

    specs
}

/// An ordered attribute map, as accepted by the `*_with` socket creation
/// variants.
#[derive(Debug, Clone, Default)]
pub struct AttrMap {
    entries: Vec<(String, AttrValue)>,
}

impl AttrMap {
    pub fn new() -> AttrMap {
        AttrMap::default()
    }

    /// Insert or replace an entry.
    pub fn set(&mut self, name: &str, value: AttrValue) -> &mut Self {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name.to_string(), value)),
        }
        self
    }

    pub fn set_bool(&mut self, name: &str, value: bool) -> &mut Self {
        self.set(name, AttrValue::Bool(value))
    }

    pub fn set_int64(&mut self, name: &str, value: i64) -> &mut Self {
        self.set(name, AttrValue::Int64(value))
    }

    pub fn set_str(&mut self, name: &str, value: &str) -> &mut Self {
        self.set(name, AttrValue::Str(value.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_encoding() {
        let mut buf = [0u8; 4];
        let n = AttrValue::Bool(true).encode_into(&mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            AttrValue::decode(AttrType::Bool, &buf[..n]).unwrap(),
            AttrValue::Bool(true)
        );
    }

    #[test]
    fn int64_encoding() {
        let mut buf = [0u8; 8];
        let n = AttrValue::Int64(-4711).encode_into(&mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(
            AttrValue::decode(AttrType::Int64, &buf[..n]).unwrap(),
            AttrValue::Int64(-4711)
        );
    }

    #[test]
    fn str_encoding_is_nul_terminated() {
        let mut buf = [0u8; 16];
        let n = AttrValue::Str("tcp".to_string())
            .encode_into(&mut buf)
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"tcp\0");
        assert_eq!(
            AttrValue::decode(AttrType::Str, &buf[..n]).unwrap(),
            AttrValue::Str("tcp".to_string())
        );
    }

    #[test]
    fn overflow_on_small_buffer() {
        let mut buf = [0u8; 2];
        let err = AttrValue::Str("overlong".to_string())
            .encode_into(&mut buf)
            .unwrap_err();
        assert!(matches!(err, Error::Overflow));

        let err = AttrValue::Int64(1).encode_into(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Overflow));
    }

    #[test]
    fn decode_length_checks() {
        assert!(AttrValue::decode(AttrType::Bool, &[1, 2]).is_err());
        assert!(AttrValue::decode(AttrType::Int64, &[0; 4]).is_err());
        assert!(AttrValue::decode(AttrType::Str, b"no-nul").is_err());
    }

    #[test]
    fn conn_specs_include_counters() {
        let specs = common_specs(SocketType::Conn);
        assert!(specs.iter().any(|s| s.name == ATTR_FROM_LOWER_BYTES));
        assert_eq!(specs.len(), 14);

        let specs = common_specs(SocketType::Server);
        assert_eq!(specs.len(), 4);
    }

    #[test]
    fn attr_map_replaces_by_name() {
        let mut map = AttrMap::new();
        map.set_bool(ATTR_BLOCKING, true);
        map.set_bool(ATTR_BLOCKING, false);
        assert_eq!(map.get(ATTR_BLOCKING), Some(&AttrValue::Bool(false)));
        assert_eq!(map.iter().count(), 1);
    }
}
