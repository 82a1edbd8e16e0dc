//! The control-channel wire format.
//!
//! Fixed-size records over a message-preserving local IPC socket, one
//! record per datagram, integers in host byte order. Every record is
//! padded to [`MSG_SIZE`]; anything shorter or longer is malformed.

use bytes::{Buf, BufMut};

use crate::attr::AttrType;
use crate::error::{Error, Result};

/// Maximum attribute name length on the wire, including the NUL.
pub const CTL_ATTR_NAME_MAX: usize = 64;

/// Maximum encoded attribute value length on the wire.
pub const CTL_ATTR_VALUE_MAX: usize = 256;

/// Maximum number of attributes in a get-all confirmation.
pub const CTL_MAX_ATTRS: usize = 32;

const ATTR_WIRE_SIZE: usize = CTL_ATTR_NAME_MAX + 4 + 4 + CTL_ATTR_VALUE_MAX;

/// Size of every control-channel record.
pub const MSG_SIZE: usize = 8 + CTL_MAX_ATTRS * ATTR_WIRE_SIZE;

const TYPE_GET_ATTR_REQ: u32 = 1;
const TYPE_GET_ATTR_CFM: u32 = 2;
const TYPE_GET_ATTR_REJ: u32 = 3;
const TYPE_GET_ALL_ATTR_REQ: u32 = 4;
const TYPE_GET_ALL_ATTR_CFM: u32 = 5;

/// One attribute as it appears on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireAttr {
    pub name: String,
    pub value_type: AttrType,
    pub value: Vec<u8>,
}

/// A control-channel record.
#[derive(Debug, Clone, PartialEq)]
pub enum CtlMsg {
    GetAttrReq { name: String },
    GetAttrCfm { attr: WireAttr },
    GetAttrRej { errno: i32 },
    GetAllAttrReq,
    GetAllAttrCfm { attrs: Vec<WireAttr> },
}

fn put_fixed_str(buf: &mut Vec<u8>, s: &str, capacity: usize) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() + 1 > capacity || bytes.contains(&0) {
        return Err(Error::InvalidArgument(format!(
            "attribute name does not fit on the wire: {s}"
        )));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, capacity - bytes.len());
    Ok(())
}

fn put_attr(buf: &mut Vec<u8>, attr: &WireAttr) -> Result<()> {
    if attr.value.len() > CTL_ATTR_VALUE_MAX {
        return Err(Error::Overflow);
    }
    put_fixed_str(buf, &attr.name, CTL_ATTR_NAME_MAX)?;
    buf.put_u32_ne(attr.value_type.tag());
    buf.put_u32_ne(attr.value.len() as u32);
    buf.put_slice(&attr.value);
    buf.put_bytes(0, CTL_ATTR_VALUE_MAX - attr.value.len());
    Ok(())
}

/// Encode a record, padded to [`MSG_SIZE`].
pub fn encode(msg: &CtlMsg) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(MSG_SIZE);

    match msg {
        CtlMsg::GetAttrReq { name } => {
            buf.put_u32_ne(TYPE_GET_ATTR_REQ);
            put_fixed_str(&mut buf, name, CTL_ATTR_NAME_MAX)?;
        }
        CtlMsg::GetAttrCfm { attr } => {
            buf.put_u32_ne(TYPE_GET_ATTR_CFM);
            put_attr(&mut buf, attr)?;
        }
        CtlMsg::GetAttrRej { errno } => {
            buf.put_u32_ne(TYPE_GET_ATTR_REJ);
            buf.put_i32_ne(*errno);
        }
        CtlMsg::GetAllAttrReq => {
            buf.put_u32_ne(TYPE_GET_ALL_ATTR_REQ);
        }
        CtlMsg::GetAllAttrCfm { attrs } => {
            if attrs.len() > CTL_MAX_ATTRS {
                return Err(Error::Overflow);
            }
            buf.put_u32_ne(TYPE_GET_ALL_ATTR_CFM);
            buf.put_u32_ne(attrs.len() as u32);
            for attr in attrs {
                put_attr(&mut buf, attr)?;
            }
        }
    }

    buf.resize(MSG_SIZE, 0);
    Ok(buf)
}

fn malformed(what: &str) -> Error {
    Error::Protocol(format!("malformed control record: {what}"))
}

fn get_fixed_str(buf: &mut &[u8], capacity: usize) -> Result<String> {
    if buf.remaining() < capacity {
        return Err(malformed("truncated name"));
    }
    let raw = &buf[..capacity];
    let end = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("unterminated name"))?;
    let name = std::str::from_utf8(&raw[..end])
        .map_err(|_| malformed("non-UTF-8 name"))?
        .to_string();
    buf.advance(capacity);
    Ok(name)
}

fn get_attr(buf: &mut &[u8]) -> Result<WireAttr> {
    let name = get_fixed_str(buf, CTL_ATTR_NAME_MAX)?;
    if buf.remaining() < 8 {
        return Err(malformed("truncated attribute header"));
    }
    let value_type =
        AttrType::from_tag(buf.get_u32_ne()).ok_or_else(|| malformed("unknown value type"))?;
    let value_len = buf.get_u32_ne() as usize;
    if value_len > CTL_ATTR_VALUE_MAX || buf.remaining() < CTL_ATTR_VALUE_MAX {
        return Err(malformed("bad value length"));
    }
    let value = buf[..value_len].to_vec();
    buf.advance(CTL_ATTR_VALUE_MAX);
    Ok(WireAttr {
        name,
        value_type,
        value,
    })
}

/// Decode one record. The input must be exactly [`MSG_SIZE`] bytes.
pub fn decode(record: &[u8]) -> Result<CtlMsg> {
    if record.len() != MSG_SIZE {
        return Err(malformed("wrong record size"));
    }

    let mut buf = record;
    let msg_type = buf.get_u32_ne();

    match msg_type {
        TYPE_GET_ATTR_REQ => {
            let name = get_fixed_str(&mut buf, CTL_ATTR_NAME_MAX)?;
            Ok(CtlMsg::GetAttrReq { name })
        }
        TYPE_GET_ATTR_CFM => {
            let attr = get_attr(&mut buf)?;
            Ok(CtlMsg::GetAttrCfm { attr })
        }
        TYPE_GET_ATTR_REJ => {
            let errno = buf.get_i32_ne();
            Ok(CtlMsg::GetAttrRej { errno })
        }
        TYPE_GET_ALL_ATTR_REQ => Ok(CtlMsg::GetAllAttrReq),
        TYPE_GET_ALL_ATTR_CFM => {
            let count = buf.get_u32_ne() as usize;
            if count > CTL_MAX_ATTRS {
                return Err(malformed("attribute count out of bounds"));
            }
            let mut attrs = Vec::with_capacity(count);
            for _ in 0..count {
                attrs.push(get_attr(&mut buf)?);
            }
            Ok(CtlMsg::GetAllAttrCfm { attrs })
        }
        _ => Err(malformed("unknown record type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_attr_req_roundtrip() {
        let msg = CtlMsg::GetAttrReq {
            name: "xcm.transport".to_string(),
        };
        let wire = encode(&msg).unwrap();
        assert_eq!(wire.len(), MSG_SIZE);
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn get_attr_cfm_roundtrip() {
        let msg = CtlMsg::GetAttrCfm {
            attr: WireAttr {
                name: "xcm.type".to_string(),
                value_type: AttrType::Str,
                value: b"connection\0".to_vec(),
            },
        };
        let wire = encode(&msg).unwrap();
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn get_attr_rej_roundtrip() {
        let msg = CtlMsg::GetAttrRej {
            errno: libc::ENOENT,
        };
        let wire = encode(&msg).unwrap();
        assert_eq!(decode(&wire).unwrap(), msg);
    }

    #[test]
    fn get_all_roundtrip() {
        let attrs: Vec<WireAttr> = (0..CTL_MAX_ATTRS)
            .map(|i| WireAttr {
                name: format!("xcm.attr{i}"),
                value_type: AttrType::Int64,
                value: (i as i64).to_ne_bytes().to_vec(),
            })
            .collect();
        let msg = CtlMsg::GetAllAttrCfm { attrs };
        let wire = encode(&msg).unwrap();
        assert_eq!(decode(&wire).unwrap(), msg);

        let empty = CtlMsg::GetAllAttrCfm { attrs: Vec::new() };
        let wire = encode(&empty).unwrap();
        assert_eq!(decode(&wire).unwrap(), empty);
    }

    #[test]
    fn rejects_wrong_size() {
        let wire = encode(&CtlMsg::GetAllAttrReq).unwrap();
        assert!(decode(&wire[..MSG_SIZE - 1]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let mut wire = vec![0u8; MSG_SIZE];
        wire[..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(decode(&wire).is_err());
    }

    #[test]
    fn rejects_oversized_name() {
        let msg = CtlMsg::GetAttrReq {
            name: "x".repeat(CTL_ATTR_NAME_MAX),
        };
        assert!(encode(&msg).is_err());
    }

    #[test]
    fn rejects_oversized_value() {
        let msg = CtlMsg::GetAttrCfm {
            attr: WireAttr {
                name: "a".to_string(),
                value_type: AttrType::Bin,
                value: vec![0u8; CTL_ATTR_VALUE_MAX + 1],
            },
        };
        assert!(encode(&msg).is_err());
    }
}
