//! Message framing for byte-stream transports.
//!
//! A 4-byte big-endian length prefix turns the TCP (or TLS plaintext)
//! byte stream back into discrete messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub(crate) const HEADER_SIZE: usize = 4;

/// Largest message accepted by the stream transports.
pub(crate) const MAX_MSG: usize = 65535;

/// Append one framed message to `dst`.
pub(crate) fn encode_msg(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::InvalidArgument(
            "zero-length messages are not allowed".to_string(),
        ));
    }
    if payload.len() > MAX_MSG {
        return Err(Error::MessageTooLarge {
            size: payload.len(),
            max: MAX_MSG,
        });
    }

    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Extract one complete message from `src`, if present.
///
/// Returns `Ok(None)` until a complete frame has accumulated. An
/// advertised length beyond [`MAX_MSG`] is a non-recoverable protocol
/// error.
pub(crate) fn decode_msg(src: &mut BytesMut) -> Result<Option<Bytes>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes(src[..HEADER_SIZE].try_into().unwrap()) as usize;
    if len == 0 || len > MAX_MSG {
        return Err(Error::Protocol(format!("bad frame length {len}")));
    }

    if src.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Whether `src` starts with a complete frame.
pub(crate) fn has_complete_msg(src: &BytesMut) -> bool {
    if src.len() < HEADER_SIZE {
        return false;
    }
    let len = u32::from_be_bytes(src[..HEADER_SIZE].try_into().unwrap()) as usize;
    len > 0 && len <= MAX_MSG && src.len() >= HEADER_SIZE + len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut buf = BytesMut::new();
        encode_msg(b"hello", &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 5);

        let msg = decode_msg(&mut buf).unwrap().unwrap();
        assert_eq!(msg.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frames() {
        let mut buf = BytesMut::new();
        encode_msg(b"partial", &mut buf).unwrap();
        let mut short = BytesMut::from(&buf[..HEADER_SIZE + 3]);

        assert!(!has_complete_msg(&short));
        assert!(decode_msg(&mut short).unwrap().is_none());

        let mut header_only = BytesMut::from(&buf[..2]);
        assert!(decode_msg(&mut header_only).unwrap().is_none());
    }

    #[test]
    fn multiple_messages_in_sequence() {
        let mut buf = BytesMut::new();
        encode_msg(b"one", &mut buf).unwrap();
        encode_msg(b"two", &mut buf).unwrap();

        assert!(has_complete_msg(&buf));
        assert_eq!(decode_msg(&mut buf).unwrap().unwrap().as_ref(), b"one");
        assert!(has_complete_msg(&buf));
        assert_eq!(decode_msg(&mut buf).unwrap().unwrap().as_ref(), b"two");
        assert!(!has_complete_msg(&buf));
    }

    #[test]
    fn rejects_oversized_message() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_MSG + 1];
        assert!(matches!(
            encode_msg(&payload, &mut buf),
            Err(Error::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn rejects_empty_message() {
        let mut buf = BytesMut::new();
        assert!(encode_msg(b"", &mut buf).is_err());
    }

    #[test]
    fn rejects_bad_advertised_length() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MSG + 1) as u32);
        buf.put_slice(b"x");
        assert!(decode_msg(&mut buf).is_err());

        let mut zero = BytesMut::new();
        zero.put_u32(0);
        assert!(decode_msg(&mut zero).is_err());
    }
}
