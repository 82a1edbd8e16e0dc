//! Client side of the control channel, used by introspection tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket as OsSocket, Type};

use crate::attr::AttrValue;
use crate::ctl::proto::{self, CtlMsg, MSG_SIZE};
use crate::error::{Error, Result};

/// A connected introspection client for one socket's control listener.
pub struct CtlClient {
    sock: OsSocket,
}

impl CtlClient {
    /// Connect to a control listener. Blocking; the kernel may queue the
    /// connection until the owner has a free client slot.
    pub fn connect(path: &Path) -> Result<CtlClient> {
        let sock = OsSocket::new(Domain::UNIX, Type::SEQPACKET, None).map_err(Error::from_io)?;
        sock.connect(&SockAddr::unix(path).map_err(Error::from_io)?)
            .map_err(Error::from_io)?;
        Ok(CtlClient { sock })
    }

    /// Bound the time spent waiting for a response.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.sock.set_read_timeout(timeout).map_err(Error::from_io)?;
        self.sock
            .set_write_timeout(timeout)
            .map_err(Error::from_io)?;
        Ok(())
    }

    /// Send a request record without waiting for the response.
    pub fn send_request(&mut self, request: &CtlMsg) -> Result<()> {
        use std::os::fd::AsRawFd;

        let wire = proto::encode(request)?;
        let n = crate::sys::send(self.sock.as_raw_fd(), &wire).map_err(Error::from_io)?;
        if n != wire.len() {
            return Err(Error::Protocol("short control request write".to_string()));
        }
        Ok(())
    }

    /// Receive one response record.
    pub fn recv_response(&mut self) -> Result<CtlMsg> {
        use std::os::fd::AsRawFd;

        let mut buf = vec![0u8; MSG_SIZE];
        let n = crate::sys::recv(self.sock.as_raw_fd(), &mut buf).map_err(Error::from_io)?;
        if n == 0 {
            return Err(Error::Reset);
        }
        proto::decode(&buf[..n])
    }

    fn roundtrip(&mut self, request: &CtlMsg) -> Result<CtlMsg> {
        self.send_request(request)?;
        self.recv_response()
    }

    /// Read one attribute of the owning socket.
    pub fn get_attr(&mut self, name: &str) -> Result<AttrValue> {
        let response = self.roundtrip(&CtlMsg::GetAttrReq {
            name: name.to_string(),
        })?;

        match response {
            CtlMsg::GetAttrCfm { attr } => AttrValue::decode(attr.value_type, &attr.value),
            CtlMsg::GetAttrRej { errno } => {
                Err(Error::from_io(std::io::Error::from_raw_os_error(errno)))
            }
            _ => Err(Error::Protocol(
                "unexpected control response record".to_string(),
            )),
        }
    }

    /// Read all attributes of the owning socket.
    pub fn get_all_attrs(&mut self) -> Result<Vec<(String, AttrValue)>> {
        let response = self.roundtrip(&CtlMsg::GetAllAttrReq)?;

        match response {
            CtlMsg::GetAllAttrCfm { attrs } => attrs
                .iter()
                .map(super::decode_attr)
                .collect::<Result<Vec<_>>>(),
            _ => Err(Error::Protocol(
                "unexpected control response record".to_string(),
            )),
        }
    }
}

/// One socket found in the control directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlEntry {
    pub pid: u32,
    pub sock_id: i64,
    pub path: PathBuf,
}

/// Enumerate control listeners in a directory. Entries whose names do not
/// follow the `<pid>-<sock_id>` convention are skipped.
pub fn enumerate(dir: &Path) -> Result<Vec<CtlEntry>> {
    let mut entries = Vec::new();

    for entry in std::fs::read_dir(dir).map_err(Error::from_io)? {
        let entry = entry.map_err(Error::from_io)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some((pid, sock_id)) = name.split_once('-') else {
            continue;
        };
        let (Ok(pid), Ok(sock_id)) = (pid.parse::<u32>(), sock_id.parse::<i64>()) else {
            continue;
        };
        entries.push(CtlEntry {
            pid,
            sock_id,
            path: entry.path(),
        });
    }

    entries.sort_by_key(|e| (e.pid, e.sock_id));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_parses_names() {
        let dir = std::env::temp_dir().join(format!("xcm-ctl-enum-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        std::fs::write(dir.join("1234-7"), b"").unwrap();
        std::fs::write(dir.join("99-0"), b"").unwrap();
        std::fs::write(dir.join("not-a-listener-name"), b"").unwrap();
        std::fs::write(dir.join("unrelated"), b"").unwrap();

        let entries = enumerate(&dir).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].pid, entries[0].sock_id), (99, 0));
        assert_eq!((entries[1].pid, entries[1].sock_id), (1234, 7));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
