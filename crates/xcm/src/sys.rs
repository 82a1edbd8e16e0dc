//! Thin wrappers around the socket syscalls the transports share.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use socket2::{Domain, SockAddr, Socket, Type};

/// Offset of `sun_path` within `sockaddr_un`.
const SUN_PATH_OFFSET: usize = mem::size_of::<libc::sa_family_t>();

/// Create a non-blocking `SOCK_SEQPACKET` Unix socket.
pub(crate) fn seqpacket_socket() -> io::Result<Socket> {
    let sock = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

/// Build a Linux abstract-namespace socket address from a name.
///
/// The name occupies `sun_path[1..]`; `sun_path[0]` stays NUL.
pub(crate) fn abstract_sockaddr(name: &str) -> io::Result<SockAddr> {
    let bytes = name.as_bytes();

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // SAFETY: sockaddr_un fits within sockaddr_storage.
    let sun = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_un>() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;

    if bytes.len() + 1 > sun.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "abstract socket name too long",
        ));
    }
    for (i, b) in bytes.iter().enumerate() {
        sun.sun_path[i + 1] = *b as libc::c_char;
    }

    let len = (SUN_PATH_OFFSET + 1 + bytes.len()) as libc::socklen_t;
    // SAFETY: storage holds an initialized sockaddr_un of the given length.
    Ok(unsafe { SockAddr::new(storage, len) })
}

/// Render the local address of a bound Unix socket fd.
///
/// Returns the abstract name (without the leading NUL) or the filesystem
/// path; an unnamed socket yields an empty string.
pub(crate) fn unix_sockname(fd: RawFd) -> io::Result<String> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;

    // SAFETY: addr and len are valid writable pointers for the given sizes.
    let rc = unsafe {
        libc::getsockname(
            fd,
            (&mut addr as *mut libc::sockaddr_un).cast::<libc::sockaddr>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let len = len as usize;
    if len <= SUN_PATH_OFFSET {
        return Ok(String::new());
    }

    let path_len = len - SUN_PATH_OFFSET;
    let path: Vec<u8> = addr.sun_path[..path_len]
        .iter()
        .map(|&c| c as u8)
        .collect();

    let name = if path[0] == 0 {
        // Abstract namespace: name starts after the leading NUL.
        &path[1..]
    } else {
        // Filesystem path: strip the trailing NUL if present.
        match path.iter().position(|&b| b == 0) {
            Some(pos) => &path[..pos],
            None => &path[..],
        }
    };

    Ok(String::from_utf8_lossy(name).into_owned())
}

/// Round-trip time and retransmit counters from `TCP_INFO`.
pub(crate) struct TcpInfo {
    pub(crate) rtt_us: u32,
    pub(crate) total_retrans: u32,
}

pub(crate) fn tcp_info(fd: RawFd) -> io::Result<TcpInfo> {
    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;

    // SAFETY: info and len are valid writable pointers for the given sizes.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            (&mut info as *mut libc::tcp_info).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpInfo {
        rtt_us: info.tcpi_rtt,
        total_retrans: info.tcpi_total_retrans,
    })
}

/// Receive one datagram into `buf`.
pub(crate) fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for writes of its length.
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

/// Send one datagram from `buf`. `MSG_NOSIGNAL` keeps a dead peer from
/// raising SIGPIPE.
pub(crate) fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for reads of its length.
    let rc = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn abstract_addr_roundtrip() {
        let listener = seqpacket_socket().unwrap();
        let name = format!("xcm-sys-test-{}", std::process::id());
        let addr = abstract_sockaddr(&name).unwrap();
        listener.bind(&addr).unwrap();

        assert_eq!(unix_sockname(listener.as_raw_fd()).unwrap(), name);
    }

    #[test]
    fn abstract_addr_rejects_long_name() {
        let name = "x".repeat(200);
        assert!(abstract_sockaddr(&name).is_err());
    }

    #[test]
    fn seqpacket_preserves_message_boundaries() {
        let listener = seqpacket_socket().unwrap();
        let name = format!("xcm-sys-msg-{}", std::process::id());
        let addr = abstract_sockaddr(&name).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen(1).unwrap();

        let client = seqpacket_socket().unwrap();
        client.connect(&addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        send(client.as_raw_fd(), b"one").unwrap();
        send(client.as_raw_fd(), b"two").unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(recv(server.as_raw_fd(), &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"one");
        assert_eq!(recv(server.as_raw_fd(), &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"two");
    }
}
