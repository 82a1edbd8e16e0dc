use std::io;

/// Errors surfaced by XCM socket operations.
///
/// Kinds are semantic; they map to errno codes only at the control-channel
/// wire boundary (see [`Error::to_errno`]).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A non-blocking operation was deferred; retry when the socket's fd
    /// signals readable.
    #[error("operation would block")]
    WouldBlock,

    /// The connection is no longer usable for sending.
    #[error("broken pipe")]
    BrokenPipe,

    /// No listener at the remote address.
    #[error("connection refused")]
    ConnectionRefused,

    /// The peer reset the connection.
    #[error("connection reset by peer")]
    Reset,

    /// A keepalive or user timeout expired.
    #[error("operation timed out")]
    TimedOut,

    /// Host or network unreachable.
    #[error("host or network unreachable")]
    Unreachable,

    /// Non-recoverable framing, certificate or handshake failure.
    #[error("protocol failure: {0}")]
    Protocol(String),

    /// Malformed address.
    #[error(transparent)]
    Addr(#[from] xcm_addr::AddrError),

    /// The address names a transport that is not registered.
    #[error("transport not available: {0}")]
    ProtoNotAvailable(String),

    /// The caller-supplied buffer is too small for the attribute value.
    #[error("buffer too small for attribute value")]
    Overflow,

    /// The operation is not permitted in the socket's current lifecycle.
    #[error("operation not permitted in this socket state")]
    Permission,

    /// The message exceeds the transport's maximum message size.
    #[error("message of {size} bytes exceeds maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// No such attribute.
    #[error("no such attribute: {0}")]
    NotFound(String),

    /// Invalid argument (wrong attribute value type or length).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error with no more specific semantic kind.
    #[error(transparent)]
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fieldless mirror of [`Error`], used for sticky-error bookkeeping and
/// kind checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    WouldBlock,
    BrokenPipe,
    ConnectionRefused,
    Reset,
    TimedOut,
    Unreachable,
    Protocol,
    Addr,
    ProtoNotAvailable,
    Overflow,
    Permission,
    MessageTooLarge,
    NotFound,
    InvalidArgument,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WouldBlock => ErrorKind::WouldBlock,
            Error::BrokenPipe => ErrorKind::BrokenPipe,
            Error::ConnectionRefused => ErrorKind::ConnectionRefused,
            Error::Reset => ErrorKind::Reset,
            Error::TimedOut => ErrorKind::TimedOut,
            Error::Unreachable => ErrorKind::Unreachable,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Addr(_) => ErrorKind::Addr,
            Error::ProtoNotAvailable(_) => ErrorKind::ProtoNotAvailable,
            Error::Overflow => ErrorKind::Overflow,
            Error::Permission => ErrorKind::Permission,
            Error::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_would_block(&self) -> bool {
        self.kind() == ErrorKind::WouldBlock
    }

    /// Map an I/O error to its semantic kind.
    pub(crate) fn from_io(err: io::Error) -> Error {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => Error::Reset,
            io::ErrorKind::BrokenPipe => Error::BrokenPipe,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::NotFound => Error::ConnectionRefused,
            _ => match err.raw_os_error() {
                Some(code) if code == libc::ENETUNREACH || code == libc::EHOSTUNREACH => {
                    Error::Unreachable
                }
                Some(libc::EPIPE) => Error::BrokenPipe,
                Some(libc::ETIMEDOUT) => Error::TimedOut,
                _ => Error::Io(err),
            },
        }
    }

    /// Errno rendering for the control-channel wire format.
    pub fn to_errno(&self) -> i32 {
        match self.kind() {
            ErrorKind::WouldBlock => libc::EAGAIN,
            ErrorKind::BrokenPipe => libc::EPIPE,
            ErrorKind::ConnectionRefused => libc::ECONNREFUSED,
            ErrorKind::Reset => libc::ECONNRESET,
            ErrorKind::TimedOut => libc::ETIMEDOUT,
            ErrorKind::Unreachable => libc::ENETUNREACH,
            ErrorKind::Protocol => libc::EPROTO,
            ErrorKind::Addr => libc::EINVAL,
            ErrorKind::ProtoNotAvailable => libc::ENOPROTOOPT,
            ErrorKind::Overflow => libc::EOVERFLOW,
            ErrorKind::Permission => libc::EACCES,
            ErrorKind::MessageTooLarge => libc::EMSGSIZE,
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::Io => libc::EIO,
        }
    }
}

impl From<ErrorKind> for Error {
    /// Reconstruct an error from a recorded kind. Used to repeat a sticky
    /// connection fault.
    fn from(kind: ErrorKind) -> Error {
        match kind {
            ErrorKind::WouldBlock => Error::WouldBlock,
            ErrorKind::BrokenPipe => Error::BrokenPipe,
            ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            ErrorKind::Reset => Error::Reset,
            ErrorKind::TimedOut => Error::TimedOut,
            ErrorKind::Unreachable => Error::Unreachable,
            ErrorKind::Protocol => Error::Protocol("connection failed".to_string()),
            ErrorKind::Addr => Error::InvalidArgument("bad address".to_string()),
            ErrorKind::ProtoNotAvailable => Error::ProtoNotAvailable(String::new()),
            ErrorKind::Overflow => Error::Overflow,
            ErrorKind::Permission => Error::Permission,
            ErrorKind::MessageTooLarge => Error::MessageTooLarge { size: 0, max: 0 },
            ErrorKind::NotFound => Error::NotFound(String::new()),
            ErrorKind::InvalidArgument => Error::InvalidArgument(String::new()),
            ErrorKind::Io => Error::Io(io::Error::other("I/O error")),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::from_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_mapping() {
        let err = Error::from_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_would_block());

        let err = Error::from_io(io::Error::from_raw_os_error(libc::ECONNREFUSED));
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);

        let err = Error::from_io(io::Error::from_raw_os_error(libc::EHOSTUNREACH));
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::WouldBlock.to_errno(), libc::EAGAIN);
        assert_eq!(Error::Overflow.to_errno(), libc::EOVERFLOW);
        assert_eq!(
            Error::NotFound("x".to_string()).to_errno(),
            libc::ENOENT
        );
    }

    #[test]
    fn sticky_roundtrip() {
        let kind = Error::Reset.kind();
        assert_eq!(Error::from(kind).kind(), ErrorKind::Reset);
    }
}
