//! Per-socket event-fd plumbing.
//!
//! Every socket owns one epoll instance; its fd is what the user plugs into
//! their own event loop. Transports register kernel fds on it with masks
//! derived from socket state, so the epoll fd itself turns readable exactly
//! when the socket can make progress. Level-triggered throughout.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tracing::warn;

pub(crate) const IN: u32 = libc::EPOLLIN as u32;
pub(crate) const OUT: u32 = libc::EPOLLOUT as u32;

/// An owned epoll instance: the event fd of one socket. Opaque to users;
/// transports register their kernel fds on it.
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Epoll> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: epoll_create1 returned a fresh fd owned by no one else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Epoll { fd })
    }

    /// The underlying fd, as handed to the user's event loop.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: self.fd is a live epoll fd and ev points to a valid event.
        let rc = unsafe { libc::epoll_ctl(self.raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub(crate) fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub(crate) fn del(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Wait until any registered fd is ready. A negative timeout blocks
    /// indefinitely. Returns whether any event fired.
    pub(crate) fn wait(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
        loop {
            // SAFETY: the event array is valid for writes of its length.
            let rc = unsafe {
                libc::epoll_wait(self.raw_fd(), events.as_mut_ptr(), events.len() as i32, timeout_ms)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }
}

/// Tracks one kernel fd's registration on a shared epoll instance.
///
/// `set(0)` deregisters; a later non-zero mask re-adds. Dropping the
/// registration removes the fd from the epoll set.
pub(crate) struct Registration {
    epoll: Arc<Epoll>,
    fd: RawFd,
    events: u32,
}

impl Registration {
    pub(crate) fn new(epoll: Arc<Epoll>, fd: RawFd) -> Registration {
        Registration {
            epoll,
            fd,
            events: 0,
        }
    }

    pub(crate) fn set(&mut self, events: u32) {
        if events == self.events {
            return;
        }

        let rc = if self.events == 0 {
            self.epoll.add(self.fd, events)
        } else if events == 0 {
            self.epoll.del(self.fd)
        } else {
            self.epoll.modify(self.fd, events)
        };

        if let Err(err) = rc {
            // Deregistering an fd the kernel already forgot (closed before
            // the registration was dropped) is not a failure.
            if events == 0
                && matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT))
            {
                self.events = 0;
                return;
            }
            warn!(fd = self.fd, events, "epoll registration failed: {err}");
            return;
        }

        self.events = events;
    }

    pub(crate) fn clear(&mut self) {
        self.set(0);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.clear();
    }
}

/// User-space readiness signal (eventfd).
///
/// Covers progress the kernel cannot see, e.g. a complete message already
/// buffered in the transport's receive path. Registered read-only on the
/// socket's epoll instance; armed means the epoll fd reports readable.
pub(crate) struct Trigger {
    fd: OwnedFd,
    reg: Registration,
    armed: bool,
}

impl Trigger {
    pub(crate) fn new(epoll: Arc<Epoll>) -> io::Result<Trigger> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: eventfd returned a fresh fd owned by no one else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let raw = fd.as_raw_fd();
        let mut reg = Registration::new(epoll, raw);
        reg.set(IN);
        Ok(Trigger {
            fd,
            reg,
            armed: false,
        })
    }

    pub(crate) fn arm(&mut self) {
        if self.armed {
            return;
        }
        let value: u64 = 1;
        // SAFETY: value is a valid 8-byte buffer for the eventfd write.
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&value as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            warn!("failed to arm readiness trigger: {}", io::Error::last_os_error());
            return;
        }
        self.armed = true;
    }

    pub(crate) fn disarm(&mut self) {
        if !self.armed {
            return;
        }
        let mut value: u64 = 0;
        // SAFETY: value is a valid 8-byte buffer for the eventfd read.
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("failed to disarm readiness trigger: {err}");
                return;
            }
        }
        self.armed = false;
    }

    pub(crate) fn set(&mut self, armed: bool) {
        if armed {
            self.arm();
        } else {
            self.disarm();
        }
    }

    /// Deregister from the epoll instance without closing the eventfd.
    pub(crate) fn deactivate(&mut self) {
        self.reg.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoll_reports_trigger() {
        let epoll = Arc::new(Epoll::new().unwrap());
        let mut trigger = Trigger::new(Arc::clone(&epoll)).unwrap();

        assert!(!epoll.wait(0).unwrap());

        trigger.arm();
        assert!(epoll.wait(0).unwrap());

        trigger.disarm();
        assert!(!epoll.wait(0).unwrap());
    }

    #[test]
    fn arm_is_idempotent() {
        let epoll = Arc::new(Epoll::new().unwrap());
        let mut trigger = Trigger::new(Arc::clone(&epoll)).unwrap();

        trigger.arm();
        trigger.arm();
        trigger.disarm();
        assert!(!epoll.wait(0).unwrap());
    }

    #[test]
    fn registration_set_and_clear() {
        let epoll = Arc::new(Epoll::new().unwrap());
        let (left, _right) = std::os::unix::net::UnixStream::pair().unwrap();
        let raw = left.as_raw_fd();

        let mut reg = Registration::new(Arc::clone(&epoll), raw);
        reg.set(OUT);
        // A connected stream socket is immediately writable.
        assert!(epoll.wait(0).unwrap());

        reg.clear();
        assert!(!epoll.wait(0).unwrap());
    }
}
