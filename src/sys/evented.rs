use std::os::unix::io::{AsRawFd, RawFd};

use libc::eventfd;

use crate::{res, Result};

/// An eventfd used to interrupt a blocked `epoll_wait` from another thread.
///
/// Shared behind an `Arc` between the poller and its triggers; the
/// descriptor closes only when the last holder drops, so a poke can never
/// land on a closed or reused fd.
#[derive(Debug)]
pub struct Evented {
    fd: RawFd,
}

impl Evented {
    pub fn new() -> Result<Self> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = res!(unsafe { eventfd(0, flags) });
        Ok(Self { fd })
    }

    /// Bump the counter so the owning poller wakes up. Safe from any thread.
    pub fn poke(&self) -> Result<()> {
        let val = 1u64.to_ne_bytes();
        let res = unsafe { libc::write(self.fd, val.as_ptr() as *const libc::c_void, 8) };
        let _ = res!(res);
        Ok(())
    }

    /// Reset the counter after a wake. Reading an unfired eventfd returns
    /// EAGAIN, which is fine to ignore.
    pub fn consume(&self) {
        let mut buf = [0u8; 8];
        unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8) };
    }
}

impl Drop for Evented {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl AsRawFd for Evented {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}
