use crate::{res, Result};

// -----------------------------------------------------------------------------
//     - Epoll abstraction -
//     Level-triggered. Interest changes drive the read/write priority
//     protocol in the event loop, so there is no one-shot rearming here.
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum Interest {
    Read,
    ReadWrite,
}

impl Interest {
    fn to_u32(self) -> u32 {
        match self {
            Interest::Read => Flags::Read as u32 | Flags::RHup as u32,
            Interest::ReadWrite => {
                Flags::Read as u32 | Flags::Write as u32 | Flags::RHup as u32
            }
        }
    }
}

// -----------------------------------------------------------------------------
//     - Create / Close -
// -----------------------------------------------------------------------------
pub(crate) fn create() -> Result<i32> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    Ok(res!(fd))
}

pub(crate) fn close(fd: i32) {
    unsafe { libc::close(fd) };
}

// -----------------------------------------------------------------------------
//     - Epoll control -
// -----------------------------------------------------------------------------
pub(crate) fn add(epoll_fd: i32, fd: i32, interest: Interest) -> Result<()> {
    epoll_control(epoll_fd, fd, interest, libc::EPOLL_CTL_ADD)
}

pub(crate) fn modify(epoll_fd: i32, fd: i32, interest: Interest) -> Result<()> {
    epoll_control(epoll_fd, fd, interest, libc::EPOLL_CTL_MOD)
}

pub(crate) fn delete(epoll_fd: i32, fd: i32) -> Result<()> {
    let status = unsafe {
        libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
    };
    let _ = res!(status);
    Ok(())
}

fn epoll_control(epoll_fd: i32, fd: i32, interest: Interest, op: i32) -> Result<()> {
    let mut event = libc::epoll_event {
        events: interest.to_u32(),
        u64: fd as u64,
    };

    let status = unsafe { libc::epoll_ctl(epoll_fd, op, fd, &mut event as *mut libc::epoll_event) };
    let _ = res!(status);
    Ok(())
}

// -----------------------------------------------------------------------------
//     - Epoll wait -
// -----------------------------------------------------------------------------
pub(crate) fn wait(epoll_fd: i32, events: &mut [libc::epoll_event], timeout: i32) -> Result<usize> {
    let result = unsafe {
        libc::epoll_wait(epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout)
    };
    let result = res!(result) as usize;
    Ok(result)
}

// -----------------------------------------------------------------------------
//     - Flags -
// -----------------------------------------------------------------------------
#[repr(u32)]
pub enum Flags {
    Read = libc::EPOLLIN as u32,
    Write = libc::EPOLLOUT as u32,
    UrgentRead = libc::EPOLLPRI as u32,
    Error = libc::EPOLLERR as u32,
    Hup = libc::EPOLLHUP as u32,
    RHup = libc::EPOLLRDHUP as u32,
}

impl Flags {
    pub(crate) fn contains(val: u32, flag: Flags) -> bool {
        let flag = flag as u32;
        0 != (val & flag)
    }
}

/// Events that count as inbound-readable: data, urgent data, peer hangup
/// and error conditions all surface through a read attempt.
pub(crate) fn readable(val: u32) -> bool {
    Flags::contains(val, Flags::Read)
        || Flags::contains(val, Flags::UrgentRead)
        || Flags::contains(val, Flags::RHup)
        || Flags::contains(val, Flags::Hup)
        || Flags::contains(val, Flags::Error)
}

pub(crate) fn writable(val: u32) -> bool {
    Flags::contains(val, Flags::Write)
}
