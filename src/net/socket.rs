use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{c_int, c_void, sockaddr, socklen_t};

use crate::errors::os_err;
use crate::{res, Result};

fn setsockopt<T>(fd: RawFd, level: c_int, opt: c_int, payload: T) -> Result<()> {
    unsafe {
        let payload = &payload as *const T as *const c_void;
        let _ = res!(libc::setsockopt(
            fd,
            level,
            opt,
            payload,
            mem::size_of::<T>() as socklen_t,
        ));
        Ok(())
    }
}

// -----------------------------------------------------------------------------
//     - Listening sockets -
// -----------------------------------------------------------------------------
pub(crate) fn listen_tcp(addr: &SocketAddr, reuse_port: bool) -> Result<RawFd> {
    let fd = inet_socket(addr, libc::SOCK_STREAM, reuse_port)?;
    let (storage, len) = sock_addr(addr);
    let _ = res!(unsafe { libc::bind(fd, &storage as *const _ as *const sockaddr, len) });
    let _ = res!(unsafe { libc::listen(fd, 128) });
    Ok(fd)
}

pub(crate) fn bind_udp(addr: &SocketAddr, reuse_port: bool) -> Result<RawFd> {
    let fd = inet_socket(addr, libc::SOCK_DGRAM, reuse_port)?;
    let (storage, len) = sock_addr(addr);
    let _ = res!(unsafe { libc::bind(fd, &storage as *const _ as *const sockaddr, len) });
    Ok(fd)
}

fn inet_socket(addr: &SocketAddr, kind: c_int, reuse_port: bool) -> Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };

    let flags = kind | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    let fd = res!(unsafe { libc::socket(family, flags, 0) });

    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as c_int)?;
    if reuse_port {
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1 as c_int)?;
    }

    Ok(fd)
}

// -----------------------------------------------------------------------------
//     - Socket options -
// -----------------------------------------------------------------------------
pub(crate) fn set_keep_alive(fd: RawFd, dur: Duration) -> Result<()> {
    let secs = dur.as_secs().max(1) as c_int;
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1 as c_int)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs)?;
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, secs)?;
    Ok(())
}

pub(crate) fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

// -----------------------------------------------------------------------------
//     - Accept / datagram I/O -
// -----------------------------------------------------------------------------
pub(crate) fn accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let conn_fd = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if conn_fd == -1 {
        return Err(os_err());
    }

    Ok((conn_fd, to_socket_addr(&storage)))
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Peer)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
        )
    };
    if n == -1 {
        return Err(os_err());
    }

    Ok((n as usize, Peer { storage, len }))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], peer: &Peer) -> io::Result<usize> {
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            0,
            &peer.storage as *const _ as *const sockaddr,
            peer.len,
        )
    };
    if n == -1 {
        return Err(os_err());
    }
    Ok(n as usize)
}

pub(crate) fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let res = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len)
    };
    if res == -1 {
        return None;
    }
    to_socket_addr(&storage)
}

// -----------------------------------------------------------------------------
//     - Peer -
// -----------------------------------------------------------------------------
/// The source address of the datagram currently being processed.
#[derive(Clone, Copy)]
pub(crate) struct Peer {
    storage: libc::sockaddr_storage,
    len: socklen_t,
}

impl Peer {
    pub fn addr(&self) -> Option<SocketAddr> {
        to_socket_addr(&self.storage)
    }
}

// -----------------------------------------------------------------------------
//     - Address conversion -
// -----------------------------------------------------------------------------
fn sock_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

pub(crate) fn to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
