use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::PathBuf;

use super::socket;
use super::{resolve, Network};
use crate::Result;

// -----------------------------------------------------------------------------
//     - Listener -
// -----------------------------------------------------------------------------
/// A bound, non-blocking listening socket. Stream listeners are driven by
/// an accept reactor; datagram listeners are handed to an event loop whole.
pub(crate) enum Listener {
    Tcp { fd: RawFd, local: SocketAddr },
    Udp { fd: RawFd, local: SocketAddr },
    Unix { fd: RawFd, path: PathBuf },
}

impl Listener {
    pub fn bind(network: Network, address: &str, reuse_port: bool) -> Result<Self> {
        match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let addr = resolve(network, address)?;
                let fd = socket::listen_tcp(&addr, reuse_port)?;
                let local = socket::local_addr(fd).unwrap_or(addr);
                Ok(Listener::Tcp { fd, local })
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                let addr = resolve(network, address)?;
                let fd = socket::bind_udp(&addr, reuse_port)?;
                let local = socket::local_addr(fd).unwrap_or(addr);
                Ok(Listener::Udp { fd, local })
            }
            Network::Unix => {
                let path = PathBuf::from(address);
                // A stale socket file from a previous run blocks the bind.
                let _ = std::fs::remove_file(&path);
                let listener = StdUnixListener::bind(&path)?;
                listener.set_nonblocking(true)?;
                Ok(Listener::Unix {
                    fd: listener.into_raw_fd(),
                    path,
                })
            }
        }
    }

    pub fn fd(&self) -> RawFd {
        match self {
            Listener::Tcp { fd, .. } | Listener::Udp { fd, .. } | Listener::Unix { fd, .. } => *fd,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp { local, .. } | Listener::Udp { local, .. } => Some(*local),
            Listener::Unix { .. } => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        !matches!(self, Listener::Udp { .. })
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Listener::Tcp { .. })
    }

    /// Accept one pending connection. Only valid on stream listeners.
    pub fn accept(&self) -> io::Result<(RawFd, Option<SocketAddr>)> {
        debug_assert!(self.is_stream());
        socket::accept(self.fd())
    }

    /// Surrender ownership of the descriptor to the caller. Used for
    /// datagram sockets, which live in an event loop's connection table.
    pub fn into_raw_fd(self) -> RawFd {
        let fd = self.fd();
        std::mem::forget(self);
        fd
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        socket::close(self.fd());
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
