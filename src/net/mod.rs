use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::conn::SockKind;
use crate::{Error, Result};

mod listener;
pub(crate) mod socket;

pub(crate) use listener::Listener;

// -----------------------------------------------------------------------------
//     - Network scheme -
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Network {
    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    pub fn is_inet(self) -> bool {
        self != Network::Unix
    }
}

/// Split `scheme://host:port` into its network and address parts. A bare
/// `host:port` defaults to tcp.
pub(crate) fn parse_addr(addr: &str) -> Result<(Network, &str)> {
    let (scheme, address) = match addr.find("://") {
        Some(pos) => (&addr[..pos], &addr[pos + 3..]),
        None => ("tcp", addr),
    };

    let network = match scheme {
        "tcp" => Network::Tcp,
        "tcp4" => Network::Tcp4,
        "tcp6" => Network::Tcp6,
        "udp" => Network::Udp,
        "udp4" => Network::Udp4,
        "udp6" => Network::Udp6,
        "unix" => Network::Unix,
        _ => return Err(Error::InvalidAddr(addr.to_string())),
    };

    Ok((network, address))
}

/// Resolve `host:port`, respecting the scheme's address-family restriction.
pub(crate) fn resolve(network: Network, address: &str) -> Result<SocketAddr> {
    let addrs = address
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddr(address.to_string()))?;

    for addr in addrs {
        let keep = match network {
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
            _ => true,
        };
        if keep {
            return Ok(addr);
        }
    }

    Err(Error::InvalidAddr(address.to_string()))
}

// -----------------------------------------------------------------------------
//     - Dialing -
// -----------------------------------------------------------------------------
pub(crate) struct Dialed {
    pub fd: RawFd,
    pub kind: SockKind,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

pub(crate) fn dial(network: Network, address: &str) -> Result<Dialed> {
    match network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            let addr = resolve(network, address)?;
            let stream = TcpStream::connect(addr)?;
            stream.set_nonblocking(true)?;
            let local = stream.local_addr().ok();
            let remote = stream.peer_addr().ok();
            Ok(Dialed {
                fd: stream.into_raw_fd(),
                kind: SockKind::Stream,
                local,
                remote,
            })
        }
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            let addr = resolve(network, address)?;
            let bind_addr: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let sock = UdpSocket::bind(bind_addr)?;
            sock.connect(addr)?;
            sock.set_nonblocking(true)?;
            let local = sock.local_addr().ok();
            Ok(Dialed {
                fd: sock.into_raw_fd(),
                kind: SockKind::UdpConnected,
                local,
                remote: Some(addr),
            })
        }
        Network::Unix => {
            let stream = UnixStream::connect(address)?;
            stream.set_nonblocking(true)?;
            Ok(Dialed {
                fd: stream.into_raw_fd(),
                kind: SockKind::Stream,
                local: None,
                remote: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_prefix_selects_the_network() {
        assert_eq!(
            parse_addr("tcp://127.0.0.1:80").unwrap(),
            (Network::Tcp, "127.0.0.1:80")
        );
        assert_eq!(
            parse_addr("udp6://[::1]:53").unwrap(),
            (Network::Udp6, "[::1]:53")
        );
        assert_eq!(
            parse_addr("unix:///tmp/engine.sock").unwrap(),
            (Network::Unix, "/tmp/engine.sock")
        );
    }

    #[test]
    fn bare_address_defaults_to_tcp() {
        assert_eq!(
            parse_addr("127.0.0.1:9000").unwrap(),
            (Network::Tcp, "127.0.0.1:9000")
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            parse_addr("sctp://127.0.0.1:9000"),
            Err(Error::InvalidAddr(_))
        ));
    }

    #[test]
    fn family_restricted_schemes_filter_resolution() {
        let v4 = resolve(Network::Tcp4, "127.0.0.1:80").unwrap();
        assert!(v4.is_ipv4());
        assert!(resolve(Network::Tcp6, "127.0.0.1:80").is_err());
    }
}
