use std::fmt;
use std::io;

use libc::__errno_location as errno_loc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Underlying syscall or socket failure.
    Io(io::Error),
    /// The sentinel unwinding a reactor's poll loop during engine shutdown.
    Shutdown,
    /// A client write was issued before the connection-established callback fired.
    NotReady,
    /// The target reactor is gone and can no longer accept injected jobs.
    Disconnected,
    /// The address string could not be parsed or resolved.
    InvalidAddr(String),
}

impl Error {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Shutdown => write!(f, "engine is shutting down"),
            Error::NotReady => write!(f, "connection not yet established"),
            Error::Disconnected => write!(f, "reactor is no longer running"),
            Error::InvalidAddr(addr) => write!(f, "invalid address: {}", addr),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub fn os_err() -> io::Error {
    let err_num = unsafe { *errno_loc() };
    io::Error::from_raw_os_error(err_num)
}

pub(crate) fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
