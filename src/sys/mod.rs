pub(crate) mod epoll;
pub(crate) mod evented;

pub use epoll::Interest;
pub use evented::Evented;
