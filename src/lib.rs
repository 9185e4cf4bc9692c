//! Event-driven network engine serving and dialing TCP, UDP and
//! Unix-socket connections with a fixed pool of single-threaded epoll
//! reactors. Connections never migrate between reactors, all per-socket
//! state is confined to the owning reactor thread, and every cross-thread
//! request travels through that reactor's job queue.

mod client;
mod codec;
mod conn;
mod errors;
mod eventloop;
mod handler;
mod net;
mod options;
mod poller;
mod ring;
mod server;
mod shutdown;
mod sys;

pub use client::{connect, Client};
pub use codec::{BuiltInFrameCodec, Codec, LengthFieldCodec};
pub use conn::{Conn, ConnHandle};
pub use errors::{os_err, Error, Result};
pub use handler::{Action, EventHandler};
pub use options::Options;
pub use poller::Event;
pub use ring::RingBuffer;
pub use server::{serve, Server};

#[macro_export]
macro_rules! res {
    ($e:expr) => {
        match $e {
            -1 => return Err($crate::Error::Io($crate::os_err())),
            val => val,
        }
    };
}
