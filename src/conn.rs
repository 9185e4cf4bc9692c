use std::any::Any;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::codec::Codec;
use crate::eventloop::Job;
use crate::net::socket::Peer;
use crate::poller::Trigger;
use crate::ring::RingBuffer;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SockKind {
    /// TCP or Unix stream socket.
    Stream,
    /// Unconnected datagram socket owned by a server loop; replies go out
    /// via sendto to the current datagram's source.
    Udp,
    /// Connected datagram socket (client side); reads and writes like a
    /// stream, one datagram per call.
    UdpConnected,
}

// -----------------------------------------------------------------------------
//     - Conn -
// -----------------------------------------------------------------------------
/// Per-socket buffering and framing state.
///
/// A `Conn` lives in exactly one event loop's connection table and all of
/// its buffers and flags are only ever touched on that loop's thread.
/// Other threads interact with it through a [`ConnHandle`], which routes
/// every request through the owning loop's job queue.
pub struct Conn {
    pub(crate) fd: RawFd,
    pub(crate) kind: SockKind,
    pub(crate) open: bool,
    pub(crate) inbound: RingBuffer,
    pub(crate) outbound: RingBuffer,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) peer: Option<Peer>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    ctx: Option<Box<dyn Any + Send>>,
    trigger: Trigger<Job>,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        kind: SockKind,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        codec: Arc<dyn Codec>,
        trigger: Trigger<Job>,
    ) -> Self {
        Self {
            fd,
            kind,
            open: true,
            inbound: RingBuffer::new(),
            outbound: RingBuffer::new(),
            codec,
            peer: None,
            local,
            remote,
            ctx: None,
            trigger,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self.kind {
            SockKind::Udp => self.peer.as_ref().and_then(|p| p.addr()),
            _ => self.remote,
        }
    }

    // -------------------------------------------------------------------------
    //     - User context -
    // -------------------------------------------------------------------------
    pub fn set_context<T: Any + Send>(&mut self, ctx: T) {
        self.ctx = Some(Box::new(ctx));
    }

    pub fn context<T: Any>(&self) -> Option<&T> {
        self.ctx.as_ref().and_then(|c| c.downcast_ref())
    }

    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.ctx.as_mut().and_then(|c| c.downcast_mut())
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send>> {
        self.ctx.take()
    }

    // -------------------------------------------------------------------------
    //     - Inbound reads -
    // -------------------------------------------------------------------------
    /// Everything currently buffered, without advancing the read position.
    pub fn read(&self) -> Vec<u8> {
        self.inbound.bytes()
    }

    /// Consume exactly `n` bytes, or nothing when fewer are buffered.
    /// Callers re-check on the next inbound event.
    pub fn read_n(&mut self, n: usize) -> Option<Vec<u8>> {
        self.inbound.read_n(n)
    }

    /// One complete frame per the active codec, or `None` while the frame
    /// is still incomplete. Incomplete attempts leave every byte in place.
    pub fn read_frame(&mut self) -> Option<Vec<u8>> {
        let codec = self.codec.clone();
        codec.decode(self)
    }

    /// Discard all buffered inbound bytes.
    pub fn reset_buffer(&mut self) {
        self.inbound.clear();
    }

    pub fn buffer_length(&self) -> usize {
        self.inbound.len()
    }

    pub fn inbound_buffer(&self) -> &RingBuffer {
        &self.inbound
    }

    pub fn inbound_buffer_mut(&mut self) -> &mut RingBuffer {
        &mut self.inbound
    }

    pub fn outbound_buffer(&self) -> &RingBuffer {
        &self.outbound
    }

    pub fn outbound_buffer_mut(&mut self) -> &mut RingBuffer {
        &mut self.outbound
    }

    /// A cheap cross-thread handle for asynchronous writes and wakes.
    pub fn handle(&self) -> ConnHandle {
        ConnHandle {
            fd: self.fd,
            trigger: self.trigger.clone(),
        }
    }
}

// -----------------------------------------------------------------------------
//     - ConnHandle -
// -----------------------------------------------------------------------------
/// Cross-thread surface of one connection.
///
/// Neither call touches the connection from the calling thread: both
/// package the request as a job and inject it into the owning loop, which
/// preserves the single-writer discipline. Jobs run in FIFO injection
/// order relative to each other.
#[derive(Clone)]
pub struct ConnHandle {
    fd: RawFd,
    trigger: Trigger<Job>,
}

impl ConnHandle {
    /// Queue `buf` for writing on the owning loop. The loop encodes it,
    /// attempts an immediate non-blocking send and buffers any remainder.
    pub fn async_write(&self, buf: impl Into<Vec<u8>>) -> Result<()> {
        self.trigger.trigger(Job::Write {
            fd: self.fd,
            buf: buf.into(),
        })
    }

    /// Synthesize a data-arrived dispatch for this connection even though
    /// no new bytes came in.
    pub fn wake(&self) -> Result<()> {
        self.trigger.trigger(Job::Wake { fd: self.fd })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::BuiltInFrameCodec;
    use crate::poller::Poller;

    /// A connection with live buffers but no real socket, for exercising
    /// the buffering and framing surface. The poller must stay alive for
    /// the trigger handle to remain valid.
    pub(crate) fn buffer_conn() -> (Poller<Job>, Conn) {
        let poller = Poller::new().unwrap();
        let trigger = poller.trigger();
        let conn = Conn::new(
            -1,
            SockKind::Stream,
            None,
            None,
            Arc::new(BuiltInFrameCodec),
            trigger,
        );
        (poller, conn)
    }

    #[test]
    fn read_is_non_consuming() {
        let (_poller, mut conn) = buffer_conn();
        conn.inbound.write_all(b"stay put");
        assert_eq!(conn.read(), b"stay put");
        assert_eq!(conn.read(), b"stay put");
        assert_eq!(conn.buffer_length(), 8);
    }

    #[test]
    fn read_n_contract_matches_the_ring() {
        let (_poller, mut conn) = buffer_conn();
        conn.inbound.write_all(b"123456");
        assert!(conn.read_n(10).is_none());
        assert_eq!(conn.buffer_length(), 6);

        conn.inbound.write_all(b"7890");
        assert_eq!(conn.read_n(10).unwrap(), b"1234567890");
        assert_eq!(conn.buffer_length(), 0);
    }

    #[test]
    fn context_round_trips_through_any() {
        let (_poller, mut conn) = buffer_conn();
        assert!(conn.context::<u32>().is_none());

        conn.set_context(7u32);
        assert_eq!(*conn.context::<u32>().unwrap(), 7);

        *conn.context_mut::<u32>().unwrap() = 8;
        assert_eq!(*conn.context::<u32>().unwrap(), 8);

        assert!(conn.take_context().is_some());
        assert!(conn.context::<u32>().is_none());
    }

    #[test]
    fn reset_buffer_discards_unread_bytes() {
        let (_poller, mut conn) = buffer_conn();
        conn.inbound.write_all(b"junk");
        conn.reset_buffer();
        assert_eq!(conn.buffer_length(), 0);
    }
}
