use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{debug, error, warn};

use crate::codec::Codec;
use crate::conn::{Conn, SockKind};
use crate::errors::{os_err, would_block};
use crate::handler::{Action, EventHandler};
use crate::net::{socket, Listener};
use crate::poller::{Event, Poller, Trigger};
use crate::{Error, Result};

/// Scratch read buffer size; one full datagram fits.
const PACKET_SIZE: usize = 0xFFFF;

// -----------------------------------------------------------------------------
//     - Job -
// -----------------------------------------------------------------------------
/// Work injected into an event loop from another thread. Jobs are drained
/// in FIFO injection order on the loop's own thread, which is the only
/// place connection state is ever mutated.
pub(crate) enum Job {
    /// A freshly accepted connection handed over by the accept reactor.
    Register(Box<Conn>),
    /// Asynchronous write: encode, attempt an immediate send, buffer the
    /// rest.
    Write { fd: RawFd, buf: Vec<u8> },
    /// Synthesized data-arrived dispatch with no new bytes.
    Wake { fd: RawFd },
    /// Run the user tick callback and report the next delay back to the
    /// ticker thread.
    Tick,
    /// The sentinel: unwinds the poll loop with `Error::Shutdown`.
    Shutdown,
}

// -----------------------------------------------------------------------------
//     - EventLoop -
// -----------------------------------------------------------------------------
/// One reactor: a poller plus the connections it exclusively owns.
pub(crate) struct EventLoop {
    poller: Poller<Job>,
    inner: Inner,
}

struct Inner {
    idx: usize,
    conns: HashMap<RawFd, Conn>,
    packet: Box<[u8]>,
    handler: Arc<dyn EventHandler>,
    codec: Arc<dyn Codec>,
    keep_alive: Option<Duration>,
    trigger: Trigger<Job>,
    tick_tx: Option<Sender<Option<Duration>>>,
    listener: Option<Listener>,
}

impl EventLoop {
    pub fn new(
        idx: usize,
        handler: Arc<dyn EventHandler>,
        codec: Arc<dyn Codec>,
        keep_alive: Option<Duration>,
    ) -> Result<Self> {
        let poller = Poller::new()?;
        let trigger = poller.trigger();

        Ok(Self {
            poller,
            inner: Inner {
                idx,
                conns: HashMap::new(),
                packet: vec![0; PACKET_SIZE].into_boxed_slice(),
                handler,
                codec,
                keep_alive,
                trigger,
                tick_tx: None,
                listener: None,
            },
        })
    }

    pub fn idx(&self) -> usize {
        self.inner.idx
    }

    pub fn trigger(&self) -> Trigger<Job> {
        self.poller.trigger()
    }

    /// Port-reuse mode: this loop owns its own stream listener and accepts
    /// locally instead of receiving `Register` jobs.
    pub fn attach_stream_listener(&mut self, listener: Listener) -> Result<()> {
        self.poller.add_read(listener.fd())?;
        self.inner.listener = Some(listener);
        Ok(())
    }

    /// Datagram sockets have no accept phase: the listening socket itself
    /// becomes a connection in this loop's table.
    pub fn attach_udp_listener(&mut self, listener: Listener) -> Result<()> {
        let fd = listener.fd();
        let local = listener.local_addr();
        self.poller.add_read(fd)?;

        let conn = Conn::new(
            fd,
            SockKind::Udp,
            local,
            None,
            self.inner.codec.clone(),
            self.poller.trigger(),
        );
        self.inner.conns.insert(fd, conn);
        listener.into_raw_fd();
        Ok(())
    }

    /// Register a pre-built connection before the loop starts (client side).
    pub fn attach_conn(&mut self, conn: Conn) -> Result<()> {
        self.poller.add_read(conn.fd)?;
        self.inner.conns.insert(conn.fd, conn);
        Ok(())
    }

    /// Spawn the ticker thread feeding `Job::Tick` into this loop. The
    /// callback itself always runs on the loop thread; only the sleeping
    /// happens here. The first tick fires immediately.
    pub fn start_ticker(&mut self) {
        let (tx, rx): (Sender<Option<Duration>>, Receiver<Option<Duration>>) = bounded(1);
        self.inner.tick_tx = Some(tx);
        let trigger = self.poller.trigger();

        thread::spawn(move || loop {
            if trigger.trigger(Job::Tick).is_err() {
                break;
            }
            match rx.recv() {
                Ok(Some(delay)) if delay > Duration::from_secs(0) => thread::sleep(delay),
                // A missing or zero delay stops further scheduling.
                _ => break,
            }
        });
    }

    /// Drive the poller until the shutdown sentinel (or a fatal poller
    /// error) unwinds it.
    pub fn run(&mut self) -> Result<()> {
        let EventLoop { poller, inner } = self;
        poller.polling(|fd, ev, job| match job {
            Some(job) => inner.run_job(poller, job),
            None => inner.dispatch(poller, fd, ev),
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (&fd, _) in self.conns.iter() {
            socket::close(fd);
        }
    }
}

// -----------------------------------------------------------------------------
//     - Dispatch -
// -----------------------------------------------------------------------------
impl Inner {
    fn dispatch(&mut self, poller: &Poller<Job>, fd: RawFd, ev: Event) -> Result<()> {
        if let Some(listener_fd) = self.listener.as_ref().map(|l| l.fd()) {
            if fd == listener_fd {
                return self.accept_local(poller);
            }
        }

        let (pending_out, is_udp) = match self.conns.get(&fd) {
            Some(conn) => (!conn.outbound.is_empty(), conn.kind == SockKind::Udp),
            None => return Ok(()),
        };

        if is_udp {
            if ev.read {
                return self.udp_in(poller, fd);
            }
            return Ok(());
        }

        // Strict per-connection ordering: while the outbound buffer holds
        // data, readable events are ignored until it drains; with an empty
        // outbound buffer, writable events are ignored. Reordering this
        // check breaks the single-direction processing guarantee.
        if pending_out {
            if ev.write {
                return self.flush_out(poller, fd);
            }
            Ok(())
        } else {
            if ev.read {
                return self.read_in(poller, fd);
            }
            Ok(())
        }
    }

    fn run_job(&mut self, poller: &Poller<Job>, job: Job) -> Result<()> {
        match job {
            Job::Register(conn) => self.register(poller, *conn),
            Job::Write { fd, buf } => self.write_to(poller, fd, &buf),
            Job::Wake { fd } => self.react_on(poller, fd),
            Job::Tick => {
                let (delay, action) = self.handler.tick();
                if let Some(tx) = &self.tick_tx {
                    let _ = tx.send(delay);
                }
                match action {
                    Action::Shutdown => Err(Error::Shutdown),
                    _ => Ok(()),
                }
            }
            Job::Shutdown => Err(Error::Shutdown),
        }
    }

    // -------------------------------------------------------------------------
    //     - Inbound -
    // -------------------------------------------------------------------------
    fn read_in(&mut self, poller: &Poller<Job>, fd: RawFd) -> Result<()> {
        let n = unsafe {
            libc::read(
                fd,
                self.packet.as_mut_ptr() as *mut libc::c_void,
                self.packet.len(),
            )
        };

        if n == 0 {
            return self.close_conn(poller, fd, None);
        }
        if n < 0 {
            let e = os_err();
            if would_block(&e) || e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return self.close_conn(poller, fd, Some(Error::Io(e)));
        }

        let n = n as usize;
        match self.conns.get_mut(&fd) {
            Some(conn) => conn.inbound.write_all(&self.packet[..n]),
            None => return Ok(()),
        }

        self.react_on(poller, fd)
    }

    fn react_on(&mut self, poller: &Poller<Job>, fd: RawFd) -> Result<()> {
        let (out, action) = match self.conns.get_mut(&fd) {
            Some(conn) if conn.open => self.handler.react(conn),
            _ => return Ok(()),
        };

        if let Some(buf) = out {
            self.write_to(poller, fd, &buf)?;
        }
        self.handle_action(poller, fd, action)
    }

    fn udp_in(&mut self, poller: &Poller<Job>, fd: RawFd) -> Result<()> {
        let (n, peer) = match socket::recv_from(fd, &mut self.packet) {
            Ok(v) => v,
            Err(ref e) if would_block(e) => return Ok(()),
            Err(e) => {
                warn!("udp read failed on fd {}: {}", fd, e);
                return Ok(());
            }
        };

        match self.conns.get_mut(&fd) {
            Some(conn) => {
                conn.peer = Some(peer);
                // Each datagram is processed in isolation.
                conn.inbound.clear();
                conn.inbound.write_all(&self.packet[..n]);
            }
            None => return Ok(()),
        }

        self.react_on(poller, fd)
    }

    // -------------------------------------------------------------------------
    //     - Outbound -
    // -------------------------------------------------------------------------
    fn write_to(&mut self, poller: &Poller<Job>, fd: RawFd, buf: &[u8]) -> Result<()> {
        self.handler.pre_write();

        let res = match self.conns.get_mut(&fd) {
            Some(conn) if conn.open => send_encoded(poller, conn, buf),
            _ => return Ok(()),
        };

        match res {
            Ok(()) => Ok(()),
            Err(e) => self.close_conn(poller, fd, Some(Error::Io(e))),
        }
    }

    fn flush_out(&mut self, poller: &Poller<Job>, fd: RawFd) -> Result<()> {
        self.handler.pre_write();

        let res = match self.conns.get_mut(&fd) {
            Some(conn) => flush_conn(poller, conn),
            None => return Ok(()),
        };

        match res {
            Ok(()) => Ok(()),
            Err(e) => self.close_conn(poller, fd, Some(Error::Io(e))),
        }
    }

    // -------------------------------------------------------------------------
    //     - Lifecycle -
    // -------------------------------------------------------------------------
    fn register(&mut self, poller: &Poller<Job>, conn: Conn) -> Result<()> {
        let fd = conn.fd;
        if let Err(e) = poller.add_read(fd) {
            error!("failed to register fd {} with reactor {}: {}", fd, self.idx, e);
            socket::close(fd);
            return Ok(());
        }
        self.conns.insert(fd, conn);
        self.opened(poller, fd)
    }

    fn opened(&mut self, poller: &Poller<Job>, fd: RawFd) -> Result<()> {
        let (out, action) = match self.conns.get_mut(&fd) {
            Some(conn) => self.handler.on_opened(conn),
            None => return Ok(()),
        };

        if let Some(buf) = out {
            self.write_to(poller, fd, &buf)?;
        }
        self.handle_action(poller, fd, action)
    }

    fn accept_local(&mut self, poller: &Poller<Job>) -> Result<()> {
        let mut accepted = Vec::new();
        if let Some(listener) = &self.listener {
            let keep_alive = if listener.is_tcp() { self.keep_alive } else { None };
            let local = listener.local_addr();
            loop {
                match listener.accept() {
                    Ok((fd, remote)) => {
                        if let Some(dur) = keep_alive {
                            if let Err(e) = socket::set_keep_alive(fd, dur) {
                                warn!("keep-alive on fd {} failed: {}", fd, e);
                            }
                        }
                        accepted.push((fd, local, remote));
                    }
                    Err(ref e) if would_block(e) => break,
                    Err(e) => {
                        error!("accept failed on reactor {}: {}", self.idx, e);
                        break;
                    }
                }
            }
        }

        for (fd, local, remote) in accepted {
            let conn = Conn::new(
                fd,
                SockKind::Stream,
                local,
                remote,
                self.codec.clone(),
                self.trigger.clone(),
            );
            self.register(poller, conn)?;
        }
        Ok(())
    }

    fn close_conn(&mut self, poller: &Poller<Job>, fd: RawFd, err: Option<Error>) -> Result<()> {
        let mut conn = match self.conns.remove(&fd) {
            Some(conn) => conn,
            None => return Ok(()),
        };
        conn.open = false;

        if let Err(e) = poller.delete(fd) {
            debug!("deregistering fd {} failed: {}", fd, e);
        }
        socket::close(fd);

        match self.handler.on_closed(&mut conn, err.as_ref()) {
            Action::Shutdown => Err(Error::Shutdown),
            _ => Ok(()),
        }
    }

    fn handle_action(&mut self, poller: &Poller<Job>, fd: RawFd, action: Action) -> Result<()> {
        match action {
            Action::None => Ok(()),
            Action::Close => {
                // Closing an unconnected datagram "connection" would close
                // the listening socket; resetting its state is the
                // equivalent of forgetting the peer.
                if let Some(conn) = self.conns.get_mut(&fd) {
                    if conn.kind == SockKind::Udp {
                        conn.inbound.clear();
                        conn.peer = None;
                        return Ok(());
                    }
                }
                self.close_conn(poller, fd, None)
            }
            Action::Shutdown => Err(Error::Shutdown),
        }
    }
}

// -----------------------------------------------------------------------------
//     - Socket writes -
// -----------------------------------------------------------------------------
/// Encode and send on the loop thread. An `Err` here means the connection
/// is beyond saving and must be closed with that error.
fn send_encoded(poller: &Poller<Job>, conn: &mut Conn, buf: &[u8]) -> io::Result<()> {
    let data = conn.codec.clone().encode(conn, buf);
    if data.is_empty() {
        return Ok(());
    }

    if conn.kind == SockKind::Udp {
        let peer = match &conn.peer {
            Some(peer) => *peer,
            None => return Ok(()),
        };
        // The descriptor here is the service socket itself; a failed
        // send costs only this datagram, never the socket.
        match socket::send_to(conn.fd, &data, &peer) {
            Ok(_) => {}
            Err(ref e) if would_block(e) => {
                debug!("udp send would block, datagram dropped");
            }
            Err(e) => warn!("udp send failed on fd {}, datagram dropped: {}", conn.fd, e),
        }
        return Ok(());
    }

    // Queueing behind unsent bytes keeps the stream in write order.
    if !conn.outbound.is_empty() {
        conn.outbound.write_all(&data);
        return Ok(());
    }

    let n = unsafe { libc::write(conn.fd, data.as_ptr() as *const libc::c_void, data.len()) };
    let written = if n < 0 {
        let e = os_err();
        if !would_block(&e) {
            return Err(e);
        }
        0
    } else {
        n as usize
    };

    if written < data.len() {
        conn.outbound.write_all(&data[written..]);
        if let Err(e) = poller.mod_read_write(conn.fd) {
            warn!("escalating interest on fd {} failed: {}", conn.fd, e);
        }
    }
    Ok(())
}

/// Flush as much of the outbound buffer as the socket accepts; downgrade
/// poll interest once it drains.
fn flush_conn(poller: &Poller<Job>, conn: &mut Conn) -> io::Result<()> {
    while !conn.outbound.is_empty() {
        let (head, _) = conn.outbound.peek();
        let head_len = head.len();

        let n = unsafe {
            libc::write(conn.fd, head.as_ptr() as *const libc::c_void, head_len)
        };
        if n < 0 {
            let e = os_err();
            if would_block(&e) {
                break;
            }
            return Err(e);
        }

        let n = n as usize;
        conn.outbound.consume(n);
        if n < head_len {
            break;
        }
    }

    if conn.outbound.is_empty() {
        if let Err(e) = poller.mod_read(conn.fd) {
            warn!("downgrading interest on fd {} failed: {}", conn.fd, e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::codec::BuiltInFrameCodec;

    #[derive(Default)]
    struct Recorder {
        reacts: AtomicUsize,
        closes: AtomicUsize,
    }

    impl EventHandler for Recorder {
        fn react(&self, _conn: &mut Conn) -> (Option<Vec<u8>>, Action) {
            self.reacts.fetch_add(1, Ordering::SeqCst);
            (None, Action::None)
        }

        fn on_closed(&self, _conn: &mut Conn, _err: Option<&Error>) -> Action {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Action::None
        }
    }

    fn loop_with_conn() -> (EventLoop, Arc<Recorder>, UnixStream, RawFd) {
        let recorder = Arc::new(Recorder::default());
        let mut lp = EventLoop::new(
            0,
            recorder.clone(),
            Arc::new(BuiltInFrameCodec),
            None,
        )
        .unwrap();

        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        theirs
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let fd = ours.into_raw_fd();
        let conn = Conn::new(
            fd,
            SockKind::Stream,
            None,
            None,
            Arc::new(BuiltInFrameCodec),
            lp.trigger(),
        );
        lp.attach_conn(conn).unwrap();

        (lp, recorder, theirs, fd)
    }

    #[test]
    fn pending_outbound_blocks_inbound_dispatch() {
        let (mut lp, recorder, mut peer, fd) = loop_with_conn();

        lp.inner
            .conns
            .get_mut(&fd)
            .unwrap()
            .outbound
            .write_all(b"pending");
        peer.write_all(b"incoming").unwrap();

        // Readable arrives first, out of order: it must be ignored while
        // the outbound buffer holds data.
        let read_ev = Event { read: true, write: false };
        lp.inner.dispatch(&lp.poller, fd, read_ev).unwrap();
        assert_eq!(recorder.reacts.load(Ordering::SeqCst), 0);
        assert_eq!(lp.inner.conns[&fd].inbound.len(), 0);

        // Writable drains the buffer.
        let write_ev = Event { read: false, write: true };
        lp.inner.dispatch(&lp.poller, fd, write_ev).unwrap();
        assert!(lp.inner.conns[&fd].outbound.is_empty());
        let mut flushed = [0u8; 7];
        peer.read_exact(&mut flushed).unwrap();
        assert_eq!(&flushed, b"pending");

        // Only now does the readable event get through.
        lp.inner.dispatch(&lp.poller, fd, read_ev).unwrap();
        assert_eq!(recorder.reacts.load(Ordering::SeqCst), 1);
        assert_eq!(lp.inner.conns[&fd].inbound.bytes(), b"incoming");
    }

    #[test]
    fn wake_job_dispatches_react_without_new_bytes() {
        let (mut lp, recorder, _peer, fd) = loop_with_conn();

        lp.inner.run_job(&lp.poller, Job::Wake { fd }).unwrap();
        assert_eq!(recorder.reacts.load(Ordering::SeqCst), 1);
        assert_eq!(lp.inner.conns[&fd].inbound.len(), 0);
    }

    #[test]
    fn write_job_sends_immediately_when_socket_accepts() {
        let (mut lp, _recorder, mut peer, fd) = loop_with_conn();

        lp.inner
            .run_job(&lp.poller, Job::Write { fd, buf: b"abc".to_vec() })
            .unwrap();

        assert!(lp.inner.conns[&fd].outbound.is_empty());
        let mut got = [0u8; 3];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"abc");
    }

    #[test]
    fn closing_one_conn_leaves_others_untouched() {
        let (mut lp, recorder, _peer_a, fd_a) = loop_with_conn();

        let (ours, _peer_b) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let fd_b = ours.into_raw_fd();
        let conn_b = Conn::new(
            fd_b,
            SockKind::Stream,
            None,
            None,
            Arc::new(BuiltInFrameCodec),
            lp.trigger(),
        );
        lp.attach_conn(conn_b).unwrap();
        lp.inner
            .conns
            .get_mut(&fd_b)
            .unwrap()
            .inbound
            .write_all(b"buffered");

        lp.inner.close_conn(&lp.poller, fd_a, None).unwrap();

        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert!(!lp.inner.conns.contains_key(&fd_a));
        assert_eq!(lp.inner.conns[&fd_b].inbound.bytes(), b"buffered");
    }

    #[test]
    fn peer_eof_closes_the_connection() {
        let (mut lp, recorder, peer, fd) = loop_with_conn();
        drop(peer);

        let read_ev = Event { read: true, write: false };
        lp.inner.dispatch(&lp.poller, fd, read_ev).unwrap();

        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert!(lp.inner.conns.is_empty());
    }

    #[test]
    fn udp_send_failure_leaves_the_service_socket_open() {
        let recorder = Arc::new(Recorder::default());
        let mut lp = EventLoop::new(
            0,
            recorder.clone(),
            Arc::new(BuiltInFrameCodec),
            None,
        )
        .unwrap();

        let service = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        service.set_nonblocking(true).unwrap();
        let service_addr = service.local_addr().unwrap();
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let fd = service.into_raw_fd();
        let conn = Conn::new(
            fd,
            SockKind::Udp,
            Some(service_addr),
            None,
            Arc::new(BuiltInFrameCodec),
            lp.trigger(),
        );
        lp.attach_conn(conn).unwrap();

        // One inbound datagram records the peer address.
        peer.send_to(b"hi", service_addr).unwrap();
        for _ in 0..50 {
            lp.inner.udp_in(&lp.poller, fd).unwrap();
            if lp.inner.conns[&fd].peer.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(lp.inner.conns[&fd].peer.is_some());

        // An oversized reply makes sendto fail; the datagram is dropped
        // and the service socket stays in the table.
        lp.inner
            .run_job(&lp.poller, Job::Write { fd, buf: vec![0u8; 100_000] })
            .unwrap();
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 0);
        assert!(lp.inner.conns.contains_key(&fd));

        // The socket still serves.
        lp.inner
            .run_job(&lp.poller, Job::Write { fd, buf: b"pong".to_vec() })
            .unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn shutdown_job_unwinds_with_the_sentinel() {
        let (mut lp, _recorder, _peer, _fd) = loop_with_conn();
        let err = lp.inner.run_job(&lp.poller, Job::Shutdown).unwrap_err();
        assert!(err.is_shutdown());
    }
}
