use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::error;

use crate::codec::{BuiltInFrameCodec, Codec};
use crate::conn::{Conn, SockKind};
use crate::errors::would_block;
use crate::eventloop::{EventLoop, Job};
use crate::handler::{Action, EventHandler};
use crate::net::{parse_addr, socket, Listener};
use crate::options::Options;
use crate::poller::{Poller, Trigger};
use crate::shutdown::ShutdownSignal;
use crate::{Error, Result};

// -----------------------------------------------------------------------------
//     - Server -
// -----------------------------------------------------------------------------
/// Information about a running server, handed to `on_init_complete`.
#[derive(Debug, Clone)]
pub struct Server {
    /// The resolved listening address (None for unix sockets).
    pub addr: Option<SocketAddr>,
    pub multicore: bool,
    pub num_loops: usize,
    pub reuse_port: bool,
    pub tcp_keep_alive: Option<Duration>,
}

// -----------------------------------------------------------------------------
//     - Serve -
// -----------------------------------------------------------------------------
/// Start handling events for `addr`, blocking until the engine shuts down.
///
/// Addresses use a scheme prefix: `tcp://127.0.0.1:9000`,
/// `udp://127.0.0.1:9000` or `unix:///tmp/engine.sock`; a bare `host:port`
/// is treated as tcp. Setup failures are returned before any reactor
/// thread starts.
pub fn serve<H>(handler: H, addr: &str, opts: Options) -> Result<()>
where
    H: EventHandler + 'static,
{
    let (network, address) = parse_addr(addr)?;
    let handler: Arc<dyn EventHandler> = Arc::new(handler);
    let codec: Arc<dyn Codec> = opts
        .codec
        .clone()
        .unwrap_or_else(|| Arc::new(BuiltInFrameCodec));
    let shutdown = ShutdownSignal::new();

    let num_loops = if opts.multicore {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        1
    };
    let reuse_port = opts.reuse_port && network.is_inet();

    // -------------------------------------------------------------------------
    //     - Fallible setup, before any thread spawns -
    // -------------------------------------------------------------------------
    let mut loops = Vec::with_capacity(num_loops);
    for idx in 0..num_loops {
        loops.push(EventLoop::new(
            idx,
            handler.clone(),
            codec.clone(),
            opts.tcp_keep_alive,
        )?);
    }

    let mut svr_addr = None;
    let mut main_listener = None;

    if network.is_udp() {
        // No accept phase: the datagram socket itself joins a loop's
        // connection table.
        if reuse_port {
            for lp in loops.iter_mut() {
                let listener = Listener::bind(network, address, true)?;
                svr_addr = listener.local_addr();
                lp.attach_udp_listener(listener)?;
            }
        } else {
            let listener = Listener::bind(network, address, false)?;
            svr_addr = listener.local_addr();
            loops[0].attach_udp_listener(listener)?;
        }
    } else if reuse_port {
        // Port reuse replicates the accept reactor: every worker owns a
        // listener and accepts locally.
        for lp in loops.iter_mut() {
            let listener = Listener::bind(network, address, true)?;
            svr_addr = listener.local_addr();
            lp.attach_stream_listener(listener)?;
        }
    } else {
        let listener = Listener::bind(network, address, false)?;
        svr_addr = listener.local_addr();
        main_listener = Some(listener);
    }

    let accept_poller = match &main_listener {
        Some(listener) => {
            let poller: Poller<Job> = Poller::new()?;
            poller.add_read(listener.fd())?;
            Some(poller)
        }
        None => None,
    };

    let worker_triggers: Vec<Trigger<Job>> = loops.iter().map(|lp| lp.trigger()).collect();
    let accept_trigger = accept_poller.as_ref().map(|p| p.trigger());

    if opts.ticker {
        loops[0].start_ticker();
    }

    // -------------------------------------------------------------------------
    //     - Reactor threads -
    // -------------------------------------------------------------------------
    let mut threads = Vec::new();
    for mut lp in loops {
        let sd = shutdown.clone();
        threads.push(thread::spawn(move || {
            if let Err(e) = lp.run() {
                if !e.is_shutdown() {
                    error!("reactor {} terminated: {}", lp.idx(), e);
                }
            }
            sd.signal();
        }));
    }

    if let (Some(poller), Some(listener)) = (accept_poller, main_listener) {
        let sd = shutdown.clone();
        let workers = worker_triggers.clone();
        let accept_codec = codec.clone();
        let keep_alive = if listener.is_tcp() { opts.tcp_keep_alive } else { None };

        threads.push(thread::spawn(move || {
            let mut pool = RoundRobin::new(workers);
            let res = poller.polling(|_fd, ev, job| {
                if let Some(Job::Shutdown) = job {
                    return Err(Error::Shutdown);
                }
                if job.is_none() && ev.read {
                    accept_batch(&listener, &mut pool, &accept_codec, keep_alive);
                }
                Ok(())
            });
            if let Err(e) = res {
                if !e.is_shutdown() {
                    error!("accept reactor terminated: {}", e);
                }
            }
            sd.signal();
        }));
    }

    let server = Server {
        addr: svr_addr,
        multicore: opts.multicore,
        num_loops,
        reuse_port: opts.reuse_port,
        tcp_keep_alive: opts.tcp_keep_alive,
    };
    if let Action::Shutdown = handler.on_init_complete(&server) {
        shutdown.signal();
    }

    // -------------------------------------------------------------------------
    //     - Teardown -
    // -------------------------------------------------------------------------
    shutdown.wait();

    for trigger in worker_triggers.iter().chain(accept_trigger.iter()) {
        // Reactors that already unwound have dropped their queue; that is
        // not an error during teardown.
        let _ = trigger.trigger(Job::Shutdown);
    }
    for t in threads {
        let _ = t.join();
    }

    Ok(())
}

// -----------------------------------------------------------------------------
//     - Accept path -
// -----------------------------------------------------------------------------
fn accept_batch(
    listener: &Listener,
    pool: &mut RoundRobin<Trigger<Job>>,
    codec: &Arc<dyn Codec>,
    keep_alive: Option<Duration>,
) {
    loop {
        match listener.accept() {
            Ok((fd, remote)) => {
                if let Some(dur) = keep_alive {
                    if let Err(e) = socket::set_keep_alive(fd, dur) {
                        log::warn!("keep-alive on fd {} failed: {}", fd, e);
                    }
                }

                let worker = pool.next().clone();
                let conn = Conn::new(
                    fd,
                    SockKind::Stream,
                    listener.local_addr(),
                    remote,
                    codec.clone(),
                    worker.clone(),
                );
                if let Err(e) = worker.trigger(Job::Register(Box::new(conn))) {
                    error!("handing off fd {} to worker failed: {}", fd, e);
                    socket::close(fd);
                }
            }
            Err(ref e) if would_block(e) => break,
            Err(e) => {
                error!("accept failed: {}", e);
                break;
            }
        }
    }
}

// -----------------------------------------------------------------------------
//     - Round robin -
// -----------------------------------------------------------------------------
/// Deterministic worker selection: a cursor starting at index 0, advancing
/// by one per accepted connection.
pub(crate) struct RoundRobin<T> {
    items: Vec<T>,
    next: usize,
}

impl<T> RoundRobin<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, next: 0 }
    }

    pub fn next(&mut self) -> &T {
        let item = &self.items[self.next];
        self.next = (self.next + 1) % self.items.len();
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_starts_at_zero_and_alternates() {
        let mut pool = RoundRobin::new(vec![0usize, 1]);

        // C1..C4 over two workers: 0, 1, 0, 1.
        let assigned: Vec<usize> = (0..4).map(|_| *pool.next()).collect();
        assert_eq!(assigned, vec![0, 1, 0, 1]);
    }

    #[test]
    fn round_robin_wraps_over_larger_pools() {
        let mut pool = RoundRobin::new(vec![0usize, 1, 2]);
        let assigned: Vec<usize> = (0..7).map(|_| *pool.next()).collect();
        assert_eq!(assigned, vec![0, 1, 2, 0, 1, 2, 0]);
    }
}
