use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::error;

use crate::codec::{BuiltInFrameCodec, Codec};
use crate::conn::Conn;
use crate::eventloop::{EventLoop, Job};
use crate::handler::{Action, EventHandler};
use crate::net::{dial, parse_addr};
use crate::options::Options;
use crate::poller::Trigger;
use crate::shutdown::ShutdownSignal;
use crate::{Error, Result};

// -----------------------------------------------------------------------------
//     - Client -
// -----------------------------------------------------------------------------
/// Handle to a running outbound connection: one reactor, one socket.
///
/// The handle is cheap to clone and safe to use from any thread; writes go
/// through the reactor's job queue like every other cross-thread request.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    fd: i32,
    trigger: Trigger<Job>,
    ready: AtomicBool,
    shutdown: ShutdownSignal,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl Client {
    /// Queue `buf` for writing on the reactor thread.
    ///
    /// Calling this before the connection-established callback has fired
    /// is rejected with `Error::NotReady`; it never blocks or queues
    /// ahead of establishment.
    pub fn write(&self, buf: impl Into<Vec<u8>>) -> Result<()> {
        if !self.inner.ready.load(Ordering::Acquire) {
            return Err(Error::NotReady);
        }
        self.inner.trigger.trigger(Job::Write {
            fd: self.inner.fd,
            buf: buf.into(),
        })
    }

    /// Request teardown of this client. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.signal();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }
}

// -----------------------------------------------------------------------------
//     - Connect -
// -----------------------------------------------------------------------------
/// Dial `addr` and run a single-reactor engine around the connection,
/// blocking until shutdown. Dial failures are returned before the reactor
/// thread starts.
pub fn connect<H>(handler: H, addr: &str, opts: Options) -> Result<()>
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

    let dialed = dial(network, address)?;

    let mut lp = EventLoop::new(0, handler.clone(), codec.clone(), None)?;
    let trigger = lp.trigger();

    let conn = Conn::new(
        dialed.fd,
        dialed.kind,
        dialed.local,
        dialed.remote,
        codec,
        trigger.clone(),
    );
    lp.attach_conn(conn)?;

    if opts.ticker {
        lp.start_ticker();
    }

    let reactor = {
        let sd = shutdown.clone();
        thread::spawn(move || {
            if let Err(e) = lp.run() {
                if !e.is_shutdown() {
                    error!("client reactor terminated: {}", e);
                }
            }
            sd.signal();
        })
    };

    let client = Client {
        inner: Arc::new(ClientInner {
            fd: dialed.fd,
            trigger: trigger.clone(),
            ready: AtomicBool::new(false),
            shutdown: shutdown.clone(),
            local: dialed.local,
            remote: dialed.remote,
        }),
    };

    // The established callback is the first point user code can reach the
    // client; writes become valid just before it fires.
    client.inner.ready.store(true, Ordering::Release);
    if let Action::Shutdown = handler.on_connection_established(&client) {
        shutdown.signal();
    }

    shutdown.wait();
    let _ = trigger.trigger(Job::Shutdown);
    let _ = reactor.join();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;

    #[test]
    fn write_before_established_is_rejected() {
        let poller: Poller<Job> = Poller::new().unwrap();
        let client = Client {
            inner: Arc::new(ClientInner {
                fd: -1,
                trigger: poller.trigger(),
                ready: AtomicBool::new(false),
                shutdown: ShutdownSignal::new(),
                local: None,
                remote: None,
            }),
        };

        assert!(matches!(client.write(&b"early"[..]), Err(Error::NotReady)));

        // Once established, the same write goes through as a job.
        client.inner.ready.store(true, Ordering::Release);
        client.write(&b"on time"[..]).unwrap();
    }
}
