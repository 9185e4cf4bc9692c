use std::io::ErrorKind::Interrupted;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::sys::{epoll, Evented, Interest};
use crate::{Error, Result};

// -----------------------------------------------------------------------------
//     - Event -
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub read: bool,
    pub write: bool,
}

impl Event {
    pub(crate) fn none() -> Self {
        Self { read: false, write: false }
    }

    fn from_flags(flags: u32) -> Self {
        Self {
            read: epoll::readable(flags),
            write: epoll::writable(flags),
        }
    }
}

// -----------------------------------------------------------------------------
//     - Poller -
//     One per reactor thread. Wraps an epoll instance plus an eventfd-backed
//     job queue so other threads can schedule work onto the polling thread.
// -----------------------------------------------------------------------------
pub struct Poller<J> {
    epoll_fd: RawFd,
    notify: Arc<Evented>,
    tx: Sender<J>,
    rx: Receiver<J>,
    event_cap: usize,
}

impl<J: Send> Poller<J> {
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll::create()?;
        let notify = Arc::new(Evented::new()?);
        epoll::add(epoll_fd, notify.as_raw_fd(), Interest::Read)?;

        let (tx, rx) = unbounded();

        Ok(Self {
            epoll_fd,
            notify,
            tx,
            rx,
            event_cap: 128,
        })
    }

    /// Hand out a cloneable cross-thread handle for injecting jobs.
    pub fn trigger(&self) -> Trigger<J> {
        Trigger {
            tx: self.tx.clone(),
            notify: self.notify.clone(),
        }
    }

    pub fn add_read(&self, fd: RawFd) -> Result<()> {
        epoll::add(self.epoll_fd, fd, Interest::Read)
    }

    pub fn mod_read(&self, fd: RawFd) -> Result<()> {
        epoll::modify(self.epoll_fd, fd, Interest::Read)
    }

    pub fn mod_read_write(&self, fd: RawFd) -> Result<()> {
        epoll::modify(self.epoll_fd, fd, Interest::ReadWrite)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        epoll::delete(self.epoll_fd, fd)
    }

    /// Block on readiness events, invoking `f` once per ready descriptor and
    /// once per drained job. Jobs injected into this poller are delivered in
    /// FIFO order. The only way out of this call is `f` returning an error,
    /// which is returned as-is.
    pub fn polling<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(RawFd, Event, Option<J>) -> Result<()>,
    {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; self.event_cap];

        loop {
            let count = match epoll::wait(self.epoll_fd, &mut events, -1) {
                Ok(count) => count,
                Err(Error::Io(ref e)) if e.kind() == Interrupted => continue,
                Err(e) => return Err(e),
            };

            for epoll_event in &events[..count] {
                let fd = epoll_event.u64 as RawFd;

                if fd == self.notify.as_raw_fd() {
                    self.notify.consume();
                    while let Ok(job) = self.rx.try_recv() {
                        f(-1, Event::none(), Some(job))?;
                    }
                } else {
                    f(fd, Event::from_flags(epoll_event.events), None)?;
                }
            }
        }
    }
}

impl<J> Drop for Poller<J> {
    fn drop(&mut self) {
        epoll::close(self.epoll_fd);
    }
}

// -----------------------------------------------------------------------------
//     - Trigger -
// -----------------------------------------------------------------------------
/// Cross-thread job injection handle for one poller. The enqueue happens
/// before the eventfd poke, so a woken poller always finds its job. The
/// handle keeps the notify eventfd alive, so the poke is always on a live
/// descriptor even if the poller is already gone.
pub struct Trigger<J> {
    tx: Sender<J>,
    notify: Arc<Evented>,
}

impl<J> Trigger<J> {
    pub fn trigger(&self, job: J) -> Result<()> {
        self.tx.send(job).map_err(|_| Error::Disconnected)?;
        // A failed poke means the poller already shut down and drained.
        let _ = self.notify.poke();
        Ok(())
    }
}

impl<J> Clone for Trigger<J> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            notify: self.notify.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_jobs_arrive_in_fifo_order() {
        let poller: Poller<usize> = Poller::new().unwrap();
        let trigger = poller.trigger();
        for n in 0..8 {
            trigger.trigger(n).unwrap();
        }

        let mut seen = Vec::new();
        let res = poller.polling(|_, _, job| {
            let job = job.expect("only jobs are registered");
            seen.push(job);
            if seen.len() == 8 {
                return Err(Error::Shutdown);
            }
            Ok(())
        });

        assert!(res.unwrap_err().is_shutdown());
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn trigger_fails_once_poller_is_gone() {
        let poller: Poller<usize> = Poller::new().unwrap();
        let trigger = poller.trigger();
        drop(poller);
        assert!(matches!(trigger.trigger(1), Err(Error::Disconnected)));
    }

    #[test]
    fn notify_fd_outlives_the_poller() {
        let poller: Poller<usize> = Poller::new().unwrap();
        let trigger = poller.trigger();
        drop(poller);

        // The trigger keeps the eventfd alive, so a poke that races the
        // poller's teardown lands on a live descriptor, never on a
        // closed or reused one.
        trigger.notify.poke().unwrap();
        assert!(matches!(trigger.trigger(1), Err(Error::Disconnected)));
    }
}
