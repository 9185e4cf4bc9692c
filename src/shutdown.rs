use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// One-shot engine-wide shutdown controller, passed explicitly to every
/// reactor at construction.
///
/// `signal` is idempotent: concurrent or repeated calls from any number of
/// reactors collapse into a single wake of the waiters, so there is exactly
/// one teardown sequence no matter how many paths request shutdown.
#[derive(Clone)]
pub(crate) struct ShutdownSignal {
    inner: Arc<Inner>,
}

struct Inner {
    fired: AtomicBool,
    done: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                done: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn signal(&self) {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut done = self.inner.done.lock().unwrap();
        *done = true;
        self.inner.cond.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.inner.done.lock().unwrap();
        while !*done {
            done = self.inner.cond.wait(done).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn concurrent_signals_collapse_into_one_wake() {
        let signal = ShutdownSignal::new();

        let mut signallers = Vec::new();
        for _ in 0..4 {
            let s = signal.clone();
            signallers.push(thread::spawn(move || s.signal()));
        }

        let waiter = {
            let s = signal.clone();
            thread::spawn(move || s.wait())
        };

        for t in signallers {
            t.join().unwrap();
        }
        waiter.join().unwrap();

        // Waiting after the fact returns immediately.
        signal.wait();
    }

    #[test]
    fn signal_after_wait_releases_the_waiter() {
        let signal = ShutdownSignal::new();
        let s = signal.clone();
        let waiter = thread::spawn(move || s.wait());

        thread::sleep(Duration::from_millis(20));
        signal.signal();
        waiter.join().unwrap();
    }
}
