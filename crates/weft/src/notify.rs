use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Wake-up channel for idle workers.
///
/// The worker that currently owns the poller is woken through the mio
/// waker; workers parked beside it wait on the condvar. `notify` hits
/// both so whichever form of idleness a worker is in, it returns.
pub(crate) struct Notifier {
    waker: mio::Waker,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Notifier {
    pub(crate) fn new(waker: mio::Waker) -> Self {
        Self { waker, lock: Mutex::new(()), cv: Condvar::new() }
    }

    pub(crate) fn notify(&self) {
        let _ = self.waker.wake();
        self.cv.notify_one();
    }

    pub(crate) fn notify_all(&self) {
        let _ = self.waker.wake();
        self.cv.notify_all();
    }

    /// Park the calling thread for at most `timeout_ms`.
    pub(crate) fn park(&self, timeout_ms: u64) {
        let guard = self.lock.lock().expect("notifier lock poisoned");
        let _ = self
            .cv
            .wait_timeout(guard, Duration::from_millis(timeout_ms))
            .expect("notifier lock poisoned");
    }
}
