//! Edge-triggered readiness multiplex.
//!
//! Per descriptor the reactor keeps the currently registered event mask
//! and, for READ and WRITE separately, the waiter to resume. Every
//! registered event fires at most once: the trigger removes it from the
//! mask and updates the kernel registration, so re-arming is always
//! explicit. Error/hangup conditions are translated into whatever subset
//! of READ|WRITE the caller had registered.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use thiserror::Error;
use tracing::{debug, error};

use crate::runtime::Waiter;

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct IoEvent: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("event {1:?} already armed for fd {0}")]
    Duplicate(RawFd, IoEvent),
    #[error("kernel registration: {0}")]
    Io(#[from] io::Error),
}

#[derive(Default)]
struct SlotState {
    registered: IoEvent,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

struct FdSlot {
    state: Mutex<SlotState>,
}

impl FdSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(SlotState::default()) })
    }
}

struct Poller {
    poll: Poll,
    events: Events,
}

pub(crate) struct Reactor {
    poller: Mutex<Poller>,
    registry: Registry,
    slots: RwLock<Vec<Arc<FdSlot>>>,
    pending: AtomicUsize,
}

fn interests(mask: IoEvent) -> Interest {
    match (mask.contains(IoEvent::READ), mask.contains(IoEvent::WRITE)) {
        (true, true) => Interest::READABLE.add(Interest::WRITABLE),
        (false, true) => Interest::WRITABLE,
        // Callers never pass an empty mask here.
        _ => Interest::READABLE,
    }
}

impl Reactor {
    pub(crate) fn new() -> io::Result<(Self, mio::Waker)> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let reactor = Self {
            poller: Mutex::new(Poller { poll, events: Events::with_capacity(256) }),
            registry,
            slots: RwLock::new(Vec::new()),
            pending: AtomicUsize::new(0),
        };
        Ok((reactor, waker))
    }

    #[inline]
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        let slots = self.slots.read().expect("fd table poisoned");
        slots.get(fd as usize).cloned()
    }

    fn slot_or_grow(&self, fd: RawFd) -> Arc<FdSlot> {
        if let Some(slot) = self.slot(fd) {
            return slot;
        }
        let mut slots = self.slots.write().expect("fd table poisoned");
        let want = ((fd as usize) * 3 / 2).max(64).max(fd as usize + 1);
        while slots.len() < want {
            slots.push(FdSlot::new());
        }
        slots[fd as usize].clone()
    }

    fn update_registration(&self, fd: RawFd, old: IoEvent, new: IoEvent) -> io::Result<()> {
        let mut src = SourceFd(&fd);
        let token = Token(fd as usize);
        if old.is_empty() && !new.is_empty() {
            self.registry.register(&mut src, token, interests(new))
        } else if !old.is_empty() && new.is_empty() {
            self.registry.deregister(&mut src)
        } else if !new.is_empty() {
            self.registry.reregister(&mut src, token, interests(new))
        } else {
            Ok(())
        }
    }

    /// Arm `ev` on `fd`, recording `waiter` for the wake. Fails if the
    /// same direction is already armed.
    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        ev: IoEvent,
        waiter: Waiter,
    ) -> Result<(), ReactorError> {
        let slot = self.slot_or_grow(fd);
        let mut st = slot.state.lock().expect("fd slot poisoned");
        if st.registered.contains(ev) {
            error!(fd, ?ev, "event already armed");
            return Err(ReactorError::Duplicate(fd, ev));
        }
        let old = st.registered;
        st.registered |= ev;
        if let Err(e) = self.update_registration(fd, old, st.registered) {
            st.registered = old;
            return Err(ReactorError::Io(e));
        }
        if ev.contains(IoEvent::READ) {
            st.read = Some(waiter);
        } else {
            st.write = Some(waiter);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Remove `ev` without waking anyone. The dropped waiter is returned
    /// so the caller can dispose of it outside the slot lock.
    pub(crate) fn del_event(&self, fd: RawFd, ev: IoEvent) -> Option<Waiter> {
        let slot = self.slot(fd)?;
        let mut st = slot.state.lock().expect("fd slot poisoned");
        if !st.registered.contains(ev) {
            return None;
        }
        let old = st.registered;
        st.registered.remove(ev);
        if let Err(e) = self.update_registration(fd, old, st.registered) {
            debug!(fd, ?e, "deregister");
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
        if ev.contains(IoEvent::READ) { st.read.take() } else { st.write.take() }
    }

    /// Remove `ev` and hand back the waiter for an as-if-fired wake.
    pub(crate) fn cancel_event(&self, fd: RawFd, ev: IoEvent) -> Option<Waiter> {
        self.del_event(fd, ev)
    }

    /// Cancel both directions; returned waiters must be woken.
    pub(crate) fn cancel_all(&self, fd: RawFd) -> Vec<Waiter> {
        let mut out = Vec::new();
        if let Some(w) = self.cancel_event(fd, IoEvent::READ) {
            out.push(w);
        }
        if let Some(w) = self.cancel_event(fd, IoEvent::WRITE) {
            out.push(w);
        }
        out
    }

    /// One bounded wait on the poller, if this thread can take it.
    ///
    /// Returns the waiters to resume, or `None` when another worker owns
    /// the poller (the caller parks instead).
    pub(crate) fn poll_once(&self, timeout_ms: u64) -> Option<Vec<Waiter>> {
        let mut core = self.poller.try_lock().ok()?;
        let Poller { poll, events } = &mut *core;
        match poll.poll(events, Some(Duration::from_millis(timeout_ms))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!(?e, "reactor poll"),
        }
        let mut wakes = Vec::new();
        for ev in events.iter() {
            if ev.token() == WAKER_TOKEN {
                continue;
            }
            let fd = ev.token().0 as RawFd;
            let Some(slot) = self.slot(fd) else { continue };
            let mut st = slot.state.lock().expect("fd slot poisoned");
            let mut effective = IoEvent::empty();
            if ev.is_readable() {
                effective |= IoEvent::READ;
            }
            if ev.is_writable() {
                effective |= IoEvent::WRITE;
            }
            if ev.is_error() || ev.is_read_closed() || ev.is_write_closed() {
                // A dead peer wakes whatever was waiting on this fd.
                effective |= st.registered;
            }
            let triggered = effective & st.registered;
            if triggered.is_empty() {
                continue;
            }
            let old = st.registered;
            st.registered.remove(triggered);
            if let Err(e) = self.update_registration(fd, old, st.registered) {
                debug!(fd, ?e, "reregister after trigger");
            }
            if triggered.contains(IoEvent::READ)
                && let Some(w) = st.read.take()
            {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                wakes.push(w);
            }
            if triggered.contains(IoEvent::WRITE)
                && let Some(w) = st.write.take()
            {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                wakes.push(w);
            }
        }
        Some(wakes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "socketpair failed");
        (fds[0], fds[1])
    }

    fn write_byte(fd: RawFd) {
        let n = unsafe { libc::write(fd, b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1, "pipe write failed");
    }

    fn job() -> Waiter {
        Waiter::Job(Box::new(|| {}))
    }

    /// Collect wakes, retrying short polls until one arrives or the
    /// rounds run out.
    fn poll_wakes(reactor: &Reactor, rounds: usize) -> usize {
        let mut woke = 0;
        for _ in 0..rounds {
            woke += reactor.poll_once(100).expect("poller is uncontended").len();
            if woke > 0 {
                break;
            }
        }
        woke
    }

    #[test]
    fn readable_edge_wakes_exactly_once() {
        let (rx, tx) = socketpair();
        let (reactor, _waker) = Reactor::new().unwrap();
        reactor.add_event(rx, IoEvent::READ, job()).unwrap();
        assert_eq!(reactor.pending(), 1);

        write_byte(tx);
        assert_eq!(poll_wakes(&reactor, 50), 1);
        assert_eq!(reactor.pending(), 0);

        // A second readable edge without re-registration stays silent;
        // the trigger consumed the one-shot registration.
        write_byte(tx);
        assert_eq!(reactor.poll_once(200).expect("poller is uncontended").len(), 0);

        // Re-arming observes the still-pending readiness, once.
        reactor.add_event(rx, IoEvent::READ, job()).unwrap();
        assert_eq!(poll_wakes(&reactor, 50), 1);
        assert_eq!(reactor.poll_once(100).expect("poller is uncontended").len(), 0);

        unsafe {
            libc::close(tx);
            libc::close(rx);
        }
    }

    #[test]
    fn duplicate_arm_is_rejected() {
        let (rx, tx) = socketpair();
        let (reactor, _waker) = Reactor::new().unwrap();
        reactor.add_event(rx, IoEvent::READ, job()).unwrap();
        assert!(matches!(
            reactor.add_event(rx, IoEvent::READ, job()),
            Err(ReactorError::Duplicate(fd, ev)) if fd == rx && ev == IoEvent::READ
        ));
        // The write direction is independent.
        reactor.add_event(rx, IoEvent::WRITE, job()).unwrap();
        assert_eq!(reactor.pending(), 2);
        unsafe {
            libc::close(tx);
            libc::close(rx);
        }
    }

    #[test]
    fn del_event_drops_without_wake() {
        let (rx, tx) = socketpair();
        let (reactor, _waker) = Reactor::new().unwrap();
        reactor.add_event(rx, IoEvent::READ, job()).unwrap();
        assert!(reactor.del_event(rx, IoEvent::READ).is_some());
        assert!(reactor.del_event(rx, IoEvent::READ).is_none());
        assert_eq!(reactor.pending(), 0);

        // Readiness after removal reaches nobody.
        write_byte(tx);
        assert_eq!(reactor.poll_once(200).expect("poller is uncontended").len(), 0);

        unsafe {
            libc::close(tx);
            libc::close(rx);
        }
    }

    #[test]
    fn cancel_all_returns_both_directions() {
        let (rx, tx) = socketpair();
        let (reactor, _waker) = Reactor::new().unwrap();
        reactor.add_event(rx, IoEvent::READ, job()).unwrap();
        reactor.add_event(rx, IoEvent::WRITE, job()).unwrap();
        assert_eq!(reactor.cancel_all(rx).len(), 2);
        assert_eq!(reactor.pending(), 0);
        unsafe {
            libc::close(tx);
            libc::close(rx);
        }
    }
}
