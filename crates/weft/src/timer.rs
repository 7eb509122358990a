//! Ordered deadline set driving the reactor's wait bound.
//!
//! Timers are kept sorted by `(next_fire, id)`; the head defines how long
//! the reactor may sleep. Conditional timers carry a weak guard that is
//! upgraded at expiry; a dead guard drops the callback.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::notify::Notifier;
use crate::time::now_ms;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct TimerEntry {
    id: u64,
    period_ms: AtomicU64,
    next_fire: AtomicU64,
    recurring: bool,
    cond: Option<Weak<dyn Any + Send + Sync>>,
    // Taken on cancel and on one-shot expiry; a timer without a callback
    // is dead for refresh/reset purposes.
    cb: spin::Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    fn key(&self) -> (u64, u64) {
        (self.next_fire.load(Ordering::Acquire), self.id)
    }
}

pub(crate) struct TimerService {
    wheel: Mutex<BTreeMap<(u64, u64), Arc<TimerEntry>>>,
    next_id: AtomicU64,
    notifier: Arc<Notifier>,
}

/// Owner handle for an armed timer.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
    svc: Weak<TimerService>,
}

impl TimerService {
    pub(crate) fn new(notifier: Arc<Notifier>) -> Self {
        Self { wheel: Mutex::new(BTreeMap::new()), next_id: AtomicU64::new(1), notifier }
    }

    pub(crate) fn add(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerCallback,
        recurring: bool,
        cond: Option<Weak<dyn Any + Send + Sync>>,
    ) -> TimerHandle {
        let entry = Arc::new(TimerEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            period_ms: AtomicU64::new(ms),
            next_fire: AtomicU64::new(now_ms().saturating_add(ms)),
            recurring,
            cond,
            cb: spin::Mutex::new(Some(cb)),
        });
        self.insert(entry.clone());
        TimerHandle { entry, svc: Arc::downgrade(self) }
    }

    fn insert(&self, entry: Arc<TimerEntry>) {
        let at_front = {
            let mut wheel = self.wheel.lock().expect("timer wheel poisoned");
            let key = entry.key();
            wheel.insert(key, entry);
            wheel.keys().next() == Some(&key)
        };
        if at_front {
            // The reactor may be sleeping past the new head.
            self.notifier.notify();
        }
    }

    /// Delay until the next deadline; `None` when no timer is armed.
    pub(crate) fn next_delay(&self) -> Option<u64> {
        let wheel = self.wheel.lock().expect("timer wheel poisoned");
        let (&(next, _), _) = wheel.iter().next()?;
        Some(next.saturating_sub(now_ms()))
    }

    /// Append every expired callback to `out` in deadline order,
    /// rescheduling recurring timers and dropping dead conditionals.
    pub(crate) fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let mut wheel = self.wheel.lock().expect("timer wheel poisoned");
        loop {
            let Some((&key, _)) = wheel.iter().next() else { break };
            if key.0 > now {
                break;
            }
            let entry = wheel.remove(&key).expect("head key present");
            if let Some(cond) = &entry.cond
                && cond.upgrade().is_none()
            {
                *entry.cb.lock() = None;
                continue;
            }
            let cb = entry.cb.lock().clone();
            let Some(cb) = cb else { continue };
            out.push(cb);
            if entry.recurring {
                let period = entry.period_ms.load(Ordering::Acquire);
                entry.next_fire.store(now.saturating_add(period), Ordering::Release);
                let key = entry.key();
                wheel.insert(key, entry);
            } else {
                *entry.cb.lock() = None;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.wheel.lock().expect("timer wheel poisoned").len()
    }
}

impl TimerHandle {
    /// Disarm the timer. Returns whether it was still armed.
    pub fn cancel(&self) -> bool {
        let Some(svc) = self.svc.upgrade() else { return false };
        let mut wheel = svc.wheel.lock().expect("timer wheel poisoned");
        let had_cb = self.entry.cb.lock().take().is_some();
        wheel.remove(&self.entry.key());
        had_cb
    }

    /// Push the deadline out by one full period from now.
    pub fn refresh(&self) -> bool {
        let Some(svc) = self.svc.upgrade() else { return false };
        let reinsert = {
            let mut wheel = svc.wheel.lock().expect("timer wheel poisoned");
            if self.entry.cb.lock().is_none() {
                return false;
            }
            if wheel.remove(&self.entry.key()).is_none() {
                return false;
            }
            let period = self.entry.period_ms.load(Ordering::Acquire);
            self.entry.next_fire.store(now_ms().saturating_add(period), Ordering::Release);
            wheel.insert(self.entry.key(), self.entry.clone());
            wheel.keys().next() == Some(&self.entry.key())
        };
        if reinsert {
            svc.notifier.notify();
        }
        true
    }

    /// Change the period. With `from_now` the deadline restarts from the
    /// current time, otherwise it keeps the original start point.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(svc) = self.svc.upgrade() else { return false };
        let at_front = {
            let mut wheel = svc.wheel.lock().expect("timer wheel poisoned");
            if self.entry.cb.lock().is_none() {
                return false;
            }
            wheel.remove(&self.entry.key());
            let start = if from_now {
                now_ms()
            } else {
                self.entry
                    .next_fire
                    .load(Ordering::Acquire)
                    .saturating_sub(self.entry.period_ms.load(Ordering::Acquire))
            };
            self.entry.period_ms.store(ms, Ordering::Release);
            self.entry.next_fire.store(start.saturating_add(ms), Ordering::Release);
            wheel.insert(self.entry.key(), self.entry.clone());
            wheel.keys().next() == Some(&self.entry.key())
        };
        if at_front {
            svc.notifier.notify();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn service() -> Arc<TimerService> {
        let poll = mio::Poll::new().expect("poll");
        let waker = mio::Waker::new(poll.registry(), mio::Token(usize::MAX)).expect("waker");
        // Keep the poll alive for the waker's lifetime.
        std::mem::forget(poll);
        Arc::new(TimerService::new(Arc::new(Notifier::new(waker))))
    }

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    #[test]
    fn drain_in_deadline_order() {
        let svc = service();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [0u64, 0, 0] {
            let order = order.clone();
            let tag = svc.next_id.load(Ordering::Relaxed);
            svc.add(
                ms,
                Arc::new(move || order.lock().unwrap().push(tag)),
                false,
                None,
            );
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut cbs = Vec::new();
        svc.drain_expired(&mut cbs);
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            cb();
        }
        // Same deadline resolves by insertion id.
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn recurring_reschedules() {
        let svc = service();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        svc.add(0, Arc::new(move || { h.fetch_add(1, Ordering::SeqCst); }), true, None);
        for _ in 0..2 {
            std::thread::sleep(std::time::Duration::from_millis(3));
            let mut cbs = Vec::new();
            svc.drain_expired(&mut cbs);
            for cb in cbs {
                cb();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(svc.len(), 1);
    }

    #[test]
    fn dead_condition_drops_callback() {
        let svc = service();
        let guard: Arc<dyn Any + Send + Sync> = Arc::new(());
        svc.add(0, noop(), false, Some(Arc::downgrade(&guard)));
        drop(guard);
        std::thread::sleep(std::time::Duration::from_millis(3));
        let mut cbs = Vec::new();
        svc.drain_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(svc.len(), 0);
    }

    #[test]
    fn cancel_and_next_delay() {
        let svc = service();
        let far = svc.add(10_000, noop(), false, None);
        let near = svc.add(1_000, noop(), false, None);
        assert!(svc.next_delay().expect("armed") <= 1_000);
        assert!(near.cancel());
        assert!(!near.cancel());
        assert!(svc.next_delay().expect("armed") > 1_000);
        assert!(far.cancel());
        assert!(svc.next_delay().is_none());
    }

    #[test]
    fn reset_moves_deadline() {
        let svc = service();
        let t = svc.add(10_000, noop(), false, None);
        assert!(t.reset(20, true));
        assert!(svc.next_delay().expect("armed") <= 20);
    }
}
