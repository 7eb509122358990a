//! Task-level synchronization: a re-entrant mutex, a condition variable
//! with timed wait, and a counting semaphore. Blocking always means
//! suspending the current task, never the worker thread.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::fd::INFINITE;
use crate::runtime::Runtime;
use crate::task::{self, Task};
use crate::timer::TimerHandle;

/// Period of the no-op anchor timer armed while a condvar has waiters
/// with no deadline of their own.
const ANCHOR_MS: u64 = u32::MAX as u64;

/// Mutual exclusion between tasks, re-entrant for the owning task.
///
/// The fast path is a single CAS; under contention the task enqueues
/// itself and suspends. Unlock hands the lock chance to the oldest
/// waiter. The guard may be held across suspension points and travels
/// with the task between workers.
pub struct TaskMutex {
    locked: AtomicBool,
    owner: AtomicU64,
    depth: AtomicU32,
    waiters: spin::Mutex<VecDeque<Arc<Task>>>,
}

impl Default for TaskMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    pub fn lock(&self) -> TaskMutexGuard<'_> {
        let Some(me) = task::current() else {
            // Off-task callers (teardown paths on plain threads) spin;
            // holders release quickly or drop the lock across their own
            // suspensions anyway.
            loop {
                let _q = self.waiters.lock();
                if self
                    .locked
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.depth.store(1, Ordering::Release);
                    return TaskMutexGuard { lock: self };
                }
                drop(_q);
                std::thread::yield_now();
            }
        };
        if self.owner.load(Ordering::Acquire) == me.id() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return TaskMutexGuard { lock: self };
        }
        loop {
            {
                // The CAS and the enqueue are arbitrated by the waiter
                // spin-lock against unlock, so a release cannot slip
                // between them unseen.
                let mut q = self.waiters.lock();
                if self
                    .locked
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.owner.store(me.id(), Ordering::Release);
                    self.depth.store(1, Ordering::Release);
                    return TaskMutexGuard { lock: self };
                }
                q.push_back(me.clone());
            }
            task::yield_to_suspended();
        }
    }

    pub fn try_lock(&self) -> Option<TaskMutexGuard<'_>> {
        if let Some(me) = task::current()
            && self.owner.load(Ordering::Acquire) == me.id()
        {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Some(TaskMutexGuard { lock: self });
        }
        let _q = self.waiters.lock();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            if let Some(me) = task::current() {
                self.owner.store(me.id(), Ordering::Release);
            }
            self.depth.store(1, Ordering::Release);
            Some(TaskMutexGuard { lock: self })
        } else {
            None
        }
    }

    fn unlock(&self) {
        if self.depth.fetch_sub(1, Ordering::AcqRel) > 1 {
            return;
        }
        let next = {
            let mut q = self.waiters.lock();
            self.owner.store(0, Ordering::Release);
            self.locked.store(false, Ordering::Release);
            q.pop_front()
        };
        if let Some(t) = next {
            Runtime::current_or_global().submit_task(t);
        }
    }
}

pub struct TaskMutexGuard<'a> {
    lock: &'a TaskMutex,
}

impl<'a> TaskMutexGuard<'a> {
    pub(crate) fn mutex(&self) -> &'a TaskMutex {
        self.lock
    }
}

impl Drop for TaskMutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

struct CondInner {
    waiters: VecDeque<Arc<Task>>,
    anchor: Option<TimerHandle>,
}

/// Condition variable for tasks holding a [`TaskMutex`].
pub struct TaskCondVar {
    inner: Arc<spin::Mutex<CondInner>>,
}

impl Default for TaskCondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskCondVar {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(spin::Mutex::new(CondInner {
                waiters: VecDeque::new(),
                anchor: None,
            })),
        }
    }

    /// Release the mutex, suspend until notified, re-acquire.
    pub fn wait<'a>(&self, guard: TaskMutexGuard<'a>) -> TaskMutexGuard<'a> {
        let me = task::current().expect("condvar used outside a task");
        {
            let mut inner = self.inner.lock();
            inner.waiters.push_back(me);
            if inner.anchor.is_none() {
                // An open-ended wait must keep the runtime from looking
                // finished; any notify cancels this again.
                inner.anchor =
                    Some(Runtime::current_or_global().add_timer(ANCHOR_MS, || {}, true));
            }
        }
        let mutex = guard.mutex();
        drop(guard);
        task::yield_to_suspended();
        mutex.lock()
    }

    /// Like [`wait`](Self::wait) but bounded; the boolean is true when
    /// the deadline fired before a notify reached this task.
    pub fn wait_for<'a>(
        &self,
        guard: TaskMutexGuard<'a>,
        ms: u64,
    ) -> (TaskMutexGuard<'a>, bool) {
        if ms == INFINITE {
            return (self.wait(guard), false);
        }
        let me = task::current().expect("condvar used outside a task");
        let rt = Runtime::current_or_global();
        let flag = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.inner.lock();
            inner.waiters.push_back(me.clone());
        }
        let weak_inner = Arc::downgrade(&self.inner);
        let weak_flag = Arc::downgrade(&flag);
        let weak_rt = Arc::downgrade(&rt);
        let cond: Arc<dyn Any + Send + Sync> = flag.clone();
        let waiter = me;
        let timer = rt.add_cond_timer(
            ms,
            move || {
                let Some(flag) = weak_flag.upgrade() else { return };
                let Some(inner) = weak_inner.upgrade() else { return };
                // The wait-set removal arbitrates against notify: only
                // whoever removes the task wakes it.
                let woke = {
                    let mut inner = inner.lock();
                    match inner.waiters.iter().position(|t| Arc::ptr_eq(t, &waiter)) {
                        Some(pos) => {
                            inner.waiters.remove(pos);
                            true
                        }
                        None => false,
                    }
                };
                if woke {
                    flag.store(true, Ordering::Release);
                    if let Some(rt) = weak_rt.upgrade() {
                        rt.submit_task(waiter.clone());
                    }
                }
            },
            Arc::downgrade(&cond),
        );
        let mutex = guard.mutex();
        drop(guard);
        task::yield_to_suspended();
        let timed_out = flag.load(Ordering::Acquire);
        if !timed_out {
            timer.cancel();
        }
        drop(cond);
        let guard = mutex.lock();
        (guard, timed_out)
    }

    pub fn notify_one(&self) {
        let (next, anchor) = {
            let mut inner = self.inner.lock();
            (inner.waiters.pop_front(), inner.anchor.take())
        };
        if let Some(a) = anchor {
            a.cancel();
        }
        if let Some(t) = next {
            Runtime::current_or_global().submit_task(t);
        }
    }

    pub fn notify_all(&self) {
        let (all, anchor) = {
            let mut inner = self.inner.lock();
            (std::mem::take(&mut inner.waiters), inner.anchor.take())
        };
        if let Some(a) = anchor {
            a.cancel();
        }
        if all.is_empty() {
            return;
        }
        let rt = Runtime::current_or_global();
        for t in all {
            rt.submit_task(t);
        }
    }
}

/// Counting semaphore built on the mutex and condvar.
pub struct TaskSemaphore {
    mutex: TaskMutex,
    cv: TaskCondVar,
    max: u32,
    used: AtomicU32,
}

impl TaskSemaphore {
    pub fn new(permits: u32) -> Self {
        assert!(permits > 0, "semaphore needs at least one permit");
        Self {
            mutex: TaskMutex::new(),
            cv: TaskCondVar::new(),
            max: permits,
            used: AtomicU32::new(0),
        }
    }

    pub fn acquire(&self) {
        let mut guard = self.mutex.lock();
        while self.used.load(Ordering::Acquire) >= self.max {
            guard = self.cv.wait(guard);
        }
        self.used.fetch_add(1, Ordering::AcqRel);
        drop(guard);
    }

    pub fn release(&self) {
        let guard = self.mutex.lock();
        let used = self.used.load(Ordering::Acquire);
        if used > 0 {
            self.used.store(used - 1, Ordering::Release);
        }
        self.cv.notify_one();
        drop(guard);
    }

    pub fn in_use(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }
}
