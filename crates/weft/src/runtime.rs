//! M:N scheduler: worker threads pull task/closure entries from a shared
//! FIFO and drive them through the stackful task machinery. The idle path
//! runs the reactor, so a worker with nothing to execute turns into the
//! poller (or parks next to it).

use std::any::Any;
use std::collections::VecDeque;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::reactor::{IoEvent, Reactor, ReactorError};
use crate::notify::Notifier;
use crate::task::{self, DEFAULT_STACK_SIZE, Task, TaskState};
use crate::timer::{TimerCallback, TimerHandle, TimerService};

/// Upper bound on a single reactor wait, timers or not.
const MAX_IDLE_WAIT_MS: u64 = 3_000;

/// Something the reactor or a queue entry can hand to a worker: an
/// existing task to resume, or a closure to run on a (reused) task.
pub(crate) enum Waiter {
    Task(Arc<Task>),
    Job(Box<dyn FnOnce() + Send + 'static>),
}

struct Entry {
    target: Waiter,
    pinned: Option<usize>,
}

pub struct Runtime {
    name: String,
    worker_count: usize,
    queue: Mutex<VecDeque<Entry>>,
    active: AtomicUsize,
    idle_workers: AtomicUsize,
    // True while some worker is inside (or entering) the reactor wait;
    // submissions must reach the waker then even with no parked worker.
    polling: AtomicBool,
    stop: AtomicBool,
    notifier: Arc<Notifier>,
    reactor: Reactor,
    timers: Arc<TimerService>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

thread_local! {
    static CURRENT_RT: RefCell<Option<Arc<Runtime>>> = const { RefCell::new(None) };
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

static IGNORE_SIGPIPE: Lazy<()> = Lazy::new(|| {
    // A peer that vanishes mid-write must surface as EPIPE, not kill the
    // process.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
});

impl Runtime {
    /// Build a runtime and start its worker threads.
    pub fn new(workers: usize, name: &str) -> Arc<Self> {
        assert!(workers > 0, "runtime needs at least one worker");
        Lazy::force(&IGNORE_SIGPIPE);
        let (reactor, waker) = Reactor::new().expect("reactor init");
        let notifier = Arc::new(Notifier::new(waker));
        let timers = Arc::new(TimerService::new(notifier.clone()));
        let rt = Arc::new(Self {
            name: name.to_owned(),
            worker_count: workers,
            queue: Mutex::new(VecDeque::new()),
            active: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            polling: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            notifier,
            reactor,
            timers,
            workers: Mutex::new(Vec::with_capacity(workers)),
        });
        let mut handles = rt.workers.lock().expect("worker list poisoned");
        for i in 0..workers {
            let rt = rt.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || run_worker(rt, i))
                .expect("spawn worker thread");
            handles.push(handle);
        }
        drop(handles);
        rt
    }

    /// Runtime of the calling worker thread, if any. Out of line so the
    /// TLS base is recomputed after a task migrates between workers.
    #[inline(never)]
    pub fn current() -> Option<Arc<Self>> {
        CURRENT_RT.with_borrow(Clone::clone)
    }

    /// Process-wide default runtime (4 workers), created on first use.
    pub fn global() -> Arc<Self> {
        GLOBAL.get_or_init(|| Self::new(4, "weft")).clone()
    }

    pub fn current_or_global() -> Arc<Self> {
        Self::current().unwrap_or_else(Self::global)
    }

    /// Current runtime, or the global one if it was already created.
    /// Never forces the global into existence.
    pub(crate) fn try_existing() -> Option<Arc<Self>> {
        Self::current().or_else(|| GLOBAL.get().cloned())
    }

    #[inline(never)]
    pub fn worker_id() -> Option<usize> {
        let id = WORKER_ID.get();
        (id != usize::MAX).then_some(id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue a closure; it runs as a fresh (or recycled) task on any
    /// worker.
    pub fn submit(&self, f: impl FnOnce() + Send + 'static) {
        self.push(Entry { target: Waiter::Job(Box::new(f)), pinned: None });
    }

    /// Queue a closure that only worker `worker` may run.
    pub fn submit_pinned(&self, worker: usize, f: impl FnOnce() + Send + 'static) {
        assert!(worker < self.worker_count, "pin to unknown worker {worker}");
        self.push(Entry { target: Waiter::Job(Box::new(f)), pinned: Some(worker) });
    }

    /// Requeue an existing task (it must be Ready or Suspended).
    pub fn submit_task(&self, t: Arc<Task>) {
        self.push(Entry { target: Waiter::Task(t), pinned: None });
    }

    pub(crate) fn wake(&self, w: Waiter) {
        self.push(Entry { target: w, pinned: None });
    }

    fn push(&self, e: Entry) {
        self.queue.lock().expect("queue poisoned").push_back(e);
        self.notify();
    }

    fn notify(&self) {
        if self.idle_workers.load(Ordering::Acquire) > 0 || self.polling.load(Ordering::SeqCst) {
            self.notifier.notify();
        }
    }

    fn take_entry(&self, worker_id: usize) -> (Option<Entry>, bool) {
        let mut q = self.queue.lock().expect("queue poisoned");
        let mut tickle = false;
        let mut chosen = None;
        for (i, e) in q.iter().enumerate() {
            if let Some(p) = e.pinned
                && p != worker_id
            {
                // Someone else must pick this up.
                tickle = true;
                continue;
            }
            if let Waiter::Task(t) = &e.target
                && t.state() == TaskState::Running
            {
                // A waker raced the yield; the entry stays until the
                // task has actually left its stack. Keep the wake-up
                // pressure on so it is rescanned promptly.
                tickle = true;
                continue;
            }
            chosen = Some(i);
            break;
        }
        let entry = chosen.and_then(|i| q.remove(i));
        if entry.is_some() && !q.is_empty() {
            tickle = true;
        }
        (entry, tickle)
    }

    /// Whether the queue holds an entry this worker could take now.
    fn has_runnable(&self, worker_id: usize) -> bool {
        let q = self.queue.lock().expect("queue poisoned");
        q.iter().any(|e| {
            e.pinned.is_none_or(|p| p == worker_id)
                && match &e.target {
                    Waiter::Task(t) => t.state() != TaskState::Running,
                    Waiter::Job(_) => true,
                }
        })
    }

    /// True when the stop flag is set, the queue is drained, no task is
    /// active and no I/O registration is pending.
    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire) == 0
            && self.reactor.pending() == 0
            && self.queue.lock().expect("queue poisoned").is_empty()
    }

    /// Graceful shutdown: waits for queued work, sets the stop flag,
    /// notifies every worker and joins them. Must not be called from a
    /// worker of this runtime.
    pub fn stop(&self) {
        loop {
            let drained = self.queue.lock().expect("queue poisoned").is_empty()
                && self.active.load(Ordering::Acquire) == 0;
            if drained {
                self.stop.store(true, Ordering::Release);
                break;
            }
            std::thread::yield_now();
        }
        for _ in 0..self.worker_count {
            self.notifier.notify_all();
        }
        let handles = std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        for h in handles {
            let _ = h.join();
        }
    }

    // Reactor surface.

    pub(crate) fn add_event(
        &self,
        fd: RawFd,
        ev: IoEvent,
        waiter: Waiter,
    ) -> Result<(), ReactorError> {
        self.reactor.add_event(fd, ev, waiter)
    }

    /// Remove a registration without waking the waiter.
    pub fn del_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        self.reactor.del_event(fd, ev).is_some()
    }

    /// Remove a registration and wake the waiter as if the event fired.
    pub fn cancel_event(&self, fd: RawFd, ev: IoEvent) -> bool {
        match self.reactor.cancel_event(fd, ev) {
            Some(w) => {
                self.wake(w);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self, fd: RawFd) {
        for w in self.reactor.cancel_all(fd) {
            self.wake(w);
        }
    }

    // Timer surface.

    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> TimerHandle {
        self.timers.add(ms, Arc::new(cb), recurring, None)
    }

    /// Timer whose callback only runs if `cond` still upgrades at expiry.
    pub fn add_cond_timer(
        &self,
        ms: u64,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<dyn Any + Send + Sync>,
    ) -> TimerHandle {
        self.timers.add(ms, Arc::new(cb), false, Some(cond))
    }

    fn drain_timers(&self) {
        let mut cbs: Vec<TimerCallback> = Vec::new();
        self.timers.drain_expired(&mut cbs);
        for cb in cbs {
            self.push(Entry { target: Waiter::Job(Box::new(move || cb())), pinned: None });
        }
    }

    /// One reactor round: bounded wait, timer drain, event dispatch.
    fn poll_io(&self) {
        let timeout = self
            .timers
            .next_delay()
            .unwrap_or(MAX_IDLE_WAIT_MS)
            .min(MAX_IDLE_WAIT_MS);
        let worker = Self::worker_id().unwrap_or(usize::MAX);
        // Flag first, then re-check the queue: a submission after the
        // check sees the flag and reaches the waker.
        self.polling.store(true, Ordering::SeqCst);
        let outcome = if self.has_runnable(worker) {
            Some(Vec::new())
        } else {
            self.reactor.poll_once(timeout)
        };
        self.polling.store(false, Ordering::SeqCst);
        match outcome {
            Some(wakes) => {
                self.drain_timers();
                for w in wakes {
                    self.wake(w);
                }
            }
            None => {
                // Another worker owns the poller; park unless work showed
                // up in the meantime.
                if !self.has_runnable(worker) && !self.stop.load(Ordering::Acquire) {
                    self.notifier.park(timeout);
                }
                self.drain_timers();
            }
        }
    }
}

fn run_worker(rt: Arc<Runtime>, worker_id: usize) {
    CURRENT_RT.set(Some(rt.clone()));
    WORKER_ID.set(worker_id);
    task::init_root();
    crate::hook::set_hook_enabled(true);
    debug!(worker = worker_id, runtime = %rt.name, "worker up");

    let idle_rt = Arc::downgrade(&rt);
    let idle = Task::new(move || idle_main(&idle_rt), DEFAULT_STACK_SIZE);
    // One recycled task for plain closures, as long as they finish.
    let mut spare: Option<Arc<Task>> = None;

    loop {
        let (entry, tickle) = rt.take_entry(worker_id);
        if tickle {
            rt.notify();
        }
        match entry {
            Some(Entry { target: Waiter::Task(t), .. }) => {
                if t.state().is_terminal() {
                    continue;
                }
                rt.active.fetch_add(1, Ordering::AcqRel);
                task::resume(&t);
                rt.active.fetch_sub(1, Ordering::AcqRel);
                if t.state() == TaskState::Ready {
                    rt.submit_task(t);
                }
            }
            Some(Entry { target: Waiter::Job(f), .. }) => {
                let t = match spare.take() {
                    Some(t) => {
                        t.reset_boxed(f);
                        t
                    }
                    None => Task::from_boxed(f, DEFAULT_STACK_SIZE),
                };
                rt.active.fetch_add(1, Ordering::AcqRel);
                task::resume(&t);
                rt.active.fetch_sub(1, Ordering::AcqRel);
                match t.state() {
                    TaskState::Ready => rt.submit_task(t),
                    st if st.is_terminal() => spare = Some(t),
                    // Suspended: ownership moved to whoever will wake it.
                    _ => {}
                }
            }
            None => {
                if idle.state().is_terminal() {
                    break;
                }
                rt.idle_workers.fetch_add(1, Ordering::AcqRel);
                task::resume(&idle);
                rt.idle_workers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
    debug!(worker = worker_id, "worker exit");
}

fn idle_main(rt: &Weak<Runtime>) {
    loop {
        let Some(strong) = rt.upgrade() else { return };
        if strong.stopping() {
            return;
        }
        strong.poll_io();
        drop(strong);
        task::yield_to_suspended();
    }
}

/// Cooperatively give up the worker; the scheduler requeues the task.
pub fn yield_now() {
    if task::current().is_some() {
        task::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("pending_io", &self.reactor.pending())
            .finish()
    }
}
