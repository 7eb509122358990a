//! Stackful cooperative tasks.
//!
//! Each worker thread owns a distinguished root task bound to the OS
//! stack; user tasks run on their own heap-allocated stacks and are
//! entered with [`resume`]. A running task leaves only through one of
//! the yield functions or by finishing, both of which restore the root.
//! Suspended tasks are owned by whoever holds their `Arc` (a waker, a
//! channel, a timer, the reactor).

mod arch;

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::cell::{RefCell, UnsafeCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tracing::error;

pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Init = 0,
    Ready,
    Running,
    Suspended,
    Done,
    Failed,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Suspended,
            4 => Self::Done,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

struct Stack {
    base: *mut u8,
    layout: Layout,
}

impl Stack {
    fn alloc(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 16).expect("stack layout");
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }
        Self { base, layout }
    }

    fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.layout.size()) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// A stackful unit of cooperative execution.
pub struct Task {
    id: u64,
    // None for the per-thread root task, which owns the OS stack.
    stack: Option<Stack>,
    ctx: UnsafeCell<arch::Context>,
    state: AtomicU8,
    entry: spin::Mutex<Option<EntryFn>>,
}

// The stack and context are only touched by the thread the task is
// currently running on; state transitions hand that right over before
// the Arc crosses threads.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

thread_local! {
    static ROOT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
    static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

impl Task {
    /// Create a task around `entry` with its own stack. It is not
    /// scheduled; hand it to the runtime or `resume` it from a worker.
    pub fn new(entry: impl FnOnce() + Send + 'static, stack_size: usize) -> Arc<Self> {
        Self::from_boxed(Box::new(entry), stack_size)
    }

    pub(crate) fn from_boxed(entry: EntryFn, stack_size: usize) -> Arc<Self> {
        assert!(stack_size >= 4096, "task stack unreasonably small");
        let stack = Stack::alloc(stack_size);
        let ctx = unsafe { arch::prepare(stack.top(), task_main) };
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            state: AtomicU8::new(TaskState::Init as u8),
            entry: spin::Mutex::new(Some(entry)),
        })
    }

    fn new_root() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            stack: None,
            ctx: UnsafeCell::new(arch::Context::empty()),
            state: AtomicU8::new(TaskState::Running as u8),
            entry: spin::Mutex::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, st: TaskState) {
        self.state.store(st as u8, Ordering::Release);
    }

    /// Re-arm a finished (or never-started) task with a new entry,
    /// reusing its stack. State returns to `Init`.
    pub fn reset(&self, entry: impl FnOnce() + Send + 'static) {
        self.reset_boxed(Box::new(entry));
    }

    pub(crate) fn reset_boxed(&self, entry: EntryFn) {
        let st = self.state();
        assert!(
            matches!(st, TaskState::Init | TaskState::Done | TaskState::Failed),
            "reset of a live task (state {st:?})"
        );
        let stack = self.stack.as_ref().expect("root task cannot be reset");
        unsafe { *self.ctx.get() = arch::prepare(stack.top(), task_main) };
        *self.entry.lock() = Some(entry);
        self.set_state(TaskState::Init);
    }
}

// Everything touching the thread-locals below stays out of line: a task
// can migrate between workers across a yield, so the TLS base must be
// recomputed on every access rather than cached in a callee-saved
// register across a context switch.

/// Install the root task for this thread. Idempotent; every scheduler
/// worker calls it once at boot.
#[inline(never)]
pub(crate) fn init_root() {
    ROOT.with_borrow_mut(|root| {
        if root.is_none() {
            let r = Task::new_root();
            CURRENT.set(Some(r.clone()));
            *root = Some(r);
        }
    });
}

/// The currently running task, or `None` on the root / a plain thread.
#[inline(never)]
pub fn current() -> Option<Arc<Task>> {
    let cur = CURRENT.with_borrow(Clone::clone)?;
    let root = ROOT.with_borrow(Clone::clone);
    match root {
        Some(r) if Arc::ptr_eq(&r, &cur) => None,
        _ => Some(cur),
    }
}

#[inline(never)]
fn root() -> Arc<Task> {
    ROOT.with_borrow(Clone::clone).expect("thread has no root task")
}

/// Enter `task` until it yields or finishes. Must run on the root task
/// of a prepared thread; the caller observes the task's state on return.
#[inline(never)]
pub(crate) fn resume(task: &Arc<Task>) {
    let root = root();
    let st = task.state();
    assert!(
        matches!(st, TaskState::Init | TaskState::Ready | TaskState::Suspended),
        "resume of task in state {st:?}"
    );
    task.set_state(TaskState::Running);
    CURRENT.set(Some(task.clone()));
    let save = root.ctx.get();
    let restore = task.ctx.get();
    drop(root);
    unsafe { arch::switch(save, restore) };
    // Back on the root stack; the yield path has restored CURRENT.
}

#[inline(never)]
fn yield_with(st: TaskState) {
    let task = CURRENT.with_borrow(Clone::clone).expect("yield outside any task");
    let root = root();
    assert!(!Arc::ptr_eq(&task, &root), "root task cannot yield");
    task.set_state(st);
    CURRENT.set(Some(root.clone()));
    let save = task.ctx.get();
    let restore = root.ctx.get();
    // Drop both strong references before leaving this stack: a
    // suspended task must be owned by its waker, not by its own frames.
    drop(task);
    drop(root);
    unsafe { arch::switch(save, restore) };
}

/// Suspend the current task; ownership rests with whoever will wake it.
pub fn yield_to_suspended() {
    yield_with(TaskState::Suspended);
}

/// Yield but stay runnable; the scheduler requeues the task.
pub fn yield_to_ready() {
    yield_with(TaskState::Ready);
}

extern "C" fn task_main() -> ! {
    let raw: *const Task;
    {
        let task = CURRENT.with_borrow(Clone::clone).expect("task entry without current");
        raw = Arc::as_ptr(&task);
        let entry = task.entry.lock().take();
        let outcome = catch_unwind(AssertUnwindSafe(move || {
            if let Some(f) = entry {
                f();
            }
        }));
        match outcome {
            Ok(()) => task.set_state(TaskState::Done),
            Err(_) => {
                error!(task = task.id, "task terminated by panic");
                task.set_state(TaskState::Failed);
            }
        }
    }
    // Every droppable above is gone; switch home through raw pointers so
    // this dead stack holds no strong reference to the task.
    switch_home(raw)
}

#[inline(never)]
fn switch_home(raw: *const Task) -> ! {
    let root = root();
    CURRENT.set(Some(root.clone()));
    let restore = root.ctx.get();
    drop(root);
    unsafe {
        arch::switch((*raw).ctx.get(), restore);
    }
    unreachable!("terminated task resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_to_completion() {
        init_root();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = Task::new(move || { h.fetch_add(1, Ordering::SeqCst); }, DEFAULT_STACK_SIZE);
        resume(&t);
        assert_eq!(t.state(), TaskState::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn yield_and_resume() {
        init_root();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let t = Task::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                yield_to_suspended();
                s.fetch_add(1, Ordering::SeqCst);
            },
            DEFAULT_STACK_SIZE,
        );
        resume(&t);
        assert_eq!(t.state(), TaskState::Suspended);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        resume(&t);
        assert_eq!(t.state(), TaskState::Done);
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panic_becomes_failed() {
        init_root();
        let t = Task::new(|| panic!("boom"), DEFAULT_STACK_SIZE);
        resume(&t);
        assert_eq!(t.state(), TaskState::Failed);
    }

    #[test]
    fn reset_reuses_stack() {
        init_root();
        let t = Task::new(|| {}, DEFAULT_STACK_SIZE);
        resume(&t);
        assert_eq!(t.state(), TaskState::Done);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        t.reset(move || { h.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(t.state(), TaskState::Init);
        resume(&t);
        assert_eq!(t.state(), TaskState::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
