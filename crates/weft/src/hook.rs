//! Blocking-I/O interposition.
//!
//! On a scheduler worker (hook flag set) an operation that would block is
//! turned into a cooperative suspension: `EAGAIN` arms the fd with the
//! reactor, optionally installs a conditional timeout timer, and yields.
//! From the task's point of view the call is an ordinary blocking one;
//! the worker thread is free to run other tasks meanwhile.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use tracing::debug;

use crate::fd::{FdTable, INFINITE};
use crate::reactor::IoEvent;
use crate::runtime::{Runtime, Waiter};
use crate::task;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Process-wide connect timeout; send/recv timeouts live per fd.
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(INFINITE);

// Out of line so the TLS base is recomputed on whatever worker the task
// currently occupies.
#[inline(never)]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.get()
}

/// Per-thread toggle; scheduler workers set it at boot, everything else
/// defaults off.
#[inline(never)]
pub fn set_hook_enabled(flag: bool) {
    HOOK_ENABLED.set(flag);
}

pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Release);
}

pub fn connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS.load(Ordering::Acquire)
}

fn check_ret(n: isize) -> io::Result<usize> {
    if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
}

/// Park the current task until `fd` is ready for `ev` or the timeout
/// fires. On timeout the registration is cancelled and `ETIMEDOUT`
/// returned; on a plain wake the caller retries its operation.
fn suspend_on(rt: &Arc<Runtime>, fd: RawFd, ev: IoEvent, timeout_ms: u64) -> io::Result<()> {
    let me = task::current()
        .ok_or_else(|| io::Error::other("blocking socket op outside a task"))?;

    let cell = Arc::new(AtomicI32::new(0));
    let timer = if timeout_ms != INFINITE {
        let weak_cell = Arc::downgrade(&cell);
        let weak_rt = Arc::downgrade(rt);
        let cond: Arc<dyn Any + Send + Sync> = cell.clone();
        let handle = rt.add_cond_timer(
            timeout_ms,
            move || {
                let Some(cell) = weak_cell.upgrade() else { return };
                if cell.swap(libc::ETIMEDOUT, Ordering::AcqRel) != 0 {
                    return;
                }
                if let Some(rt) = weak_rt.upgrade() {
                    rt.cancel_event(fd, ev);
                }
            },
            Arc::downgrade(&cond),
        );
        // `cond` may drop now; the weak guard tracks `cell` itself.
        drop(cond);
        Some(handle)
    } else {
        None
    };

    if let Err(e) = rt.add_event(fd, ev, Waiter::Task(me)) {
        debug!(fd, ?ev, error = %e, "arm event failed");
        if let Some(t) = &timer {
            t.cancel();
        }
        return Err(io::Error::other(e));
    }
    task::yield_to_suspended();

    if let Some(t) = &timer {
        t.cancel();
    }
    let code = cell.load(Ordering::Acquire);
    if code != 0 {
        return Err(io::Error::from_raw_os_error(code));
    }
    Ok(())
}

/// The generic I/O transform: direct call without hooks / non-socket /
/// user-requested non-blocking; otherwise EINTR retry and EAGAIN →
/// suspension with the fd's directional timeout.
pub(crate) fn do_io<F>(fd: RawFd, ev: IoEvent, mut op: F) -> io::Result<usize>
where
    F: FnMut() -> isize,
{
    if !hook_enabled() {
        return check_ret(op());
    }
    let Some(ctx) = FdTable::global().get(fd, false) else {
        return check_ret(op());
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return check_ret(op());
    }
    let timeout = ctx.timeout(ev);
    loop {
        let n = op();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => {
                let rt = Runtime::current()
                    .ok_or_else(|| io::Error::other("blocking socket op outside the runtime"))?;
                suspend_on(&rt, fd, ev, timeout)?;
                // Readiness (or a cancel) arrived; try again.
            }
            _ => return Err(err),
        }
    }
}

/// Non-blocking connect turned cooperative: `EINPROGRESS` waits for
/// writability, then the result is read back with `SO_ERROR`.
pub(crate) fn connect(fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()> {
    let timeout = connect_timeout_ms();
    connect_with_timeout(fd, addr, len, timeout)
}

pub(crate) fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
    timeout_ms: u64,
) -> io::Result<()> {
    let direct = !hook_enabled();
    let ctx = FdTable::global().get(fd, false);
    if let Some(ctx) = &ctx {
        if ctx.is_closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
    }
    let hooked = !direct
        && ctx.as_ref().is_some_and(|c| c.is_socket() && !c.user_nonblock());

    let n = unsafe { libc::connect(fd, addr, len) };
    if n == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if !hooked || err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(err);
    }

    let rt = Runtime::current()
        .ok_or_else(|| io::Error::other("connect outside the runtime"))?;
    suspend_on(&rt, fd, IoEvent::WRITE, timeout_ms)?;

    let mut so_error: libc::c_int = 0;
    let mut optlen = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut so_error).cast(),
            &raw mut optlen,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

/// Close with cleanup: cancel every reactor registration on the fd and
/// drop its context before handing the descriptor back to the kernel.
pub(crate) fn close(fd: RawFd) -> io::Result<()> {
    if FdTable::global().get(fd, false).is_some() {
        if let Some(rt) = Runtime::try_existing() {
            rt.cancel_all(fd);
        }
        FdTable::global().remove(fd);
    }
    let n = unsafe { libc::close(fd) };
    if n < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Cooperative sleep on a worker; a plain thread sleep elsewhere.
pub fn sleep_ms(ms: u64) {
    match (task::current(), Runtime::current()) {
        (Some(me), Some(rt)) => {
            let weak_rt = Arc::downgrade(&rt);
            rt.add_timer(
                ms,
                move || {
                    if let Some(rt) = weak_rt.upgrade() {
                        rt.submit_task(me.clone());
                    }
                },
                false,
            );
            task::yield_to_suspended();
        }
        _ => std::thread::sleep(std::time::Duration::from_millis(ms)),
    }
}
