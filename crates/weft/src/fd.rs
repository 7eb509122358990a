//! Process-wide descriptor context table.
//!
//! On first observation of a socket fd the kernel descriptor is switched
//! to non-blocking and that fact recorded; the user-facing non-block flag
//! is tracked separately so callers observe exactly what they set while
//! the kernel always sees non-blocking.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::reactor::IoEvent;

/// Sentinel for "no timeout".
pub const INFINITE: u64 = u64::MAX;

pub struct FdContext {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdContext {
    fn probe(fd: RawFd) -> Self {
        let mut is_socket = false;
        let mut sys_nonblock = false;
        unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) == 0 {
                is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
                if is_socket {
                    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                    if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    }
                    sys_nonblock = true;
                }
            }
        }
        Self {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(INFINITE),
            send_timeout_ms: AtomicU64::new(INFINITE),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// The non-block flag as the user set it; the kernel flag may differ.
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    pub fn timeout(&self, ev: IoEvent) -> u64 {
        if ev.contains(IoEvent::READ) {
            self.recv_timeout_ms.load(Ordering::Acquire)
        } else {
            self.send_timeout_ms.load(Ordering::Acquire)
        }
    }

    pub fn set_timeout(&self, ev: IoEvent, ms: u64) {
        if ev.contains(IoEvent::READ) {
            self.recv_timeout_ms.store(ms, Ordering::Release);
        } else {
            self.send_timeout_ms.store(ms, Ordering::Release);
        }
    }
}

pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdContext>>>>,
}

static TABLE: Lazy<FdTable> = Lazy::new(|| FdTable { slots: RwLock::new(vec![None; 64]) });

impl FdTable {
    pub fn global() -> &'static Self {
        &TABLE
    }

    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().expect("fd table poisoned");
            if let Some(slot) = slots.get(fd as usize) {
                if slot.is_some() || !auto_create {
                    return slot.clone();
                }
            } else if !auto_create {
                return None;
            }
        }
        let mut slots = self.slots.write().expect("fd table poisoned");
        if slots.len() <= fd as usize {
            slots.resize((fd as usize) * 3 / 2 + 1, None);
        }
        if slots[fd as usize].is_none() {
            slots[fd as usize] = Some(Arc::new(FdContext::probe(fd)));
        }
        slots[fd as usize].clone()
    }

    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().expect("fd table poisoned");
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}
