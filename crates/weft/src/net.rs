//! TCP sockets routed through the interposition layer.
//!
//! Every descriptor created here is registered in the fd context table,
//! which flips it to kernel non-blocking; on scheduler workers the
//! blocking call surface below is therefore cooperative.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::fd::FdTable;
use crate::hook;
use crate::reactor::IoEvent;

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(v4.ip().octets()) },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (&raw const sin).cast::<u8>(),
                    (&raw mut storage).cast::<u8>(),
                    size_of::<libc::sockaddr_in>(),
                );
            }
            (storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (&raw const sin6).cast::<u8>(),
                    (&raw mut storage).cast::<u8>(),
                    size_of::<libc::sockaddr_in6>(),
                );
            }
            (storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// A TCP socket whose blocking operations suspend the calling task.
pub struct Socket {
    fd: RawFd,
    closed: AtomicBool,
}

impl Socket {
    /// Fresh TCP socket for the family of `addr`, registered with the
    /// fd table (which makes the kernel side non-blocking).
    pub fn tcp(addr: &SocketAddr) -> io::Result<Self> {
        let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self::from_fd(fd);
        sock.set_reuse_addr();
        Ok(sock)
    }

    pub fn from_fd(fd: RawFd) -> Self {
        FdTable::global().get(fd, true);
        Self { fd, closed: AtomicBool::new(false) }
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn set_reuse_addr(&self) {
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&raw const one).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        let rc = unsafe { libc::bind(self.fd, (&raw const storage).cast(), len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let rc = unsafe { libc::listen(self.fd, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection, suspending until a peer arrives.
    pub fn accept(&self) -> io::Result<(Self, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = 0;
        let fd = hook::do_io(self.fd, IoEvent::READ, || unsafe {
            // addrlen is in-out; rearm it for every attempt.
            len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            libc::accept(self.fd, (&raw mut storage).cast(), &raw mut len) as isize
        })? as RawFd;
        let peer = sockaddr_to(&storage)
            .ok_or_else(|| io::Error::other("accepted peer with unknown address family"))?;
        debug!(fd, %peer, "accepted");
        Ok((Self::from_fd(fd), peer))
    }

    /// Connect with the process-wide connect timeout (`None`) or an
    /// explicit one in milliseconds.
    pub fn connect(&self, addr: &SocketAddr, timeout_ms: Option<u64>) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        match timeout_ms {
            Some(ms) => hook::connect_with_timeout(self.fd, (&raw const storage).cast(), len, ms),
            None => hook::connect(self.fd, (&raw const storage).cast(), len),
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        hook::do_io(self.fd, IoEvent::READ, || unsafe {
            libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0)
        })
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        hook::do_io(self.fd, IoEvent::WRITE, || unsafe {
            libc::send(self.fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL)
        })
    }

    /// Scatter read into iovecs (typically a byte buffer's write view).
    pub fn recv_vectored(&self, iovs: &[libc::iovec]) -> io::Result<usize> {
        hook::do_io(self.fd, IoEvent::READ, || unsafe {
            libc::readv(self.fd, iovs.as_ptr(), iovs.len() as libc::c_int)
        })
    }

    /// Gather write from iovecs (typically a byte buffer's read view).
    pub fn send_vectored(&self, iovs: &[libc::iovec]) -> io::Result<usize> {
        hook::do_io(self.fd, IoEvent::WRITE, || unsafe {
            libc::writev(self.fd, iovs.as_ptr(), iovs.len() as libc::c_int)
        })
    }

    pub fn set_recv_timeout(&self, ms: u64) {
        if let Some(ctx) = FdTable::global().get(self.fd, false) {
            ctx.set_timeout(IoEvent::READ, ms);
        }
    }

    pub fn set_send_timeout(&self, ms: u64) {
        if let Some(ctx) = FdTable::global().get(self.fd, false) {
            ctx.set_timeout(IoEvent::WRITE, ms);
        }
    }

    /// User-facing non-block flag; the kernel descriptor stays
    /// non-blocking either way.
    pub fn set_nonblocking(&self, v: bool) {
        if let Some(ctx) = FdTable::global().get(self.fd, false) {
            ctx.set_user_nonblock(v);
        }
    }

    pub fn is_nonblocking(&self) -> bool {
        FdTable::global()
            .get(self.fd, false)
            .is_some_and(|ctx| ctx.user_nonblock())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe { libc::getsockname(self.fd, (&raw mut storage).cast(), &raw mut len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage).ok_or_else(|| io::Error::other("unknown address family"))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe { libc::getpeername(self.fd, (&raw mut storage).cast(), &raw mut len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage).ok_or_else(|| io::Error::other("unknown address family"))
    }

    /// Half-close both directions; wakes a peer (and our own reader)
    /// without releasing the descriptor.
    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }

    /// Cancel reactor registrations, drop the fd context, close the fd.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(fd = self.fd, "socket close");
        let _ = hook::close(self.fd);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("local", &self.local_addr().ok())
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_roundtrip_v4() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_roundtrip_v6() {
        let addr: SocketAddr = "[::1]:9001".parse().unwrap();
        let (storage, _) = sockaddr_from(&addr);
        assert_eq!(sockaddr_to(&storage), Some(addr));
    }
}
