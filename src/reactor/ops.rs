//! Awaitable syscall operations.
//!
//! Each wrapper follows the contract from spec §4.3: call the syscall: on
//! `EAGAIN`/`EWOULDBLOCK`/`EINPROGRESS` suspend until the fd's readiness
//! fires, on any other errno report to the caller (or abort if the caller
//! passed no error channel), otherwise resume with the value. Whether an
//! operation is logically single-shot (read/write/recv/send/accept/connect)
//! or multi-shot (waitpid, timer reads — both tolerate a spurious wake that
//! still isn't real progress) is purely documentation here: both shapes
//! retry the syscall the next time they're polled, which is exactly once
//! per wake.

use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::errno::Errno;
use nix::sys::socket::SockaddrLike;

use super::fd::FileDescriptor;

/// Which waiter queue an operation suspends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Resolves once the owning fd has seen a readiness event in `direction`.
/// Always registers on the first poll and completes on the second — the
/// wake only ever fires after the reactor observed real readiness.
struct Readiness<'a> {
    fd: &'a FileDescriptor,
    direction: Direction,
    registered: bool,
}

impl<'a> Future for Readiness<'a> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.registered {
            return Poll::Ready(());
        }
        self.registered = true;
        match self.direction {
            Direction::Read => self.fd.add_read_waiter(cx.waker().clone()),
            Direction::Write => self.fd.add_write_waiter(cx.waker().clone()),
        }
        Poll::Pending
    }
}

fn wait_readable(fd: &FileDescriptor) -> Readiness<'_> {
    Readiness { fd, direction: Direction::Read, registered: false }
}

fn wait_writable(fd: &FileDescriptor) -> Readiness<'_> {
    Readiness { fd, direction: Direction::Write, registered: false }
}

fn is_transient(e: Errno) -> bool {
    matches!(e, Errno::EAGAIN | Errno::EWOULDBLOCK | Errno::EINPROGRESS)
}

/// Reports a terminal syscall error to the caller's error slot, or aborts
/// the process if the caller opted out of error handling by passing `None`
/// — spec §4.3/§7's "null error channel means terminate with a diagnostic".
pub fn report_or_abort<T>(
    result: Result<T, Errno>,
    error_slot: Option<&mut Option<Errno>>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => match error_slot {
            Some(slot) => {
                *slot = Some(e);
                None
            }
            None => {
                tracing::error!(
                    error = %e,
                    backtrace = %std::backtrace::Backtrace::force_capture(),
                    "fatal syscall error with no error channel; aborting"
                );
                std::process::abort();
            }
        },
    }
}

/// Awaitable non-blocking read.
pub async fn read(fd: &FileDescriptor, buf: &mut [u8]) -> Result<usize, Errno> {
    loop {
        match nix::unistd::read(fd.raw_fd(), buf) {
            Ok(n) => return Ok(n),
            Err(e) if is_transient(e) => wait_readable(fd).await,
            Err(e) => return Err(e),
        }
    }
}

/// Awaitable non-blocking write.
pub async fn write(fd: &FileDescriptor, buf: &[u8]) -> Result<usize, Errno> {
    loop {
        match nix::unistd::write(fd.raw_fd(), buf) {
            Ok(n) => return Ok(n),
            Err(e) if is_transient(e) => wait_writable(fd).await,
            Err(e) => return Err(e),
        }
    }
}

/// Awaitable non-blocking `recv(2)`.
pub async fn recv(fd: &FileDescriptor, buf: &mut [u8]) -> Result<usize, Errno> {
    loop {
        let rc = unsafe {
            libc::recv(
                fd.raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let e = Errno::last();
        if is_transient(e) {
            wait_readable(fd).await;
        } else {
            return Err(e);
        }
    }
}

/// Awaitable non-blocking `send(2)`.
pub async fn send(fd: &FileDescriptor, buf: &[u8]) -> Result<usize, Errno> {
    loop {
        let rc = unsafe {
            libc::send(
                fd.raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let e = Errno::last();
        if is_transient(e) {
            wait_writable(fd).await;
        } else {
            return Err(e);
        }
    }
}

/// Awaitable non-blocking `accept4(2)` (sets `O_NONBLOCK` on the new fd so
/// the accepted connection is immediately reactor-ready).
pub async fn accept(listener: &FileDescriptor) -> Result<RawFd, Errno> {
    loop {
        let rc = unsafe {
            libc::accept4(
                listener.raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if rc >= 0 {
            return Ok(rc);
        }
        let e = Errno::last();
        if is_transient(e) {
            wait_readable(listener).await;
        } else {
            return Err(e);
        }
    }
}

/// Awaitable non-blocking `connect(2)`. The initial call almost always
/// returns `EINPROGRESS`; completion is confirmed by the caller probing
/// `getpeername` once this resolves (spec §4.5).
pub async fn connect<A: SockaddrLike>(fd: &FileDescriptor, addr: &A) -> Result<(), Errno> {
    let rc = unsafe {
        libc::connect(fd.raw_fd(), addr.as_ptr(), addr.len())
    };
    if rc == 0 {
        return Ok(());
    }
    let e = Errno::last();
    if !is_transient(e) {
        return Err(e);
    }
    wait_writable(fd).await;
    Ok(())
}

/// Multi-shot awaitable `waitpid(pid, WNOHANG)`. Readiness on the exit-pipe
/// eventfd-equivalent used for child supervision can be spurious, so this
/// re-suspends until the child has actually exited.
pub async fn wait_child(exit_signal: &FileDescriptor, pid: nix::unistd::Pid) -> Result<nix::sys::wait::WaitStatus, Errno> {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => wait_readable(exit_signal).await,
            Ok(status) => return Ok(status),
            Err(e) => return Err(e),
        }
    }
}

/// Awaitable timerfd read: returns the 8-byte expiration counter.
pub async fn read_timer(fd: &FileDescriptor) -> Result<u64, Errno> {
    let mut buf = [0u8; 8];
    let mut filled = 0usize;
    loop {
        match nix::unistd::read(fd.raw_fd(), &mut buf[filled..]) {
            Ok(0) => return Err(Errno::EIO),
            Ok(n) => {
                filled += n;
                if filled == 8 {
                    return Ok(u64::from_ne_bytes(buf));
                }
            }
            Err(e) if is_transient(e) => wait_readable(fd).await,
            Err(e) => return Err(e),
        }
    }
}
