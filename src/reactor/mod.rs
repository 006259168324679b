//! Single-threaded cooperative I/O runtime: an epoll-backed reactor driving
//! lightweight tasks. See spec §4.1.

pub mod fd;
pub mod ops;
pub mod task;
pub mod timer;

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};

pub use fd::FileDescriptor;
pub use task::{spawn, Task};

/// Interest a fd can be attached with. Always edge-triggered (spec §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        let base = EpollFlags::EPOLLET;
        match self {
            Interest::ReadOnly => base | EpollFlags::EPOLLIN,
            Interest::WriteOnly => base | EpollFlags::EPOLLOUT,
            Interest::ReadWrite => base | EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT,
        }
    }
}

struct Registration {
    handle: FileDescriptor,
    current: EpollFlags,
    dirty: bool,
}

/// Owns the epoll instance and the registration table of every fd attached
/// to it. There is exactly one `Reactor` per process; it is not `Send` —
/// the whole design is single-threaded (spec §5).
pub struct Reactor {
    epoll_fd: RawFd,
    registry: RefCell<HashMap<RawFd, Registration>>,
}

impl Reactor {
    pub fn new() -> Result<Self, Errno> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll_fd,
            registry: RefCell::new(HashMap::new()),
        })
    }

    /// Registers `handle` with the reactor under the given interest.
    /// Construction of a [`FileDescriptor`] never does this implicitly —
    /// callers choose the attach mode (spec §4.2).
    pub fn attach(&self, handle: FileDescriptor, interest: Interest) -> Result<(), Errno> {
        let raw = handle.raw_fd();
        let flags = interest.flags();
        let mut event = EpollEvent::new(flags, raw as u64);
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, raw, Some(&mut event))?;
        self.registry.borrow_mut().insert(
            raw,
            Registration { handle, current: flags, dirty: false },
        );
        Ok(())
    }

    pub fn detach(&self, raw: RawFd) {
        let mut registry = self.registry.borrow_mut();
        if registry.remove(&raw).is_some() {
            let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, raw, None);
        }
    }

    fn restage(&self, raw: RawFd, f: impl FnOnce(EpollFlags) -> EpollFlags) {
        let mut registry = self.registry.borrow_mut();
        if let Some(reg) = registry.get_mut(&raw) {
            reg.current = f(reg.current);
            reg.dirty = true;
        }
    }

    pub fn watch_read(&self, raw: RawFd) {
        self.restage(raw, |f| f | EpollFlags::EPOLLIN);
    }

    pub fn watch_write(&self, raw: RawFd) {
        self.restage(raw, |f| f | EpollFlags::EPOLLOUT);
    }

    pub fn unwatch_read(&self, raw: RawFd) {
        self.restage(raw, |f| f & !EpollFlags::EPOLLIN);
    }

    pub fn unwatch_write(&self, raw: RawFd) {
        self.restage(raw, |f| f & !EpollFlags::EPOLLOUT);
    }

    /// Flushes every staged interest-mask change via `epoll_ctl` before the
    /// next `epoll_wait` — batched exactly once per loop turn (spec §4.1).
    fn flush_interest_changes(&self) {
        let mut registry = self.registry.borrow_mut();
        for (raw, reg) in registry.iter_mut() {
            if reg.dirty {
                let mut event = EpollEvent::new(reg.current, *raw as u64);
                let _ = epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, *raw, Some(&mut event));
                reg.dirty = false;
            }
        }
    }

    /// Awaitable, non-retrying async close (spec §4.1/§4.2): attempts
    /// `close(2)`; `EAGAIN`/`EWOULDBLOCK`/`EINPROGRESS` are treated as
    /// success since the fd is released kernel-side regardless, and any
    /// other error is reported without a second attempt (retrying close on
    /// error risks closing an fd some other thread/syscall has since
    /// reused — the classic double-close hazard).
    pub async fn close_a_fd(&self, handle: &FileDescriptor) -> Result<(), Errno> {
        let raw = handle.raw_fd();
        self.detach(raw);
        let result = nix::unistd::close(raw);
        handle.mark_closed();
        match result {
            Ok(()) => Ok(()),
            Err(e) if matches!(e, Errno::EAGAIN | Errno::EWOULDBLOCK | Errno::EINPROGRESS) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Runs every ready task, flushes staged interest changes, then waits
    /// up to `timeout_ms` milliseconds (`-1` blocks indefinitely, matching
    /// `epoll_wait`'s own convention) for readiness and dispatches it.
    /// [`run`](Reactor::run) is this method called in a loop forever; tests
    /// call it directly with a bounded timeout so they can drive a handful
    /// of turns without blocking the test process on an idle reactor.
    pub fn turn(&self, timeout_ms: isize) -> Result<(), Errno> {
        let mut events = vec![EpollEvent::empty(); 1024];
        task::run_ready_queue();
        self.flush_interest_changes();

        let n = match epoll_wait(self.epoll_fd, &mut events, timeout_ms) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e),
        };

        let registry = self.registry.borrow();
        for ev in &events[..n] {
            let raw = ev.data() as RawFd;
            if let Some(reg) = registry.get(&raw) {
                let flags = ev.events();
                let readable = flags.intersects(
                    EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                );
                let writable = flags.intersects(
                    EpollFlags::EPOLLOUT | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR,
                );
                reg.handle.resume_pending(readable, writable);
            }
        }
        Ok(())
    }

    /// Drains the ready queue, flushes staged interest changes, waits for
    /// readiness, and dispatches. Never returns under normal operation.
    pub fn run(&self) -> ! {
        loop {
            if let Err(e) = self.turn(-1) {
                tracing::error!(error = %e, "epoll_wait failed");
                std::process::abort();
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epoll_fd);
    }
}
