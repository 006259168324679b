//! Non-blocking file descriptor handle with a FIFO waiter queue.
//!
//! Mirrors `include/async_file_descriptor.hh` from the original C++
//! implementation: construction never registers with the reactor, and
//! dropping a handle whose fd is still open is a programmer error.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::task::Waker;

#[derive(Default)]
struct WaiterQueue {
    waiters: VecDeque<Waker>,
}

impl WaiterQueue {
    fn push(&mut self, waker: Waker) {
        self.waiters.push_back(waker);
    }

    /// Wakes at most the number of waiters queued at the moment this is
    /// called. A waiter that re-suspends on the same fd from within its own
    /// resumption is re-queued and left for the *next* readiness event,
    /// which is what keeps a single hot fd from starving every other fd the
    /// reactor is driving (see spec §4.1 / §9 "Epoll dispatch").
    fn wake_ready_snapshot(&mut self) {
        let n = self.waiters.len();
        for _ in 0..n {
            if let Some(w) = self.waiters.pop_front() {
                w.wake();
            }
        }
    }
}

struct FdInner {
    fd: Cell<RawFd>,
    read_waiters: RefCell<WaiterQueue>,
    write_waiters: RefCell<WaiterQueue>,
    /// Scratch flag used by the child-process pipe reader to record that it
    /// has already observed EOF (spec §4.2).
    done_reading: Cell<bool>,
}

/// A non-blocking OS file descriptor plus its suspended waiters.
///
/// Cloning shares the same underlying fd and waiter queues (the reactor's
/// registration table holds one such clone so it can resume waiters from
/// the epoll dispatch loop without an external lifetime threaded through
/// every awaitable).
#[derive(Clone)]
pub struct FileDescriptor {
    inner: Rc<FdInner>,
}

impl FileDescriptor {
    /// Wraps an already-non-blocking fd. Callers are responsible for having
    /// set `O_NONBLOCK` before constructing this handle.
    pub fn from_raw(fd: RawFd) -> Self {
        assert!(fd >= 0, "FileDescriptor::from_raw requires a valid fd");
        Self {
            inner: Rc::new(FdInner {
                fd: Cell::new(fd),
                read_waiters: RefCell::new(WaiterQueue::default()),
                write_waiters: RefCell::new(WaiterQueue::default()),
                done_reading: Cell::new(false),
            }),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.inner.fd.get()
    }

    pub fn is_open(&self) -> bool {
        self.inner.fd.get() >= 0
    }

    pub fn add_read_waiter(&self, waker: Waker) {
        self.inner.read_waiters.borrow_mut().push(waker);
    }

    pub fn add_write_waiter(&self, waker: Waker) {
        self.inner.write_waiters.borrow_mut().push(waker);
    }

    pub(crate) fn resume_pending(&self, readable: bool, writable: bool) {
        if readable {
            self.inner.read_waiters.borrow_mut().wake_ready_snapshot();
        }
        if writable {
            self.inner.write_waiters.borrow_mut().wake_ready_snapshot();
        }
    }

    pub fn done_reading(&self) -> bool {
        self.inner.done_reading.get()
    }

    pub fn set_done_reading(&self, value: bool) {
        self.inner.done_reading.set(value);
    }

    /// Marks the fd as released. Only the reactor's async close operation
    /// should call this, after the underlying `close(2)` has actually been
    /// issued — see [`crate::reactor::Reactor::close_a_fd`].
    pub(crate) fn mark_closed(&self) {
        self.inner.fd.set(-1);
    }
}

impl Drop for FdInner {
    fn drop(&mut self) {
        let fd = self.fd.get();
        if fd >= 0 {
            tracing::error!(
                fd,
                backtrace = %std::backtrace::Backtrace::force_capture(),
                "FileDescriptor dropped while still open; fds must be released via \
                 Reactor::close_a_fd before the handle is destroyed"
            );
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Wake, Waker};

    struct CountingWaker(Cell<usize>);
    impl Wake for CountingWaker {
        fn wake(self: Rc<Self>) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn resume_pending_wakes_snapshot_only() {
        let fd = FileDescriptor::from_raw(0).clone();
        // Don't actually exercise fd 0's lifecycle; mark closed immediately
        // after the assertions so Drop doesn't abort this test process.
        let counter = Rc::new(CountingWaker(Cell::new(0)));
        let waker: Waker = counter.clone().into();
        fd.add_read_waiter(waker.clone());
        fd.add_read_waiter(waker);
        fd.resume_pending(true, false);
        assert_eq!(counter.0.get(), 2);
        fd.mark_closed();
    }

    #[test]
    fn done_reading_flag_round_trips() {
        let fd = FileDescriptor::from_raw(0);
        assert!(!fd.done_reading());
        fd.set_done_reading(true);
        assert!(fd.done_reading());
        fd.mark_closed();
    }
}
