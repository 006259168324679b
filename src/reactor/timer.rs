//! One-shot timer backed by `timerfd_create` (spec §4.6).

use nix::errno::Errno;

use super::fd::FileDescriptor;
use super::ops;
use super::{Interest, Reactor};

/// An armable one-shot monotonic timer exposing an awaitable `wait`.
///
/// Owns its fd directly via raw `timerfd_create`/`timerfd_settime` rather
/// than through `nix::sys::timerfd::TimerFd`, so that — like every other
/// resource in this crate — it is released exclusively through
/// [`Reactor::close_a_fd`] and never by an owning wrapper's `Drop` (spec
/// §5: "every FileDescriptor ... must be closed via the reactor's async
/// close before the handle is destroyed").
pub struct Timer {
    handle: FileDescriptor,
}

impl Timer {
    pub fn new(reactor: &Reactor) -> Result<Self, Errno> {
        let raw = unsafe { libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC) };
        if raw < 0 {
            return Err(Errno::last());
        }
        let handle = FileDescriptor::from_raw(raw);
        reactor.attach(handle.clone(), Interest::ReadOnly)?;
        Ok(Self { handle })
    }

    /// Arms the timer for `sec` seconds and `nsec` nanoseconds from now,
    /// then awaits its single expiration. Returns `Ok(true)` iff exactly
    /// the 8-byte expiration counter was read (spec §4.6).
    pub async fn wait(&self, sec: i64, nsec: i64) -> Result<bool, Errno> {
        if sec < 0 || !(0..=999_999_999).contains(&nsec) {
            return Err(Errno::EINVAL);
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: sec, tv_nsec: nsec },
        };
        let rc = unsafe {
            libc::timerfd_settime(self.handle.raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(Errno::last());
        }
        let count = ops::read_timer(&self.handle).await?;
        Ok(count > 0)
    }

    pub async fn close(self, reactor: &Reactor) -> Result<(), Errno> {
        reactor.close_a_fd(&self.handle).await
    }
}
