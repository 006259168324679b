//! S7 — dropping a [`FileDescriptor`] whose fd is still open terminates the
//! process (spec §4.2/§8 property 7). `Drop::drop` calls
//! `std::process::abort()`, which `#[should_panic]` cannot observe (an
//! abort isn't a panic), so this is driven as a subprocess: the same test
//! binary re-invokes itself with an env var that makes it do the unsafe
//! thing, and the parent asserts the child died by `SIGABRT`.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

use shared_state::reactor::FileDescriptor;

const CHILD_ENV_VAR: &str = "SHARED_STATE_FD_SAFETY_CHILD";

#[test]
fn dropping_an_open_fd_aborts_the_process() {
    if std::env::var_os(CHILD_ENV_VAR).is_some() {
        drop_an_open_fd_and_hang_if_it_doesnt_abort();
        return;
    }

    let exe = std::env::current_exe().expect("could not find own test binary");
    let status = Command::new(exe)
        .arg("--exact")
        .arg("dropping_an_open_fd_aborts_the_process")
        .arg("--nocapture")
        .env(CHILD_ENV_VAR, "1")
        .status()
        .expect("failed to spawn child test process");

    assert_eq!(
        status.signal(),
        Some(libc::SIGABRT),
        "dropping an open FileDescriptor must abort the process, got {status:?}"
    );
}

/// Runs only in the re-exec'd child process. Opens a real pipe fd, wraps
/// it in a [`FileDescriptor`], and drops it without ever routing it through
/// `Reactor::close_a_fd` — `Drop` must abort before this function returns.
fn drop_an_open_fd_and_hang_if_it_doesnt_abort() {
    let (read_fd, write_fd) = nix::unistd::pipe().expect("pipe(2) failed");
    // Keep the write end alive so the read end doesn't look closed for
    // unrelated reasons; it leaks in the child, which is about to abort
    // anyway.
    std::mem::forget(write_fd);

    use std::os::unix::io::IntoRawFd;
    let handle = FileDescriptor::from_raw(read_fd.into_raw_fd());
    drop(handle);

    // Only reached if Drop failed to abort, which is itself the failure:
    // exit with a distinct, non-signal code so the parent's assertion on
    // `status.signal()` fails loudly instead of silently passing.
    std::process::exit(123);
}
