//! Forked child processes wired into the reactor via stdin/stdout pipes.
//!
//! Grounded on `examples/original_source/src/piped_async_command.cc`:
//! two pipes, `fork()`, the child dup2s its ends onto stdin/stdout and
//! `execvp`s, the parent keeps the other ends and drives them through the
//! reactor. Shutdown mirrors `PipedAsyncCommand`'s destructor: a
//! non-blocking `waitpid`, and a `SIGKILL` if the child hasn't exited once
//! we're done with it.

use std::ffi::CString;

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::reactor::{fd::FileDescriptor, ops, Interest, Reactor};

fn set_nonblocking(raw: std::os::unix::io::RawFd) -> Result<(), Errno> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL)?);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A running child process reachable through a stdin pipe and a stdout
/// pipe, both registered with the reactor.
pub struct ChildProcess {
    pid: Pid,
    stdin: Option<FileDescriptor>,
    stdout: FileDescriptor,
}

impl ChildProcess {
    /// Forks and execs `cmd`, splitting on the first whitespace run to
    /// separate the program from its single argument string — the same
    /// naive tokenization `PipedAsyncCommand` uses (no shell, no quoting;
    /// this is a documented limitation, not a bug, see SPEC_FULL.md).
    pub fn spawn(cmd: &str, reactor: &Reactor) -> Result<Self, Errno> {
        let (program, arg) = match cmd.split_once(char::is_whitespace) {
            Some((p, rest)) => (p, Some(rest.trim())),
            None => (cmd, None),
        };
        let program = CString::new(program).map_err(|_| Errno::EINVAL)?;
        let arg_c = arg.filter(|a| !a.is_empty()).map(CString::new).transpose().map_err(|_| Errno::EINVAL)?;

        let (stdin_r, stdin_w) = nix::unistd::pipe()?;
        let (stdout_r, stdout_w) = nix::unistd::pipe()?;

        match unsafe { nix::unistd::fork() }? {
            nix::unistd::ForkResult::Child => {
                use std::os::unix::io::AsRawFd;
                let _ = nix::unistd::close(stdin_w.as_raw_fd());
                let _ = nix::unistd::dup2(stdin_r.as_raw_fd(), libc::STDIN_FILENO);
                let _ = nix::unistd::close(stdin_r.as_raw_fd());

                let _ = nix::unistd::close(stdout_r.as_raw_fd());
                let _ = nix::unistd::dup2(stdout_w.as_raw_fd(), libc::STDOUT_FILENO);
                let _ = nix::unistd::close(stdout_w.as_raw_fd());

                let mut argv = vec![program.clone()];
                if let Some(a) = &arg_c {
                    argv.push(a.clone());
                }
                let _ = nix::unistd::execvp(&program, &argv);
                // execvp only returns on failure.
                std::process::exit(127);
            }
            nix::unistd::ForkResult::Parent { child } => {
                use std::os::unix::io::IntoRawFd;
                drop(stdin_r);
                drop(stdout_w);

                let stdin_raw = stdin_w.into_raw_fd();
                let stdout_raw = stdout_r.into_raw_fd();
                set_nonblocking(stdin_raw)?;
                set_nonblocking(stdout_raw)?;

                let stdin = FileDescriptor::from_raw(stdin_raw);
                let stdout = FileDescriptor::from_raw(stdout_raw);
                reactor.attach(stdin.clone(), Interest::WriteOnly)?;
                reactor.attach(stdout.clone(), Interest::ReadOnly)?;

                Ok(Self { pid: child, stdin: Some(stdin), stdout })
            }
        }
    }

    pub async fn write_stdin(&self, buf: &[u8]) -> Result<usize, Errno> {
        match &self.stdin {
            Some(fd) => ops::write(fd, buf).await,
            None => Err(Errno::EPIPE),
        }
    }

    /// Closes the write end of stdin so the child sees EOF. Idempotent.
    pub async fn close_stdin(&mut self, reactor: &Reactor) -> Result<(), Errno> {
        if let Some(fd) = self.stdin.take() {
            reactor.close_a_fd(&fd).await?;
        }
        Ok(())
    }

    /// Reads at most `buf.len()` bytes from the child's stdout, returning
    /// `0` once the child has closed it.
    pub async fn read_stdout(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        ops::read(&self.stdout, buf).await
    }

    /// Awaits the child's termination, `SIGKILL`-ing it first if it's
    /// still alive once the caller is done talking to it.
    ///
    /// Mirrors `WaitpidOperation`: there's no dedicated `SIGCHLD` signalfd,
    /// so this re-polls `waitpid(WNOHANG)` every time the child's own
    /// stdout becomes "readable" (which includes `EPOLLHUP` once the child
    /// exits and the kernel tears its fds down) — a spurious wake just
    /// costs one more non-blocking `waitpid` that returns `StillAlive`.
    pub async fn wait_for_termination(mut self, reactor: &Reactor) -> Result<WaitStatus, Errno> {
        self.close_stdin(reactor).await.ok();

        let status = match nix::sys::wait::waitpid(self.pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                let _ = nix::sys::signal::kill(self.pid, nix::sys::signal::Signal::SIGKILL);
                ops::wait_child(&self.stdout, self.pid).await
            }
            other => other,
        };
        reactor.close_a_fd(&self.stdout).await.ok();
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_splits_on_first_whitespace() {
        let cmd = "echo hello world";
        let (program, arg) = cmd.split_once(char::is_whitespace).unwrap();
        assert_eq!(program, "echo");
        assert_eq!(arg.trim(), "hello world");
    }

    #[test]
    fn command_with_no_argument_has_empty_arg() {
        let cmd = "uptime";
        assert!(cmd.split_once(char::is_whitespace).is_none());
    }
}
