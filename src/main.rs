//! `shared-state` binary entry point: builds the reactor, installs the
//! SIGPIPE-ignore handler the teacher's daemon always sets before touching
//! sockets, parses arguments, and runs the requested operation to
//! completion.
//!
//! Grounded on `examples/original_source/app/shared-state-async.cc`'s
//! `main`, which ignores `SIGPIPE` before `peer`/`sync` (a broken pipe from
//! a peer that hung up must not kill the process) and always terminates
//! via `exit(code)` from inside the operation itself rather than returning.

mod cli;
mod config;
mod discovery;
mod error;
mod hooks;
mod net;
mod orchestrator;
mod proc;
mod reactor;
mod reqsync;
mod statefile;
mod store;
mod wire;

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use reactor::{spawn, timer::Timer, Reactor};

fn ignore_sigpipe() {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGPIPE, &action).expect("failed to install SIGPIPE handler");
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// `peer` mode installs `SIGTERM`/`SIGINT` handlers so an operator's `kill`
/// or Ctrl-C gets a logged, deliberate exit rather than a silent one
/// (present in `examples/original_source/app/shared-state-async.cc`'s
/// `main`). The handler itself only flips an atomic flag — signal handlers
/// aren't async-signal-safe call sites for `tracing` — and a detached task
/// polls it once a second, logging and exiting on the reactor thread.
fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action).expect("failed to install SIGTERM handler");
        sigaction(Signal::SIGINT, &action).expect("failed to install SIGINT handler");
    }
}

/// Polls the shutdown flag once a second and exits cleanly once set,
/// logging which signal triggered it. Only spawned for `peer` mode, which
/// is the only operation long-lived enough to need it.
async fn watch_for_shutdown(reactor: &'static Reactor) -> ! {
    let timer = Timer::new(reactor).expect("timerfd_create failed");
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            tracing::info!("shutdown signal received, exiting");
            std::process::exit(0);
        }
        if let Err(e) = timer.wait(1, 0).await {
            tracing::warn!(error = %e, "shutdown watcher timer wait failed");
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shared_state=info".parse().unwrap()),
        )
        .init();

    ignore_sigpipe();
    install_signal_handlers();

    let args = cli::Args::parse();
    let is_peer_mode = matches!(args.command, cli::Command::Peer);

    let reactor: &'static Reactor = Box::leak(Box::new(
        Reactor::new().expect("failed to create epoll instance"),
    ));

    if is_peer_mode {
        spawn(watch_for_shutdown(reactor)).detach();
    }

    spawn(async move {
        let code = cli::run(args, reactor).await;
        std::process::exit(code);
    })
    .detach();

    reactor.run();
}
