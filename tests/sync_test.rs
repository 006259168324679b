//! End-to-end sync scenarios (S1-S6) driven over real loopback sockets
//! through the reactor, plus the scenarios already covered as pure unit
//! tests closer to their subsystems:
//!
//! - S1 (single entry converges), S2 (TTL conflict), S3 (bleach expiry):
//!   `src/store/mod.rs`'s `#[cfg(test)]` module, since merge/bleach are
//!   pure and need no sockets.
//! - S4 (version mismatch aborts), S5 (ack mismatch aborts), S6 (hook
//!   invocation): here, since they need a live connection (S4/S5) or a
//!   real child process (S6).

use std::cell::RefCell;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::rc::Rc;

use shared_state::hooks;
use shared_state::net::{ConnectingSocket, ListeningSocket};
use shared_state::reactor::{spawn, Reactor};
use shared_state::store::{StateEntry, TypeState};
use shared_state::wire;

fn leaked_reactor() -> &'static Reactor {
    Box::leak(Box::new(Reactor::new().expect("epoll_create1 failed")))
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Drives `reactor` in bounded turns until `result` is populated, panicking
/// if nothing completed within the budget (an actual hang, not a fast
/// protocol error, since every scenario here either errors quickly or
/// completes quickly).
fn drive<T>(reactor: &'static Reactor, result: Rc<RefCell<Option<T>>>) -> T {
    for _ in 0..400 {
        if result.borrow().is_some() {
            return result.borrow_mut().take().unwrap();
        }
        reactor.turn(25).expect("reactor turn failed");
    }
    panic!("scenario did not complete within the turn budget");
}

/// S4 — version mismatch aborts the connection on both sides, and no
/// merge occurs.
#[test]
fn s4_version_mismatch_aborts_connection() {
    let reactor = leaked_reactor();
    let listener = ListeningSocket::bind(0, reactor).expect("bind failed");
    let addr = loopback(listener.local_addr().unwrap().port());

    let server_result = Rc::new(RefCell::new(None));
    let server_result2 = server_result.clone();
    spawn(async move {
        let socket = listener.accept(reactor).await.expect("accept failed");
        let outcome = wire::server_handshake(&socket).await;
        socket.close(reactor).await.ok();
        *server_result2.borrow_mut() = Some(outcome.is_err());
    })
    .detach();

    let client_result = Rc::new(RefCell::new(None));
    let client_result2 = client_result.clone();
    spawn(async move {
        let socket = ConnectingSocket::connect(addr, reactor).await.expect("connect failed");
        // Send a version the server will not recognise, bypassing the
        // normal client_handshake helper which always sends the real one.
        let bad_version: u32 = 999;
        socket.send(&bad_version.to_be_bytes()).await.ok();
        let mut echo = [0u8; 4];
        let outcome = socket.recv(&mut echo).await;
        socket.close(reactor).await.ok();
        *client_result2.borrow_mut() = Some(outcome);
    })
    .detach();

    let server_saw_error = drive(reactor, server_result);
    assert!(server_saw_error, "server must reject a mismatched protocol version");

    let client_recv = drive(reactor, client_result);
    // The server closes immediately on a bad version without replying, so
    // the client's subsequent recv sees EOF (0 bytes) rather than 4.
    assert_ne!(client_recv.unwrap_or(0), 4);
}

/// S5 — an ack that doesn't match the sender's total bytes sent aborts the
/// session and reports failure; the reply phase never runs.
#[test]
fn s5_ack_mismatch_aborts_send() {
    let reactor = leaked_reactor();
    let listener = ListeningSocket::bind(0, reactor).expect("bind failed");
    let addr = loopback(listener.local_addr().unwrap().port());

    let server_result = Rc::new(RefCell::new(None));
    let server_result2 = server_result.clone();
    spawn(async move {
        let socket = listener.accept(reactor).await.expect("accept failed");
        wire::server_handshake(&socket).await.expect("server handshake failed");

        // Manually replay recv_message's framing but ack one byte short of
        // what was actually received, simulating a misbehaving/lying peer.
        let mut len_byte = [0u8; 1];
        socket.recv(&mut len_byte).await.unwrap();
        let mut type_name = vec![0u8; len_byte[0] as usize];
        socket.recv(&mut type_name).await.unwrap();
        let mut len_buf = [0u8; 4];
        socket.recv(&mut len_buf).await.unwrap();
        let data_len = u32::from_be_bytes(len_buf);
        let mut data = vec![0u8; data_len as usize];
        socket.recv(&mut data).await.unwrap();

        let total = 1 + type_name.len() + 4 + data.len();
        let lying_ack = (total as u32).saturating_sub(1);
        socket.send(&lying_ack.to_be_bytes()).await.unwrap();
        socket.close(reactor).await.ok();
        *server_result2.borrow_mut() = Some(());
    })
    .detach();

    let client_result = Rc::new(RefCell::new(None));
    let client_result2 = client_result.clone();
    spawn(async move {
        let socket = ConnectingSocket::connect(addr, reactor).await.expect("connect failed");
        wire::client_handshake(&socket).await.expect("client handshake failed");

        let mut state = TypeState::new();
        state.insert(
            "k1".to_string(),
            StateEntry { author: "a".to_string(), ttl: 60, data: serde_json::json!("v") },
        );
        let msg = wire::NetworkMessage::new("hosts", state);
        let outcome = wire::send_message(&socket, &msg).await;
        socket.close(reactor).await.ok();
        *client_result2.borrow_mut() = Some(outcome.is_err());
    })
    .detach();

    drive(reactor, server_result);
    let sender_failed = drive(reactor, client_result);
    assert!(sender_failed, "a short ack must fail send_message on the sender side");
}

/// S6 — a hook executable is invoked exactly once, with the type's full
/// (clean) JSON state on stdin followed by EOF.
#[test]
fn s6_hook_invoked_once_with_clean_state() {
    let reactor = leaked_reactor();
    let dir = tempfile::tempdir().unwrap();
    let hooks_base = dir.path().join("hooks");
    let hook_dir = hooks_base.join("hosts");
    std::fs::create_dir_all(&hook_dir).unwrap();

    let capture_path = dir.path().join("captured.json");
    let hook_path = hook_dir.join("record.sh");
    {
        let mut f = std::fs::File::create(&hook_path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "cat > \"{}\"", capture_path.display()).unwrap();
    }
    let mut perms = std::fs::metadata(&hook_path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&hook_path, perms).unwrap();

    let mut state = TypeState::new();
    state.insert(
        "k1".to_string(),
        StateEntry { author: "author_placeholder".to_string(), ttl: 60, data: serde_json::json!({"ip": "10.0.0.1"}) },
    );

    let result = Rc::new(RefCell::new(None));
    let result2 = result.clone();
    let hooks_base2 = hooks_base.clone();
    spawn(async move {
        let ran = hooks::notify(&hooks_base2, "hosts", &state, reactor).await;
        *result2.borrow_mut() = Some(ran);
    })
    .detach();

    let ran = drive(reactor, result);
    assert!(ran);

    // Give the forked hook a moment to finish writing — wait_for_termination
    // inside notify() already waits for it, so this should be immediate.
    let captured = std::fs::read_to_string(&capture_path).expect("hook did not write its capture file");
    let parsed: serde_json::Value = serde_json::from_str(&captured).unwrap();
    assert_eq!(parsed, serde_json::json!({"k1": {"ip": "10.0.0.1"}}));
}
