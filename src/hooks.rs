//! Notification hooks: external executables invoked with a type's clean
//! (author/TTL-stripped) state piped to their stdin.
//!
//! Grounded on `examples/original_source/src/sharedstate.cc`'s
//! `notifyHooks`: no hooks directory for the type means nothing to do, a
//! hook missing the owner-execute bit is skipped with a logged error, and
//! every hook gets the same JSON blob, its stdin closed, and is waited on
//! to completion before moving to the next.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::error;

use crate::proc::ChildProcess;
use crate::reactor::Reactor;
use crate::store::TypeState;

/// Base directory under which `<type>/` holds that type's hook
/// executables, mirroring `SHARED_STATE_HOOKS_DIR`.
pub fn hooks_dir(base: &Path, type_name: &str) -> PathBuf {
    base.join(type_name)
}

/// Default base hooks directory, mirroring `SHARED_STATE_HOOKS_DIR`.
pub fn default_base() -> PathBuf {
    PathBuf::from("/etc/shared-state/hooks")
}

fn clean_state_json(state: &TypeState) -> Value {
    let map: BTreeMap<&str, &Value> = state.iter().map(|(k, e)| (k.as_str(), &e.data)).collect();
    serde_json::to_value(map).expect("BTreeMap<&str, &Value> always serializes")
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.permissions().mode() & 0o100 != 0).unwrap_or(false)
}

/// Runs every executable hook registered for `type_name`, piping the
/// type's current state (stripped of author/TTL bookkeeping) to each
/// hook's stdin. Returns `false` only when the hooks directory doesn't
/// exist for this type — individual hook failures are logged, not fatal.
pub async fn notify(
    hooks_base: &Path,
    type_name: &str,
    state: &TypeState,
    reactor: &Reactor,
) -> bool {
    let dir = hooks_dir(hooks_base, type_name);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    let payload = clean_state_json(state).to_string();

    for entry in entries.flatten() {
        let path = entry.path();
        if !is_executable(&path) {
            error!(hook = %path.display(), "skipping non-executable hook");
            continue;
        }

        let cmd = match path.to_str() {
            Some(s) => s,
            None => continue,
        };
        let mut child = match ChildProcess::spawn(cmd, reactor) {
            Ok(c) => c,
            Err(e) => {
                error!(hook = %path.display(), error = %e, "failure executing hook");
                continue;
            }
        };

        if let Err(e) = child.write_stdin(payload.as_bytes()).await {
            error!(hook = %path.display(), error = %e, "failure writing hook stdin");
        }
        if let Err(e) = child.close_stdin(reactor).await {
            error!(hook = %path.display(), error = %e, "failure closing hook stdin");
        }
        match child.wait_for_termination(reactor).await {
            Ok(status) => {
                tracing::debug!(hook = %path.display(), ?status, "hook finished");
            }
            Err(e) => error!(hook = %path.display(), error = %e, "hook failed"),
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateEntry;

    #[test]
    fn clean_state_strips_author_and_ttl() {
        let mut state = TypeState::new();
        state.insert(
            "k1".to_string(),
            StateEntry { author: "somebody".to_string(), ttl: 99, data: serde_json::json!({"x": 1}) },
        );
        let json = clean_state_json(&state);
        assert_eq!(json, serde_json::json!({"k1": {"x": 1}}));
    }

    #[test]
    fn hooks_dir_joins_base_and_type_name() {
        let dir = hooks_dir(Path::new("/etc/shared-state/hooks.d"), "hosts");
        assert_eq!(dir, PathBuf::from("/etc/shared-state/hooks.d/hosts"));
    }
}
