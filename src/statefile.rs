//! On-disk per-type state: one JSON file per registered type under a
//! shared state directory.
//!
//! The original implementation keeps `mStates` purely in the long-running
//! daemon's memory and has CLI one-shots reach it over a loopback TCP
//! connection (`SharedState::localInstanceAddr()`). This crate instead
//! gives the daemon and CLI a shared on-disk file per type, so `insert`,
//! `get`, `dump` and `sync` work correctly whether or not `peer` is
//! currently running — see DESIGN.md for the full rationale.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::store::TypeState;

/// Path of the persisted state file for `type_name` under `base_dir`.
pub fn path_for(base_dir: &Path, type_name: &str) -> PathBuf {
    base_dir.join(format!("{type_name}.json"))
}

/// Loads a type's persisted state. A missing or empty file is an empty
/// state, not an error — there may simply be nothing replicated yet.
pub fn load(path: &Path) -> Result<TypeState, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => Ok(serde_json::from_str(&s)?),
        Ok(_) => Ok(TypeState::new()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TypeState::new()),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

/// Rewrites a type's persisted state in full.
pub fn save(path: &Path, state: &TypeState) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(state)?)?;
    Ok(())
}

/// Default directory for per-type state files.
pub fn default_dir() -> PathBuf {
    PathBuf::from("/var/lib/shared-state/states.d")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_for(dir.path(), "hosts");
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        use crate::store::StateEntry;
        let dir = tempfile::tempdir().unwrap();
        let path = path_for(dir.path(), "hosts");

        let mut state = TypeState::new();
        state.insert("k1".to_string(), StateEntry { author: "a".into(), ttl: 10, data: serde_json::json!(1) });
        save(&path, &state).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, state);
    }
}
