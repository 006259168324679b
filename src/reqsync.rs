//! The `reqsync` CLI collaborator: merges a peer's state slice (given on
//! stdin) into the on-disk state for one type, writing the merged result
//! to stdout.
//!
//! Out of scope for the core library per spec §6 ("external collaborator,
//! only its contract is specified"); this module exists only to give the
//! `shared-state reqsync <typeName>` subcommand somewhere to live, reusing
//! [`crate::store::StateStore::merge`] rather than re-deriving the merge
//! rule. Runs from `loopback`, so the own-authorship guard in `merge`
//! never rejects a CLI-originated update.
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use crate::error::StoreError;
use crate::statefile;
use crate::store::{StateStore, TypeConfig, TypeState};

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Reads a JSON [`TypeState`] slice from `input`, merges it into the
/// state persisted at `state_path` for `type_name`, persists the merged
/// result, and writes the merged full state as JSON to `output`.
pub fn run(
    type_name: &str,
    state_path: &Path,
    mut input: impl Read,
    mut output: impl Write,
) -> Result<u64, StoreError> {
    let mut buf = String::new();
    input.read_to_string(&mut buf).map_err(|_| StoreError::EmptyKey)?;
    let slice: TypeState = if buf.trim().is_empty() {
        TypeState::new()
    } else {
        serde_json::from_str(&buf).map_err(|_| StoreError::InvalidTypeName(type_name.to_string()))?
    };

    let known = statefile::load(state_path).unwrap_or_default();
    let mut store = StateStore::new();
    store.register(TypeConfig {
        name: type_name.to_string(),
        scope: "reqsync".to_string(),
        update_interval: 0,
        bleach_ttl: 0,
    })?;

    for (k, v) in known {
        let mut merged_in = TypeState::new();
        merged_in.insert(k, v);
        store.merge(type_name, &merged_in, loopback())?;
    }
    let changes = store.merge(type_name, &slice, loopback())?;

    let merged = store.state(type_name)?.clone();
    statefile::save(state_path, &merged).map_err(|_| StoreError::InvalidTypeName(type_name.to_string()))?;

    let serialized = serde_json::to_vec_pretty(&merged).map_err(|_| StoreError::EmptyKey)?;
    output.write_all(&serialized).map_err(|_| StoreError::EmptyKey)?;
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_slice_into_persisted_state_and_writes_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");

        let input = br#"{"k1": {"author": "peer", "ttl": 60, "data": "v1"}}"#;
        let mut out = Vec::new();
        let changes = run("hosts", &path, &input[..], &mut out).unwrap();
        assert_eq!(changes, 1);

        let written: TypeState = serde_json::from_slice(&out).unwrap();
        assert_eq!(written["k1"].data, serde_json::json!("v1"));

        let persisted: TypeState = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(persisted["k1"].data, serde_json::json!("v1"));
    }

    #[test]
    fn empty_stdin_returns_existing_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, br#"{"k1": {"author": "a", "ttl": 60, "data": 1}}"#).unwrap();

        let mut out = Vec::new();
        let changes = run("hosts", &path, &b""[..], &mut out).unwrap();
        assert_eq!(changes, 0);
        let written: TypeState = serde_json::from_slice(&out).unwrap();
        assert_eq!(written["k1"].data, serde_json::json!(1));
    }
}
