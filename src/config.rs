//! Type-configuration file: the persisted `TypeConfig` registry.
//!
//! Grounded on `examples/original_source/src/sharedstate.cc`'s
//! `loadRegisteredTypes`/`registerDataType`: a single JSON object mapping
//! type name to config, read back in full and rewritten in full on every
//! change. A missing or corrupted file is treated as an empty registry
//! rather than a fatal error — the original creates the config directory
//! the first time `registerDataType` fails to load it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::ConfigError;
use crate::store::TypeConfig;

/// Loads the type-config registry from `path`. A missing file yields an
/// empty registry with an informational log, matching
/// `loadRegisteredTypes`'s "corrupted or non-existent, creating a new one"
/// path. A present-but-malformed file is treated the same way — logged
/// and discarded as an empty registry, never a hard error — per spec §6
/// ("Absent or malformed file is treated as 'no registered types' and a
/// new file is written on `register`") and §7 ("Malformed config / stats
/// file: treated as empty and replaced"), the same discard-not-fail
/// pattern `src/wire/stats.rs::record` uses for its own corrupted file.
pub fn load(path: &Path) -> Result<Vec<TypeConfig>, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "config file not found, starting with an empty type registry");
            return Ok(Vec::new());
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<BTreeMap<String, TypeConfig>>(&contents) {
        Ok(map) => Ok(map.into_values().collect()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding corrupted or malformed type config file");
            Ok(Vec::new())
        }
    }
}

/// Rewrites the whole registry to `path`, creating the parent directory if
/// needed.
pub fn save(path: &Path, configs: &[TypeConfig]) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let map: BTreeMap<&str, &TypeConfig> =
        configs.iter().map(|c| (c.name.as_str(), c)).collect();
    let serialized = serde_json::to_vec_pretty(&map)?;
    std::fs::write(path, serialized)?;
    Ok(())
}

/// Default location for the type-config file, mirroring
/// `SHARED_STATE_CONFIG_DIR`/`SHARED_STATE_CONFIG_FILE_NAME`.
pub fn default_path() -> PathBuf {
    PathBuf::from("/etc/shared-state/types.d/shared-state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> TypeConfig {
        TypeConfig { name: name.to_string(), scope: "test".into(), update_interval: 1, bleach_ttl: 60 }
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.json");
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("types.json");
        save(&path, &[cfg("hosts"), cfg("services")]).unwrap();

        let mut loaded = load(&path).unwrap();
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(loaded, vec![cfg("hosts"), cfg("services")]);
    }

    #[test]
    fn corrupted_file_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("types.json");
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(load(&path).unwrap().is_empty());
    }
}
