//! State model: per-type maps, authorship, TTL, merge and bleach.
//!
//! Grounded on `examples/original_source/src/sharedstate.cc`'s `merge` and
//! `bleach` (spec §4.8), kept 1:1 with the C++ semantics.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::StoreError;

/// Author stamped on entries inserted locally via the CLI (spec §3/GLOSSARY).
pub const AUTHOR_PLACEHOLDER: &str = "author_placeholder";

/// Maximum byte length of a type name (spec §3).
pub const DATA_TYPE_NAME_MAX: usize = 255;

/// One replicated record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub author: String,
    pub ttl: u64,
    pub data: Value,
}

/// Mapping from record key to [`StateEntry`]. Key order is spec-irrelevant;
/// a `BTreeMap` is used purely so `dump`/hook JSON output and test
/// fixtures are deterministically ordered.
pub type TypeState = BTreeMap<String, StateEntry>;

/// Per-type configuration (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeConfig {
    pub name: String,
    pub scope: String,
    pub update_interval: u64,
    pub bleach_ttl: u64,
}

impl TypeConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.is_empty() || self.name.len() > DATA_TYPE_NAME_MAX {
            return Err(StoreError::InvalidTypeName(self.name.clone()));
        }
        Ok(())
    }
}

/// Owns every registered type's configuration and state. Single-threaded,
/// mutated only by tasks running on the reactor thread (spec §3/§5).
#[derive(Default)]
pub struct StateStore {
    configs: BTreeMap<String, TypeConfig>,
    states: BTreeMap<String, TypeState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a type. Re-registration updates the
    /// `TypeConfig` in place without touching any existing `TypeState`
    /// (confirmed by the original `registerType`, which only ever writes
    /// `mTypeConf` — see SPEC_FULL.md's supplemental-features section).
    pub fn register(&mut self, config: TypeConfig) -> Result<(), StoreError> {
        config.validate()?;
        self.states.entry(config.name.clone()).or_default();
        self.configs.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn unregister(&mut self, type_name: &str) {
        self.configs.remove(type_name);
        self.states.remove(type_name);
    }

    pub fn config(&self, type_name: &str) -> Option<&TypeConfig> {
        self.configs.get(type_name)
    }

    pub fn configs(&self) -> impl Iterator<Item = &TypeConfig> {
        self.configs.values()
    }

    pub fn set_configs(&mut self, configs: Vec<TypeConfig>) -> Result<(), StoreError> {
        for config in &configs {
            config.validate()?;
            self.states.entry(config.name.clone()).or_default();
        }
        self.configs = configs.into_iter().map(|c| (c.name.clone(), c)).collect();
        Ok(())
    }

    pub fn state(&self, type_name: &str) -> Result<&TypeState, StoreError> {
        self.states
            .get(type_name)
            .ok_or_else(|| StoreError::UnknownDataType(type_name.to_string()))
    }

    /// Replaces a type's state wholesale. Used only to hydrate from disk at
    /// startup/reload — unlike `merge`, this does no significant-change
    /// accounting or authorship checks, since nothing is actually being
    /// received from a peer.
    pub fn set_state(&mut self, type_name: &str, state: TypeState) -> Result<(), StoreError> {
        let slot = self
            .states
            .get_mut(type_name)
            .ok_or_else(|| StoreError::UnknownDataType(type_name.to_string()))?;
        *slot = state;
        Ok(())
    }

    /// Inserts or overwrites a locally-authored entry. `ttl` is sized as
    /// `bleach_ttl + update_interval + 1` seconds, conservative padding so
    /// the entry survives at least one full propagation cycle (spec §3).
    pub fn insert(&mut self, type_name: &str, key: &str, data: Value) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let config = self
            .configs
            .get(type_name)
            .ok_or_else(|| StoreError::UnknownDataType(type_name.to_string()))?;
        let ttl = config.bleach_ttl + config.update_interval + 1;
        let state = self
            .states
            .get_mut(type_name)
            .ok_or_else(|| StoreError::UnknownDataType(type_name.to_string()))?;
        state.insert(
            key.to_string(),
            StateEntry { author: AUTHOR_PLACEHOLDER.to_string(), ttl, data },
        );
        Ok(())
    }

    /// Merges a remote (or local-CLI) state slice into the type's state,
    /// returning the number of *significant* changes (spec §4.8).
    ///
    /// For each incoming `(key, entry)`:
    /// - absent locally: insert, always significant.
    /// - `isRemote && ownAuthorship && incoming.ttl > known.ttl`: a remote
    ///   peer claims to know our own entry fresher than we do — discarded
    ///   with a warning (own-authorship guard, spec §4.8/§8 property 3).
    /// - `incoming.ttl >= known.ttl`: replace; significant iff the data
    ///   differs. Ties go to the incoming entry (last-heard-wins).
    /// - otherwise: discarded.
    pub fn merge(
        &mut self,
        type_name: &str,
        slice: &TypeState,
        peer_addr: IpAddr,
    ) -> Result<u64, StoreError> {
        let state = self
            .states
            .get_mut(type_name)
            .ok_or_else(|| StoreError::UnknownDataType(type_name.to_string()))?;
        let is_remote = !peer_addr.is_loopback();
        let mut significant_changes = 0u64;

        for (key, incoming) in slice {
            match state.get(key) {
                None => {
                    state.insert(key.clone(), incoming.clone());
                    significant_changes += 1;
                }
                Some(known) => {
                    let own_authorship = known.author == AUTHOR_PLACEHOLDER;
                    if is_remote && own_authorship && incoming.ttl > known.ttl {
                        warn!(
                            key,
                            peer = %peer_addr,
                            "discarding entry authored by this node with higher TTL \
                             from remote peer; is the peer's clock/state ill?"
                        );
                        continue;
                    }
                    if incoming.ttl >= known.ttl {
                        let significant = known.data != incoming.data;
                        if significant {
                            significant_changes += 1;
                        }
                        state.insert(key.clone(), incoming.clone());
                    }
                }
            }
        }
        Ok(significant_changes)
    }

    /// Deletes every entry with `ttl <= times`, then decrements the
    /// remainder by `times` (spec §4.8).
    pub fn bleach(&mut self, type_name: &str, times: u64) -> Result<u64, StoreError> {
        if times == 0 {
            return Err(StoreError::InvalidBleachInterval);
        }
        let state = self
            .states
            .get_mut(type_name)
            .ok_or_else(|| StoreError::UnknownDataType(type_name.to_string()))?;
        let before = state.len();
        state.retain(|_, entry| entry.ttl > times);
        let removed = (before - state.len()) as u64;
        for entry in state.values_mut() {
            entry.ttl -= times;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn cfg(name: &str) -> TypeConfig {
        TypeConfig {
            name: name.to_string(),
            scope: "test".to_string(),
            update_interval: 1,
            bleach_ttl: 60,
        }
    }

    fn remote() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
    }

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn slice_of(entries: &[(&str, u64, Value, &str)]) -> TypeState {
        entries
            .iter()
            .map(|(k, ttl, data, author)| {
                (
                    k.to_string(),
                    StateEntry { author: author.to_string(), ttl: *ttl, data: data.clone() },
                )
            })
            .collect()
    }

    #[test]
    fn s1_single_entry_converges() {
        let mut a = StateStore::new();
        a.register(cfg("hosts")).unwrap();
        a.insert("hosts", "k1", serde_json::json!({"ip": "10.0.0.1"})).unwrap();

        let mut b = StateStore::new();
        b.register(cfg("hosts")).unwrap();
        let slice = a.state("hosts").unwrap().clone();
        b.merge("hosts", &slice, remote()).unwrap();

        let entry = &b.state("hosts").unwrap()["k1"];
        assert_eq!(entry.data, serde_json::json!({"ip": "10.0.0.1"}));
        assert_eq!(entry.ttl, 61);
        assert_eq!(entry.author, AUTHOR_PLACEHOLDER);
    }

    #[test]
    fn s2_conflict_resolved_by_ttl() {
        let mut a = StateStore::new();
        a.register(cfg("hosts")).unwrap();
        a.state_mut_for_test("hosts")
            .insert("k1".into(), StateEntry { author: "a".into(), ttl: 30, data: serde_json::json!("X") });

        let mut b = StateStore::new();
        b.register(cfg("hosts")).unwrap();
        b.state_mut_for_test("hosts")
            .insert("k1".into(), StateEntry { author: "b".into(), ttl: 40, data: serde_json::json!("Y") });

        let a_to_b = a.state("hosts").unwrap().clone();
        b.merge("hosts", &a_to_b, remote()).unwrap();
        let b_to_a = b.state("hosts").unwrap().clone();
        a.merge("hosts", &b_to_a, remote()).unwrap();

        assert_eq!(a.state("hosts").unwrap()["k1"].ttl, 40);
        assert_eq!(a.state("hosts").unwrap()["k1"].data, serde_json::json!("Y"));
        assert_eq!(b.state("hosts").unwrap()["k1"].ttl, 40);
        assert_eq!(b.state("hosts").unwrap()["k1"].data, serde_json::json!("Y"));
    }

    #[test]
    fn s3_bleach_expiry() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        store
            .state_mut_for_test("hosts")
            .insert("k1".into(), StateEntry { author: "a".into(), ttl: 3, data: serde_json::json!(1) });

        store.bleach("hosts", 1).unwrap();
        assert!(store.state("hosts").unwrap().contains_key("k1"));
        store.bleach("hosts", 1).unwrap();
        assert!(store.state("hosts").unwrap().contains_key("k1"));
        store.bleach("hosts", 1).unwrap();
        assert!(!store.state("hosts").unwrap().contains_key("k1"));
    }

    #[test]
    fn bleach_erases_iff_ttl_le_times_and_decrements_remainder() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        {
            let s = store.state_mut_for_test("hosts");
            s.insert("low".into(), StateEntry { author: "a".into(), ttl: 5, data: Value::Null });
            s.insert("high".into(), StateEntry { author: "a".into(), ttl: 50, data: Value::Null });
        }
        let removed = store.bleach("hosts", 10).unwrap();
        assert_eq!(removed, 1);
        assert!(!store.state("hosts").unwrap().contains_key("low"));
        assert_eq!(store.state("hosts").unwrap()["high"].ttl, 40);
    }

    #[test]
    fn merge_idempotence() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        let slice = slice_of(&[("k1", 60, serde_json::json!("v"), "peer")]);
        let first = store.merge("hosts", &slice, remote()).unwrap();
        assert_eq!(first, 1);
        let second = store.merge("hosts", &slice, remote()).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn merge_monotonicity_in_ttl() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        store
            .state_mut_for_test("hosts")
            .insert("k1".into(), StateEntry { author: "other".into(), ttl: 50, data: Value::Null });
        let lower = slice_of(&[("k1", 10, Value::Null, "other")]);
        store.merge("hosts", &lower, remote()).unwrap();
        assert!(store.state("hosts").unwrap()["k1"].ttl >= 10.min(50));
        assert_eq!(store.state("hosts").unwrap()["k1"].ttl, 50);
    }

    #[test]
    fn own_authorship_guard_rejects_higher_ttl_from_remote() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        store.insert("hosts", "k1", serde_json::json!("mine")).unwrap();
        let original_ttl = store.state("hosts").unwrap()["k1"].ttl;

        let spoofed = slice_of(&[("k1", original_ttl + 1000, serde_json::json!("spoofed"), "attacker")]);
        store.merge("hosts", &spoofed, remote()).unwrap();

        let entry = &store.state("hosts").unwrap()["k1"];
        assert_eq!(entry.ttl, original_ttl);
        assert_eq!(entry.author, AUTHOR_PLACEHOLDER);
    }

    #[test]
    fn own_authorship_guard_does_not_apply_from_loopback() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        store.insert("hosts", "k1", serde_json::json!("mine")).unwrap();
        let original_ttl = store.state("hosts").unwrap()["k1"].ttl;

        let from_cli = slice_of(&[("k1", original_ttl + 1000, serde_json::json!("updated"), AUTHOR_PLACEHOLDER)]);
        store.merge("hosts", &from_cli, loopback()).unwrap();

        assert_eq!(store.state("hosts").unwrap()["k1"].ttl, original_ttl + 1000);
    }

    #[test]
    fn register_is_idempotent_and_preserves_state() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        store.insert("hosts", "k1", serde_json::json!(1)).unwrap();

        let mut updated = cfg("hosts");
        updated.update_interval = 5;
        store.register(updated).unwrap();

        assert_eq!(store.config("hosts").unwrap().update_interval, 5);
        assert!(store.state("hosts").unwrap().contains_key("k1"));
    }

    #[test]
    fn unregister_removes_both_config_and_state() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        store.unregister("hosts");
        assert!(store.config("hosts").is_none());
        assert!(store.state("hosts").is_err());
    }

    #[test]
    fn set_state_replaces_wholesale_without_merge_semantics() {
        let mut store = StateStore::new();
        store.register(cfg("hosts")).unwrap();
        store.insert("hosts", "k1", serde_json::json!(1)).unwrap();

        let mut hydrated = TypeState::new();
        hydrated.insert("k2".into(), StateEntry { author: "a".into(), ttl: 5, data: Value::Null });
        store.set_state("hosts", hydrated).unwrap();

        assert!(!store.state("hosts").unwrap().contains_key("k1"));
        assert!(store.state("hosts").unwrap().contains_key("k2"));
    }

    #[test]
    fn unknown_data_type_errors() {
        let mut store = StateStore::new();
        assert!(matches!(
            store.merge("ghost", &TypeState::new(), remote()),
            Err(StoreError::UnknownDataType(_))
        ));
    }

    impl StateStore {
        /// Test-only direct mutable access, standing in for what would
        /// otherwise require going through `insert`'s TTL-sizing logic.
        fn state_mut_for_test(&mut self, type_name: &str) -> &mut TypeState {
            self.states.get_mut(type_name).unwrap()
        }
    }
}
