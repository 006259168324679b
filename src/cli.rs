//! CLI surface: argument parsing and per-operation dispatch.
//!
//! Grounded on `examples/original_source/app/shared-state-async.cc`'s
//! `main` (operation dispatch table, `argc`/`argv` usage errors) and
//! `shared_state_cli.cc` (per-operation bodies), adapted to `clap`'s
//! derive API the way the teacher's own `main.rs` uses it.

use std::io::{Cursor, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};

use crate::config;
use crate::discovery;
use crate::error::{CliError, EXIT_EINVAL};
use crate::orchestrator::{self, Paths};
use crate::reactor::Reactor;
use crate::reqsync;
use crate::statefile;
use crate::store::{StateEntry, TypeConfig, TypeState, AUTHOR_PLACEHOLDER};
use crate::wire::stats;

#[derive(Parser)]
#[command(name = "shared-state", version, about = "Peer-to-peer, eventually-consistent key-value replication for mesh networks")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the type-config file (`SHARED_STATE_CONFIG_DIR`).
    #[arg(long, env = "SHARED_STATE_CONFIG_DIR", default_value = "/etc/shared-state")]
    pub config_dir: PathBuf,

    /// Directory holding one JSON state file per registered type.
    #[arg(long, env = "SHARED_STATE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Network-statistics file (`SHARED_STATE_NET_STAT_FILE_PATH`).
    #[arg(long, env = "SHARED_STATE_NET_STAT_FILE_PATH")]
    pub stats_file: Option<PathBuf>,

    /// Hook directory base (`SHARED_STATE_HOOKS_DIR`).
    #[arg(long, env = "SHARED_STATE_HOOKS_DIR")]
    pub hooks_dir: Option<PathBuf>,

    /// External command whose stdout lists one candidate peer IP per line
    /// (`SHARED_STATE_GET_CANDIDATES_CMD`).
    #[arg(long, env = "SHARED_STATE_GET_CANDIDATES_CMD")]
    pub discovery_command: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Prints every candidate peer address the discovery command reports.
    Discover,
    /// Pretty-prints the full per-type state (including author/TTL) as JSON.
    Dump { type_name: String },
    /// Prints the type's current state as clean (data-only) JSON.
    Get { type_name: String },
    /// Reads a JSON object of new/updated key-value pairs on stdin.
    Insert { type_name: String },
    /// Runs the long-lived daemon: accept loop, sync loop, bleach loop.
    Peer,
    /// Registers (or re-registers) a data type.
    Register { type_name: String, scope: String, update_interval: u64, bleach_ttl: u64 },
    /// Syncs one type against explicit peers, or discovered ones if none given.
    Sync { type_name: String, peers: Vec<String> },
    /// Merges a peer's state slice (stdin) into the persisted state for a
    /// type, writing the merged result to stdout — the standalone
    /// `reqsync` collaborator contract.
    Reqsync { type_name: String },
}

impl Args {
    pub fn paths(&self) -> Paths {
        Paths {
            config_file: self.config_dir.join("types.d").join("shared-state.json"),
            state_dir: self.state_dir.clone().unwrap_or_else(statefile::default_dir),
            stats_file: self.stats_file.clone().unwrap_or_else(stats::default_path),
            hooks_dir: self.hooks_dir.clone().unwrap_or_else(crate::hooks::default_base),
            discovery_command: self.discovery_command.clone().unwrap_or_default(),
        }
    }
}

fn clean_json(state: &TypeState) -> Value {
    let map: std::collections::BTreeMap<&str, &Value> =
        state.iter().map(|(k, e)| (k.as_str(), &e.data)).collect();
    serde_json::to_value(map).expect("BTreeMap<&str, &Value> always serializes")
}

fn read_stdin_json() -> Result<Value, CliError> {
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf).map_err(CliError::Io)?;
    serde_json::from_str(&buf).map_err(|e| CliError::Usage(format!("invalid JSON on stdin: {e}")))
}

/// Runs the requested operation to completion and returns the process exit
/// code (spec §6: 0 on success, negative errno on usage errors, the
/// propagated error value otherwise).
pub async fn run(args: Args, reactor: &'static Reactor) -> i32 {
    let paths = args.paths();
    match dispatch(args.command, paths, reactor).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "operation failed");
            e.exit_code()
        }
    }
}

async fn dispatch(command: Command, paths: Paths, reactor: &'static Reactor) -> Result<i32, CliError> {
    match command {
        Command::Discover => {
            if paths.discovery_command.is_empty() {
                return Err(CliError::Usage("no discovery command configured".to_string()));
            }
            let candidates = discovery::candidate_neighbours(&paths.discovery_command, reactor).await?;
            let mut stdout = std::io::stdout();
            for addr in candidates {
                writeln!(stdout, "{}", addr.ip()).ok();
            }
            Ok(0)
        }

        Command::Dump { type_name } => {
            let store = orchestrator::hydrate_store(&paths)?;
            let state = store.state(&type_name)?;
            println!("{}", serde_json::to_string_pretty(state).unwrap());
            Ok(0)
        }

        Command::Get { type_name } => {
            let store = orchestrator::hydrate_store(&paths)?;
            let state = store.state(&type_name)?;
            println!("{}", serde_json::to_string_pretty(&clean_json(state)).unwrap());
            Ok(0)
        }

        Command::Insert { type_name } => {
            let input = read_stdin_json()?;
            let object = input
                .as_object()
                .ok_or_else(|| CliError::Usage("insert expects a JSON object on stdin".to_string()))?;

            let store = orchestrator::hydrate_store(&paths)?;
            let config = store
                .config(&type_name)
                .cloned()
                .ok_or_else(|| crate::error::StoreError::UnknownDataType(type_name.clone()))?;
            let ttl = config.bleach_ttl + config.update_interval + 1;

            let mut slice = TypeState::new();
            for (key, value) in object {
                slice.insert(key.clone(), StateEntry { author: AUTHOR_PLACEHOLDER.to_string(), ttl, data: value.clone() });
            }

            let slice_bytes = serde_json::to_vec(&slice).expect("TypeState always serializes");
            let state_path = paths.state_dir.join(format!("{type_name}.json"));
            let mut merged_out = Vec::new();
            reqsync::run(&type_name, &state_path, Cursor::new(slice_bytes), &mut merged_out)?;

            info!(type_name, entries = object.len(), "inserted entries");
            Ok(0)
        }

        Command::Peer => {
            orchestrator::run_peer(paths, reactor).await?;
            Ok(0)
        }

        Command::Register { type_name, scope, update_interval, bleach_ttl } => {
            let mut configs = config::load(&paths.config_file)?;
            let entry = TypeConfig { name: type_name.clone(), scope, update_interval, bleach_ttl };
            entry.validate()?;
            match configs.iter_mut().find(|c| c.name == type_name) {
                Some(existing) => *existing = entry,
                None => configs.push(entry),
            }
            config::save(&paths.config_file, &configs)?;
            info!(type_name, "registered data type");
            Ok(0)
        }

        Command::Sync { type_name, peers } => {
            let peer_addrs: Vec<std::net::IpAddr> = if peers.is_empty() {
                if paths.discovery_command.is_empty() {
                    return Err(CliError::Usage("no peers given and no discovery command configured".to_string()));
                }
                discovery::candidate_neighbours(&paths.discovery_command, reactor)
                    .await?
                    .into_iter()
                    .map(|a| a.ip())
                    .collect()
            } else {
                peers
                    .iter()
                    .map(|p| p.parse())
                    .collect::<Result<_, _>>()
                    .map_err(|_| CliError::Usage(format!("invalid peer address in: {peers:?}")))?
            };

            let store = std::rc::Rc::new(std::cell::RefCell::new(orchestrator::hydrate_store(&paths)?));
            let mut last_err: Option<CliError> = None;
            for peer in peer_addrs {
                if let Err(e) = orchestrator::sync_with_peer(&store, &paths, &type_name, peer, reactor, false).await {
                    info!(%peer, error = %e, "failed to sync with peer");
                    last_err = Some(e);
                }
            }

            match last_err {
                Some(e) => {
                    error!("some peers failed to sync, see previous messages for details");
                    Err(e)
                }
                None => Ok(0),
            }
        }

        Command::Reqsync { type_name } => {
            let state_path = paths.state_dir.join(format!("{type_name}.json"));
            let stdin = std::io::stdin();
            let mut stdout = std::io::stdout();
            reqsync::run(&type_name, &state_path, stdin.lock(), &mut stdout)?;
            Ok(0)
        }
    }
}

/// Usage-error helper mirroring `main.cc`'s `usageFun`/`-EINVAL` path for
/// argument parsing performed outside `clap` (there is none left once
/// `clap` owns the whole surface, but `EXIT_EINVAL` stays exported here
/// for `main.rs` to use if `clap` itself rejects the arguments).
pub const USAGE_EXIT_CODE: i32 = EXIT_EINVAL;
