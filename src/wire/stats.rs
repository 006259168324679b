//! Per-peer network statistics, persisted as JSON with advisory locking.
//!
//! Grounded on `examples/original_source/src/sharedstate.cc`'s
//! `collectStat`: read-modify-write the whole stats file under `flock`,
//! append one record per exchange, then prune to the last `MAX_RECORDS`
//! and drop anything older than `MAX_AGE`.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Maximum number of records retained per peer.
pub const MAX_RECORDS: usize = 50;

/// Maximum age of a retained record.
pub const MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkStats {
    pub peer: IpAddr,
    pub timestamp_unix_secs: u64,
    pub rtt_us: u64,
    pub up_mbps: f64,
    pub down_mbps: f64,
}

/// Maps a peer's string address to its bounded history, matching the
/// `std::map<std::string, std::deque<NetworkStats>>` shape of the original
/// stats file.
pub type StatsByPeer = BTreeMap<String, Vec<NetworkStats>>;

/// A stats file opened under an advisory exclusive lock for the duration
/// of one read-modify-write cycle.
pub struct StatsFile {
    path: std::path::PathBuf,
}

impl StatsFile {
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// Appends `record` for the given peer, pruning the peer's history to
    /// `MAX_RECORDS` entries not older than `MAX_AGE`, then rewrites the
    /// whole file while holding `LOCK_EX` (spec §4.7's "bounded per-peer
    /// history ... persisted under an advisory flock").
    pub fn record(&self, peer: IpAddr, record: NetworkStats) -> Result<(), ConfigError> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(&self.path)?;
        flock(std::os::unix::io::AsRawFd::as_raw_fd(&file), FlockArg::LockExclusive)
            .map_err(|e| ConfigError::Io(std::io::Error::from_raw_os_error(e as i32)))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut stats: StatsByPeer = if contents.trim().is_empty() {
            StatsByPeer::new()
        } else {
            match serde_json::from_str(&contents) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(error = %e, path = %self.path.display(), "discarding corrupted or empty statistics file");
                    StatsByPeer::new()
                }
            }
        };

        let now = record.timestamp_unix_secs;
        let history = stats.entry(peer.to_string()).or_default();
        history.push(record);

        let overflow = history.len().saturating_sub(MAX_RECORDS);
        history.drain(0..overflow);
        history.retain(|r| now.saturating_sub(r.timestamp_unix_secs) <= MAX_AGE.as_secs());

        let serialized = serde_json::to_vec_pretty(&stats)?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(&serialized)?;
        Ok(())
    }
}

/// Default location for the network-stats file.
pub fn default_path() -> std::path::PathBuf {
    std::path::PathBuf::from("/var/lib/shared-state/net_stats.json")
}

pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
