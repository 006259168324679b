//! Crate-wide error type, composed from one `thiserror` enum per subsystem.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("epoll error: {0}")]
    Epoll(#[from] nix::Error),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol version mismatch: local {local}, peer {peer}")]
    VersionMismatch { local: u32, peer: u32 },
    #[error("type name length {0} out of range [1,255]")]
    TypeNameLength(usize),
    #[error("data length {0} out of range [2,{max}]", max = u32::MAX)]
    DataLength(u32),
    #[error("ack mismatch: sent {sent}, peer acked {acked}")]
    AckMismatch { sent: u32, acked: u32 },
    #[error("peer closed connection mid-frame")]
    PeerClosed,
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown data type: {0}")]
    UnknownDataType(String),
    #[error("type name must be non-empty and at most {max} bytes", max = crate::store::DATA_TYPE_NAME_MAX)]
    InvalidTypeName(String),
    #[error("record key must be non-empty")]
    EmptyKey,
    #[error("bleach interval must be a positive number of seconds")]
    InvalidBleachInterval,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed config/stats json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cli(#[from] CliError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Negative exit codes for CLI usage errors, mirroring the C errno-style
/// contract from spec.md §6 (`-EINVAL`, `-EADDRNOTAVAIL`).
pub const EXIT_EINVAL: i32 = -(libc::EINVAL as i32);
pub const EXIT_EADDRNOTAVAIL: i32 = -(libc::EADDRNOTAVAIL as i32);

impl CliError {
    /// Maps this error to the process exit code convention from spec.md §6:
    /// usage errors get a negative errno, everything else propagates as the
    /// negative of its underlying OS error where one exists, else `-1`.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => EXIT_EINVAL,
            CliError::Io(e) => e.raw_os_error().map(|c| -c).unwrap_or(-1),
            _ => -1,
        }
    }
}
