//! Error types for relay-daemon.

use std::path::PathBuf;

/// Store failures, split by whether the next tick can reasonably retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store unreachable or a query failed for this call only.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backing schema does not match what this daemon expects. Fatal.
    #[error("store schema incompatible: {0}")]
    Schema(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),
}

impl StoreError {
    pub fn is_schema(&self) -> bool {
        matches!(self, StoreError::Schema(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("no driver configured for worker {0}")]
    NoDriver(String),

    #[error("unknown driver {driver} for worker {worker}")]
    UnknownDriver { worker: String, driver: String },

    #[error("daemon is shutting down")]
    Cancelled,

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another relayd is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("lock file I/O failed: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not settle the daemon lock at {path}")]
    Contended { path: PathBuf },

    #[error("failed to encode lock file: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("home directory not found")]
    NoHome,

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {details}")]
    Parse { path: PathBuf, details: String },

    #[error("invalid driver {name}: {details}")]
    InvalidDriver { name: String, details: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start watch loop: {0}")]
    Thread(#[source] std::io::Error),

    #[error("watch loop panicked")]
    LoopPanicked,
}
