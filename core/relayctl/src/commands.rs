//! relayctl subcommands. Each returns a serializable report; `main` prints it
//! as JSON.

use chrono::{DateTime, Utc};
use relay_daemon::config::DaemonConfig;
use relay_daemon::lock::{lock_holder_alive, read_lock};
use relay_daemon::process::is_pid_alive;
use relay_daemon::{ConfigError, SqliteStore, Store, StoreError};
use relay_protocol::{Presence, Worker};
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("relayd is not running")]
    NotRunning,

    #[error("failed to signal relayd (pid {pid}): {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("relayd (pid {pid}) did not exit within {waited:?}")]
    StopTimeout { pid: u32, waited: Duration },

    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where the daemon keeps its state.
#[derive(Debug, Clone)]
pub struct Paths {
    pub db: PathBuf,
    pub lock: PathBuf,
}

impl Paths {
    pub fn from_config(config: &DaemonConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            db: config.resolved_db_path()?,
            lock: config.resolved_lock_path()?,
        })
    }

    fn store(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::new(self.db.clone())
    }
}

#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub lock_path: String,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub daemon: DaemonStatus,
    pub workers: Vec<Worker>,
}

#[derive(Debug, Serialize)]
pub struct ResumeReport {
    pub worker: String,
    pub previous: Presence,
    pub presence: Presence,
    pub resumed: bool,
}

#[derive(Debug, Serialize)]
pub struct StopReport {
    pub pid: u32,
    pub stopped: bool,
}

pub fn daemon_status(paths: &Paths) -> DaemonStatus {
    let holder = read_lock(&paths.lock).filter(lock_holder_alive);
    DaemonStatus {
        running: holder.is_some(),
        pid: holder.as_ref().map(|info| info.pid),
        started_at: holder.as_ref().map(|info| info.started_at),
        lock_path: paths.lock.display().to_string(),
    }
}

pub fn status(paths: &Paths) -> Result<StatusReport, CtlError> {
    let store = paths.store()?;
    Ok(StatusReport {
        daemon: daemon_status(paths),
        workers: store.list_managed_workers()?,
    })
}

pub fn workers(paths: &Paths) -> Result<Vec<Worker>, CtlError> {
    Ok(paths.store()?.list_workers()?)
}

/// Clears a sticky `error` presence so mentions can wake the worker again.
/// Other presences are left alone.
pub fn resume(paths: &Paths, worker_id: &str) -> Result<ResumeReport, CtlError> {
    let store = paths.store()?;
    let worker = store
        .get_worker(worker_id)?
        .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;

    if worker.presence != Presence::Error {
        return Ok(ResumeReport {
            worker: worker.id,
            previous: worker.presence,
            presence: worker.presence,
            resumed: false,
        });
    }

    store.update_worker_presence(worker_id, Presence::Idle)?;
    info!(worker = %worker_id, "Resumed worker from error");
    Ok(ResumeReport {
        worker: worker.id,
        previous: Presence::Error,
        presence: Presence::Idle,
        resumed: true,
    })
}

/// Sends SIGTERM to the lock holder and waits for it to exit.
pub fn stop(paths: &Paths, timeout: Duration) -> Result<StopReport, CtlError> {
    let holder = read_lock(&paths.lock)
        .filter(lock_holder_alive)
        .ok_or(CtlError::NotRunning)?;
    let pid = holder.pid;

    send_terminate(pid)?;
    info!(pid, "Sent SIGTERM to relayd");

    let started = Instant::now();
    while is_pid_alive(pid) {
        if started.elapsed() >= timeout {
            return Err(CtlError::StopTimeout {
                pid,
                waited: timeout,
            });
        }
        thread::sleep(STOP_POLL);
    }
    Ok(StopReport { pid, stopped: true })
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> Result<(), CtlError> {
    // The daemon pid only; its process group may be the operator's shell job.
    if unsafe { libc::kill(pid as i32, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    Err(CtlError::Signal {
        pid,
        source: std::io::Error::last_os_error(),
    })
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> Result<(), CtlError> {
    Err(CtlError::Signal {
        pid,
        source: std::io::Error::new(std::io::ErrorKind::Unsupported, "signals need unix"),
    })
}
