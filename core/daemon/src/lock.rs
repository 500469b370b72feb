//! Singleton lock for the daemon.
//!
//! The lock file holds `{ pid, started_at }`. A second daemon refuses to start
//! while the recorded PID is alive. Operating systems reuse PIDs, so a live PID
//! whose process started well after `started_at` is a recycled PID and the lock
//! is treated as stale, the same as a dead PID. Stale locks are reclaimed
//! without complaint.
//!
//! The file is created with `create_new`, so of two daemons starting at once
//! only one gets it. A stale file is first renamed aside and checked, so a
//! reclaimer never deletes a lock that a concurrent winner just wrote.

use chrono::Utc;
use fs_err as fs;
use relay_protocol::LockInfo;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::LockError;
use crate::process::{get_process_start_time, is_pid_alive};

/// Slack between the recorded `started_at` and the OS-reported start time.
const START_TIME_TOLERANCE_SECS: i64 = 2;

/// An unreadable lock younger than this may still be mid-write.
const WRITE_GRACE: Duration = Duration::from_millis(500);
const RETRY_DELAY: Duration = Duration::from_millis(50);
const ACQUIRE_ATTEMPTS: usize = 40;

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        Self::acquire_for(path, std::process::id())
    }

    fn acquire_for(path: &Path, pid: u32) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let info = LockInfo {
            pid,
            started_at: Utc::now(),
        };
        let payload = serde_json::to_vec_pretty(&info)?;

        for _ in 0..ACQUIRE_ATTEMPTS {
            match create_exclusive(path, &payload) {
                Ok(()) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        info,
                        released: false,
                    })
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }

            match read_lock(path) {
                Some(existing) if existing.pid != pid && lock_holder_alive(&existing) => {
                    return Err(LockError::AlreadyRunning { pid: existing.pid });
                }
                Some(existing) => {
                    info!(
                        stale_pid = existing.pid,
                        path = %path.display(),
                        "Reclaiming stale daemon lock"
                    );
                    reclaim(path, pid, Some(&existing))?;
                }
                // Another daemon may have created the file and not yet written it.
                None if modified_within(path, WRITE_GRACE) => thread::sleep(RETRY_DELAY),
                None => {
                    warn!(path = %path.display(), "Reclaiming unreadable daemon lock");
                    reclaim(path, pid, None)?;
                }
            }
        }

        Err(LockError::Contended {
            path: path.to_path_buf(),
        })
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file if it still names this process.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match read_lock(&self.path) {
            Some(current) if current.pid == self.info.pid => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(error = %err, path = %self.path.display(), "Failed to remove daemon lock");
                }
            }
            Some(current) => {
                warn!(
                    owner = current.pid,
                    pid = self.info.pid,
                    "Daemon lock now owned by another process; leaving it"
                );
            }
            None => {}
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn create_exclusive(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    if let Err(err) = file.write_all(payload).and_then(|()| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

fn modified_within(path: &Path, window: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age < window)
}

/// Moves a stale lock out of the way. If the file moved aside turns out not
/// to be the one judged stale, a concurrent daemon won the race and its lock
/// is put back.
fn reclaim(path: &Path, pid: u32, stale: Option<&LockInfo>) -> Result<(), LockError> {
    let aside = path.with_extension(format!("stale.{pid}"));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let moved = read_lock(&aside);
    if moved.as_ref() != stale {
        if let Err(err) = fs::hard_link(&aside, path) {
            warn!(error = %err, path = %path.display(), "Failed to restore daemon lock");
        }
    }
    if let Err(err) = fs::remove_file(&aside) {
        warn!(error = %err, path = %aside.display(), "Failed to remove stale daemon lock");
    }
    Ok(())
}

pub fn read_lock(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// True when the lock's PID is running and was not recycled since the lock
/// was written.
pub fn lock_holder_alive(info: &LockInfo) -> bool {
    if !is_pid_alive(info.pid) {
        return false;
    }
    match get_process_start_time(info.pid) {
        Some(start) => {
            let recorded = info.started_at.timestamp();
            (start as i64) <= recorded + START_TIME_TOLERANCE_SECS
        }
        None => true,
    }
}
