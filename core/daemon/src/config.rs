//! Daemon configuration.
//!
//! Loaded from `~/.relay/relayd.toml` (or `RELAY_CONFIG`). A missing file means
//! defaults; a malformed one is an error so a typo never silently disables
//! timers.

use relay_protocol::InvokeConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "RELAY_CONFIG";
const RELAY_DIR: &str = ".relay";
const CONFIG_FILE: &str = "relayd.toml";

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_SESSION_WAIT_MS: u64 = 5_000;
const DEFAULT_KILL_GRACE_MS: u64 = 10_000;
const DEFAULT_ROUTER_TIMEOUT_MS: u64 = 3_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub poll_interval_ms: u64,
    /// Upper bound on how long a spawn waits for an asynchronously reported
    /// session id before moving on without one.
    pub session_wait_ms: u64,
    /// Delay between SIGTERM and SIGKILL for a process that ignores the former.
    pub kill_grace_ms: u64,
    pub db_path: Option<PathBuf>,
    pub lock_path: Option<PathBuf>,
    /// Defaults applied under each worker's own `invoke` settings.
    pub invoke: InvokeConfig,
    pub drivers: BTreeMap<String, DriverConfig>,
    pub router: RouterConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            session_wait_ms: DEFAULT_SESSION_WAIT_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            db_path: None,
            lock_path: None,
            invoke: InvokeConfig::default(),
            drivers: BTreeMap::new(),
            router: RouterConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn session_wait(&self) -> Duration {
        Duration::from_millis(self.session_wait_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn resolved_db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(relay_dir()?.join("relay.db")),
        }
    }

    pub fn resolved_lock_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.lock_path {
            Some(path) => Ok(path.clone()),
            None => Ok(relay_dir()?.join("relayd.lock")),
        }
    }
}

/// One backend entry under `[drivers.<name>]`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// `claude` selects the built-in Claude Code driver; anything else runs
    /// `program` as a generic command.
    pub kind: Option<String>,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub resume_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub command: Option<Vec<String>>,
    pub timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_ms: DEFAULT_ROUTER_TIMEOUT_MS,
        }
    }
}

pub fn relay_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(RELAY_DIR))
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(relay_dir()?.join(CONFIG_FILE))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    parse_config(&config_path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<DaemonConfig, ConfigError> {
    toml::from_str::<DaemonConfig>(content).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
