//! Backend drivers: how a wake prompt becomes a running worker process.
//!
//! Each backend implements [`Driver`]. The set of drivers is closed at startup:
//! [`DriverRegistry::from_config`] builds it from `[drivers.<name>]` entries
//! and workers select one by name through their `invoke.driver` setting.

mod claude;
mod command;

pub use claude::ClaudeDriver;
pub use command::CommandDriver;

use std::collections::{BTreeMap, HashMap};
use std::process::Child;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::config::DriverConfig;
use crate::error::ConfigError;

pub use crate::error::SpawnError;

pub const CLAUDE_KIND: &str = "claude";
pub const COMMAND_KIND: &str = "command";

pub struct SpawnRequest<'a> {
    pub worker_id: &'a str,
    pub prompt: &'a str,
    /// Session to continue, when the worker has one on record.
    pub resume_session: Option<&'a str>,
    pub cancel: &'a CancelToken,
}

/// A launched worker. `child` must have piped stdout and stderr and lead its
/// own process group.
pub struct WorkerProcess {
    pub child: Child,
    /// Known up front for some backends; otherwise sniffed from stdout.
    pub session_id: Option<String>,
}

/// What a driver learns when one of its processes is finished.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub worker_id: String,
    pub pid: u32,
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

pub trait Driver: Send + Sync {
    /// Backend family, also the key usage telemetry is looked up by.
    fn kind(&self) -> &str;

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<WorkerProcess, SpawnError>;

    /// Extracts a session id from one line of stdout.
    fn session_id_from_output(&self, _line: &str) -> Option<String> {
        None
    }

    fn cleanup(&self, _info: &ExitInfo) {}
}

pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Registers the configured drivers. `claude` is always available under
    /// its own name unless the config overrides it.
    pub fn from_config(configs: &BTreeMap<String, DriverConfig>) -> Result<Self, ConfigError> {
        let mut registry = Self::empty();
        registry.register(CLAUDE_KIND, Arc::new(ClaudeDriver::default()));
        for (name, config) in configs {
            let driver: Arc<dyn Driver> = match config.kind.as_deref() {
                Some(CLAUDE_KIND) => Arc::new(ClaudeDriver::from_config(config)),
                Some(COMMAND_KIND) | None => Arc::new(CommandDriver::from_config(name, config)?),
                Some(other) => {
                    return Err(ConfigError::InvalidDriver {
                        name: name.clone(),
                        details: format!("unknown kind {}", other),
                    })
                }
            };
            registry.register(name, driver);
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Reads a top-level `session_id` string from a JSON line, the convention for
/// stream-json style backends.
pub(crate) fn json_session_id(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') || !trimmed.contains("session_id") {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    value
        .get("session_id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
}

pub(crate) fn ensure_not_cancelled(request: &SpawnRequest<'_>) -> Result<(), SpawnError> {
    if request.cancel.is_cancelled() {
        return Err(SpawnError::Cancelled);
    }
    Ok(())
}
