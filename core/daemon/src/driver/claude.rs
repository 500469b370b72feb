//! Claude Code driver.
//!
//! Runs `claude -p <prompt> --output-format stream-json --verbose`, adding
//! `--resume <session>` when the worker has a session on record. The first
//! stream event carries the session id.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::debug;

use super::{
    ensure_not_cancelled, json_session_id, Driver, SpawnError, SpawnRequest, WorkerProcess,
    CLAUDE_KIND,
};
use crate::config::DriverConfig;
use crate::process::prepare_worker_command;

const DEFAULT_PROGRAM: &str = "claude";

#[derive(Debug, Clone)]
pub struct ClaudeDriver {
    program: String,
    extra_args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl Default for ClaudeDriver {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

impl ClaudeDriver {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            program: config
                .program
                .clone()
                .unwrap_or_else(|| DEFAULT_PROGRAM.to_string()),
            extra_args: config.args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
        }
    }

    fn args(&self, request: &SpawnRequest<'_>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(session) = request.resume_session {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl Driver for ClaudeDriver {
    fn kind(&self) -> &str {
        CLAUDE_KIND
    }

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<WorkerProcess, SpawnError> {
        ensure_not_cancelled(request)?;

        let mut command = Command::new(&self.program);
        command.args(self.args(request)).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        prepare_worker_command(&mut command);

        let child = command.spawn().map_err(|source| SpawnError::Launch {
            program: self.program.clone(),
            source,
        })?;
        debug!(
            worker = %request.worker_id,
            pid = child.id(),
            resumed = request.resume_session.is_some(),
            "Launched claude"
        );

        Ok(WorkerProcess {
            child,
            session_id: None,
        })
    }

    fn session_id_from_output(&self, line: &str) -> Option<String> {
        json_session_id(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;

    fn request<'a>(cancel: &'a CancelToken, resume: Option<&'a str>) -> SpawnRequest<'a> {
        SpawnRequest {
            worker_id: "builder",
            prompt: "wake up",
            resume_session: resume,
            cancel,
        }
    }

    #[test]
    fn builds_stream_json_invocation() {
        let cancel = CancelToken::new();
        let driver = ClaudeDriver::default();
        assert_eq!(
            driver.args(&request(&cancel, None)),
            vec!["-p", "wake up", "--output-format", "stream-json", "--verbose"]
        );
    }

    #[test]
    fn resume_and_extra_args_are_appended() {
        let cancel = CancelToken::new();
        let driver = ClaudeDriver::from_config(&DriverConfig {
            args: vec!["--model".to_string(), "sonnet".to_string()],
            ..DriverConfig::default()
        });
        let args = driver.args(&request(&cancel, Some("sess-9")));
        assert_eq!(
            &args[5..],
            &["--resume", "sess-9", "--model", "sonnet"].map(str::to_string)
        );
    }

    #[test]
    fn cancelled_requests_do_not_launch() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let driver = ClaudeDriver::from_config(&DriverConfig {
            program: Some("/nonexistent/claude".to_string()),
            ..DriverConfig::default()
        });
        assert!(matches!(
            driver.spawn(&request(&cancel, None)),
            Err(SpawnError::Cancelled)
        ));
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let cancel = CancelToken::new();
        let driver = ClaudeDriver::from_config(&DriverConfig {
            program: Some("/nonexistent/claude".to_string()),
            ..DriverConfig::default()
        });
        assert!(matches!(
            driver.spawn(&request(&cancel, None)),
            Err(SpawnError::Launch { .. })
        ));
    }
}
