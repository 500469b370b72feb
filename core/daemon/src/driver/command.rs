//! Generic command driver configured entirely from TOML.
//!
//! Argument placeholders: `{prompt}` (prompt text), `{prompt_file}` (path to a
//! file holding the prompt, removed on cleanup), `{worker}` and, inside
//! `resume_args`, `{session}`. When no argument takes the prompt it is written
//! to the child's stdin.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use super::{
    ensure_not_cancelled, json_session_id, Driver, ExitInfo, SpawnError, SpawnRequest,
    WorkerProcess, COMMAND_KIND,
};
use crate::config::DriverConfig;
use crate::error::ConfigError;
use crate::process::prepare_worker_command;

const PROMPT: &str = "{prompt}";
const PROMPT_FILE: &str = "{prompt_file}";
const WORKER: &str = "{worker}";
const SESSION: &str = "{session}";

pub struct CommandDriver {
    program: String,
    args: Vec<String>,
    resume_args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    prompt_files: Mutex<HashMap<u32, PathBuf>>,
}

impl CommandDriver {
    pub fn from_config(name: &str, config: &DriverConfig) -> Result<Self, ConfigError> {
        let program = config
            .program
            .clone()
            .filter(|program| !program.trim().is_empty())
            .ok_or_else(|| ConfigError::InvalidDriver {
                name: name.to_string(),
                details: "command drivers need a program".to_string(),
            })?;
        Ok(Self {
            program,
            args: config.args.clone(),
            resume_args: config.resume_args.clone(),
            env: config.env.clone(),
            cwd: config.cwd.clone(),
            prompt_files: Mutex::new(HashMap::new()),
        })
    }

    fn wants_stdin(&self) -> bool {
        !self
            .args
            .iter()
            .chain(self.resume_args.iter())
            .any(|arg| arg.contains(PROMPT) || arg.contains(PROMPT_FILE))
    }

    fn render_args(&self, request: &SpawnRequest<'_>, prompt_file: Option<&PathBuf>) -> Vec<String> {
        let prompt_file = prompt_file
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        let render = |arg: &String| {
            arg.replace(PROMPT_FILE, &prompt_file)
                .replace(PROMPT, request.prompt)
                .replace(WORKER, request.worker_id)
        };

        let mut args: Vec<String> = self.args.iter().map(render).collect();
        if let Some(session) = request.resume_session {
            args.extend(
                self.resume_args
                    .iter()
                    .map(|arg| render(arg).replace(SESSION, session)),
            );
        }
        args
    }

    fn write_prompt_file(&self, request: &SpawnRequest<'_>) -> Result<PathBuf, SpawnError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!(
            "relay-prompt-{}-{}.txt",
            request.worker_id, nanos
        ));
        fs_err::write(&path, request.prompt).map_err(|source| SpawnError::Launch {
            program: self.program.clone(),
            source,
        })?;
        Ok(path)
    }

    fn forget_prompt_file(&self, pid: u32) -> Option<PathBuf> {
        self.prompt_files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&pid)
    }
}

impl Driver for CommandDriver {
    fn kind(&self) -> &str {
        COMMAND_KIND
    }

    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<WorkerProcess, SpawnError> {
        ensure_not_cancelled(request)?;

        let uses_prompt_file = self
            .args
            .iter()
            .chain(self.resume_args.iter())
            .any(|arg| arg.contains(PROMPT_FILE));
        let prompt_file = if uses_prompt_file {
            Some(self.write_prompt_file(request)?)
        } else {
            None
        };
        let via_stdin = self.wants_stdin();

        let mut command = Command::new(&self.program);
        command
            .args(self.render_args(request, prompt_file.as_ref()))
            .envs(&self.env)
            .env("RELAY_WORKER", request.worker_id);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        prepare_worker_command(&mut command);
        if via_stdin {
            command.stdin(Stdio::piped());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                if let Some(path) = &prompt_file {
                    let _ = fs_err::remove_file(path);
                }
                return Err(SpawnError::Launch {
                    program: self.program.clone(),
                    source,
                });
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.to_string();
            let worker = request.worker_id.to_string();
            thread::spawn(move || {
                if let Err(err) = stdin.write_all(prompt.as_bytes()) {
                    warn!(worker = %worker, error = %err, "Failed to write prompt to stdin");
                }
            });
        }

        if let Some(path) = prompt_file {
            self.prompt_files
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(child.id(), path);
        }

        debug!(
            worker = %request.worker_id,
            program = %self.program,
            pid = child.id(),
            "Launched command worker"
        );

        Ok(WorkerProcess {
            child,
            session_id: request.resume_session.map(str::to_string),
        })
    }

    fn session_id_from_output(&self, line: &str) -> Option<String> {
        json_session_id(line)
    }

    fn cleanup(&self, info: &ExitInfo) {
        if let Some(path) = self.forget_prompt_file(info.pid) {
            if let Err(err) = fs_err::remove_file(&path) {
                warn!(worker = %info.worker_id, error = %err, "Failed to remove prompt file");
            }
        }
    }
}
