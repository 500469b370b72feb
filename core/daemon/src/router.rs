//! Routing classifier for ambiguous mentions.
//!
//! The router only suppresses noise. It is never allowed to gate
//! correctness: a missing router, an error, a timeout or an unparseable
//! verdict all mean "spawn".

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RouterConfig;

#[derive(Debug, Clone, Serialize)]
pub struct RouteRequest<'a> {
    pub message: &'a str,
    pub sender: &'a str,
    pub worker: &'a str,
    /// Earlier messages of the thread, oldest first, as `sender: body` lines.
    pub thread: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Verdict {
    pub should_spawn: bool,
    #[serde(default)]
    pub confidence: f64,
}

impl Verdict {
    pub fn spawn_by_default() -> Self {
        Self {
            should_spawn: true,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router command failed to start: {0}")]
    Launch(#[source] std::io::Error),

    #[error("router timed out after {0:?}")]
    Timeout(Duration),

    #[error("router exited with status {0}")]
    Exit(i32),

    #[error("router returned an unparseable verdict: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("router I/O failed: {0}")]
    Io(#[source] std::io::Error),
}

pub trait Router: Send + Sync {
    fn classify(&self, request: &RouteRequest<'_>) -> Result<Verdict, RouterError>;
}

/// Wraps an optional router so callers always get a verdict.
pub struct FailOpenRouter {
    inner: Option<Box<dyn Router>>,
}

impl FailOpenRouter {
    pub fn new(inner: Option<Box<dyn Router>>) -> Self {
        Self { inner }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        match &config.command {
            Some(argv) if !argv.is_empty() => Self::new(Some(Box::new(CommandRouter::new(
                argv.clone(),
                Duration::from_millis(config.timeout_ms),
            )))),
            _ => Self::disabled(),
        }
    }

    pub fn classify(&self, request: &RouteRequest<'_>) -> Verdict {
        let Some(router) = &self.inner else {
            return Verdict::spawn_by_default();
        };
        match router.classify(request) {
            Ok(verdict) => {
                debug!(
                    worker = %request.worker,
                    should_spawn = verdict.should_spawn,
                    confidence = verdict.confidence,
                    "Router verdict"
                );
                verdict
            }
            Err(err) => {
                warn!(worker = %request.worker, error = %err, "Router failed; spawning");
                Verdict::spawn_by_default()
            }
        }
    }
}

/// Runs an external classifier: request JSON on stdin, verdict JSON on stdout.
pub struct CommandRouter {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandRouter {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

impl Router for CommandRouter {
    fn classify(&self, request: &RouteRequest<'_>) -> Result<Verdict, RouterError> {
        let (program, args) = self.argv.split_first().ok_or_else(|| {
            RouterError::Launch(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty router command",
            ))
        })?;
        let payload = serde_json::to_vec(request).map_err(RouterError::Parse)?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(RouterError::Launch)?;

        let deadline = Instant::now() + self.timeout;

        // Off-thread: a router that never drains stdin must not outlive the deadline.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                if let Err(err) = stdin.write_all(&payload) {
                    debug!(error = %err, "Router did not take the full request");
                }
            });
        }

        let mut stdout = child.stdout.take().ok_or_else(|| {
            RouterError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "router stdout unavailable",
            ))
        })?;
        let reader = thread::spawn(move || {
            let mut buffer = Vec::new();
            stdout.read_to_end(&mut buffer).map(|_| buffer)
        });

        let status = loop {
            match child.try_wait().map_err(RouterError::Io)? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RouterError::Timeout(self.timeout));
                }
                None => thread::sleep(Duration::from_millis(10)),
            }
        };

        if !status.success() {
            return Err(RouterError::Exit(status.code().unwrap_or(-1)));
        }

        let output = reader
            .join()
            .map_err(|_| {
                RouterError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "router reader panicked",
                ))
            })?
            .map_err(RouterError::Io)?;
        serde_json::from_slice(&output).map_err(RouterError::Parse)
    }
}
