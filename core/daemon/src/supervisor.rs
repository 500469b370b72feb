//! Process supervisor: spawn, monitor, kill and exit finalization.
//!
//! Every live process gets one monitor thread and two pipe-drain threads. The
//! monitor drains both streams, waits for the child and finalizes the exit.
//! The presence sweep probes the same child without blocking, so whichever
//! path notices the exit first finalizes it and the other becomes a no-op.

use chrono::Utc;
use relay_protocol::{AuditEvent, InvokeConfig, Presence, TokenCounts, Worker};
use std::io::{BufRead, BufReader, Read};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::DaemonConfig;
use crate::driver::{Driver, DriverRegistry, ExitInfo, SpawnRequest, WorkerProcess};
use crate::error::{SpawnError, StoreError};
use crate::presence::{self, Action, Observation, Usage};
use crate::process::{signal_process, Signal};
use crate::registry::{KillReason, ProcessRegistry, ProcessSpec, TrackedProcess};
use crate::store::Store;
use crate::telemetry::UsageTelemetry;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Invoke defaults under each worker's own settings.
    pub defaults: InvokeConfig,
    pub session_wait: Duration,
    pub kill_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            defaults: config.invoke.clone(),
            session_wait: config.session_wait(),
            kill_grace: config.kill_grace(),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Result of the admission check for a spawn candidate.
pub enum Admission {
    /// The worker is busy with a live process; queue the mention.
    Queue,
    /// `error` presence blocks automatic spawns.
    Blocked,
    /// Spawn now. `worker` is the fresh store row; `superseded` is a process
    /// that was tracked for the worker but no longer matches its presence.
    Spawn {
        worker: Worker,
        superseded: Option<Arc<TrackedProcess>>,
    },
}

pub struct Supervisor {
    store: Arc<dyn Store>,
    drivers: DriverRegistry,
    telemetry: Arc<dyn UsageTelemetry>,
    registry: ProcessRegistry,
    cancel: CancelToken,
    settings: SupervisorSettings,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        drivers: DriverRegistry,
        telemetry: Arc<dyn UsageTelemetry>,
        cancel: CancelToken,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            drivers,
            telemetry,
            registry: ProcessRegistry::new(),
            cancel,
            settings,
            monitors: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Decides, under the registry lock, whether a candidate mention spawns,
    /// queues or is blocked. Busy presence without a process is an orphan and
    /// is reset to idle first.
    pub fn admit(&self, worker_id: &str) -> Result<Admission, StoreError> {
        let mut guard = self.registry.lock();
        let worker = self
            .store
            .get_worker(worker_id)?
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        let tracked = guard.get(worker_id);

        let admission = match (tracked, worker.presence) {
            (Some(_), presence) if presence.is_busy() => Admission::Queue,
            (None, presence) if presence.is_busy() => {
                warn!(
                    worker = %worker_id,
                    presence = %presence,
                    "Busy presence without a tracked process; resetting to idle"
                );
                self.store
                    .update_worker_presence(worker_id, Presence::Idle)?;
                Admission::Spawn {
                    worker: Worker {
                        presence: Presence::Idle,
                        ..worker
                    },
                    superseded: None,
                }
            }
            (_, Presence::Error) => Admission::Blocked,
            (Some(_), _) => Admission::Spawn {
                superseded: guard.retire(worker_id),
                worker,
            },
            (None, _) => Admission::Spawn {
                worker,
                superseded: None,
            },
        };
        Ok(admission)
    }

    /// Launches a worker for `prompt`. Presence is `spawning` before the driver
    /// runs; any failure leaves it at `error` (or `idle` when cancelled).
    pub fn spawn(
        self: &Arc<Self>,
        worker: &Worker,
        prompt: &str,
    ) -> Result<Arc<TrackedProcess>, SpawnError> {
        if self.cancel.is_cancelled() {
            return Err(SpawnError::Cancelled);
        }

        let invoke = worker.invoke.resolve(&self.settings.defaults);
        let driver = match self.resolve_driver(worker, &invoke) {
            Ok(driver) => driver,
            Err(err) => {
                self.record_spawn_failure(&worker.id, &err);
                return Err(err);
            }
        };

        self.store
            .update_worker_presence(&worker.id, Presence::Spawning)?;

        match self.launch(worker, prompt, driver, invoke) {
            Ok(process) => Ok(process),
            Err(err) => {
                self.record_spawn_failure(&worker.id, &err);
                Err(err)
            }
        }
    }

    fn resolve_driver(
        &self,
        worker: &Worker,
        invoke: &InvokeConfig,
    ) -> Result<Arc<dyn Driver>, SpawnError> {
        let name = invoke
            .driver
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| SpawnError::NoDriver(worker.id.clone()))?;
        self.drivers
            .get(name)
            .ok_or_else(|| SpawnError::UnknownDriver {
                worker: worker.id.clone(),
                driver: name.to_string(),
            })
    }

    fn record_spawn_failure(&self, worker_id: &str, err: &SpawnError) {
        let presence = match err {
            SpawnError::Cancelled => Presence::Idle,
            _ => Presence::Error,
        };
        warn!(worker = %worker_id, error = %err, presence = %presence, "Spawn failed");
        if let Err(store_err) = self.store.update_worker_presence(worker_id, presence) {
            warn!(
                worker = %worker_id,
                error = %store_err,
                "Failed to record spawn failure"
            );
        }
    }

    fn launch(
        self: &Arc<Self>,
        worker: &Worker,
        prompt: &str,
        driver: Arc<dyn Driver>,
        invoke: InvokeConfig,
    ) -> Result<Arc<TrackedProcess>, SpawnError> {
        let resume_session = worker
            .session_id
            .as_deref()
            .filter(|session| !session.trim().is_empty());
        let baseline = resume_session
            .and_then(|session| self.telemetry.token_counts(driver.kind(), session))
            .unwrap_or_default();

        let WorkerProcess {
            mut child,
            session_id,
        } = driver.spawn(&SpawnRequest {
            worker_id: &worker.id,
            prompt,
            resume_session,
            cancel: &self.cancel,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let process = Arc::new(TrackedProcess::new(ProcessSpec {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            worker_id: worker.id.clone(),
            driver: driver.clone(),
            invoke,
            resumed: resume_session.is_some(),
            baseline,
            session_id,
            child,
        }));

        let (session_tx, session_rx) = mpsc::channel();
        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            drains.push(start_drain(process.clone(), stdout, "stdout", Some(session_tx)));
        }
        if let Some(stderr) = stderr {
            drains.push(start_drain(process.clone(), stderr, "stderr", None));
        }

        if process.session_id().is_none() {
            match session_rx.recv_timeout(self.settings.session_wait) {
                Ok(session_id) => process.set_session_id(session_id),
                Err(_) => debug!(
                    worker = %worker.id,
                    "No session id reported yet; continuing without one"
                ),
            }
        }
        if let Some(session_id) = process.session_id() {
            self.persist_session(&worker.id, &session_id);
        }

        let superseded = self.registry.lock().put(process.clone());
        if let Some(previous) = superseded {
            self.kill(&previous, KillReason::Superseded);
        }

        let event = AuditEvent::SessionStart {
            worker: worker.id.clone(),
            pid: process.pid(),
            driver: driver.kind().to_string(),
            session_id: process.session_id(),
            resumed: process.resumed(),
        };
        if let Err(err) = self.store.append_audit(&event) {
            warn!(worker = %worker.id, error = %err, "Failed to audit session start");
        }
        info!(
            worker = %worker.id,
            pid = process.pid(),
            driver = %driver.kind(),
            session_id = ?process.session_id(),
            resumed = process.resumed(),
            "Worker spawned"
        );

        let supervisor = Arc::clone(self);
        let monitored = process.clone();
        let monitor = thread::spawn(move || supervisor.monitor(monitored, drains));
        self.monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(monitor);

        Ok(process)
    }

    fn persist_session(&self, worker_id: &str, session_id: &str) {
        if let Err(err) = self.store.set_worker_session(worker_id, session_id) {
            warn!(worker = %worker_id, error = %err, "Failed to persist session id");
        }
    }

    fn monitor(&self, process: Arc<TrackedProcess>, drains: Vec<JoinHandle<()>>) {
        for drain in drains {
            if drain.join().is_err() {
                warn!(worker = %process.worker_id(), "Output drain panicked");
            }
        }
        if process.exit_handled() {
            return;
        }
        match process.wait() {
            Ok(status) => {
                self.handle_exit(&process, status.into());
            }
            Err(err) => {
                warn!(worker = %process.worker_id(), error = %err, "Failed to wait for worker");
                self.handle_exit(
                    &process,
                    ExitOutcome {
                        code: None,
                        signal: None,
                    },
                );
            }
        }
    }

    /// Finalizes an exit once per process. Always audits the session end;
    /// presence, `left_at` and driver cleanup only apply while the process is
    /// still the tracked one for its worker. Returns false if already handled.
    pub fn handle_exit(&self, process: &Arc<TrackedProcess>, outcome: ExitOutcome) -> bool {
        let worker_id = process.worker_id();
        let kill_reason = process.kill_reason();
        let current = {
            let mut guard = self.registry.lock();
            if !process.claim_exit(&guard) {
                return false;
            }
            let current = guard.is_current(process);

            let event = AuditEvent::SessionEnd {
                worker: worker_id.to_string(),
                pid: process.pid(),
                session_id: process.session_id(),
                exit_code: outcome.code,
                signal: outcome.signal,
                kill_reason: kill_reason.map(|reason| reason.as_str().to_string()),
                superseded: !current,
            };
            if let Err(err) = self.store.append_audit(&event) {
                warn!(worker = %worker_id, error = %err, "Failed to audit session end");
            }

            if current {
                guard.remove(worker_id);
                let presence = presence::exit_presence(outcome.code, outcome.signal, kill_reason);
                if let Err(err) = self.store.update_worker_presence(worker_id, presence) {
                    warn!(worker = %worker_id, error = %err, "Failed to record exit presence");
                }
                if let Err(err) = self.store.mark_worker_left(worker_id, Utc::now()) {
                    warn!(worker = %worker_id, error = %err, "Failed to record left_at");
                }
            }
            current
        };

        info!(
            worker = %worker_id,
            pid = process.pid(),
            exit_code = ?outcome.code,
            signal = ?outcome.signal,
            kill_reason = ?kill_reason.map(|reason| reason.as_str()),
            superseded = !current,
            "Worker exited"
        );

        process.driver().cleanup(&ExitInfo {
            worker_id: worker_id.to_string(),
            pid: process.pid(),
            session_id: process.session_id(),
            exit_code: outcome.code,
            signal: outcome.signal,
        });
        true
    }

    /// Sends SIGTERM to the process group. The sweep escalates to SIGKILL
    /// after the grace period; the exit itself is finalized by the exit path.
    pub fn kill(&self, process: &TrackedProcess, reason: KillReason) {
        if process.exit_handled() || !process.record_kill(reason, Instant::now()) {
            return;
        }
        info!(
            worker = %process.worker_id(),
            pid = process.pid(),
            reason = reason.as_str(),
            "Killing worker"
        );
        if !signal_process(process.pid(), Signal::Terminate) {
            debug!(worker = %process.worker_id(), pid = process.pid(), "Worker already gone");
        }
    }

    /// Per-tick pass over live processes: reap exits, escalate kills, persist
    /// late session ids and apply presence transitions.
    pub fn sweep(&self) -> Result<(), StoreError> {
        let now = Instant::now();
        for process in self.registry.snapshot() {
            if self.reap(&process) {
                continue;
            }
            self.escalate(&process, now);
            if process.kill_reason().is_some() {
                continue;
            }
            self.sweep_process(&process, now)?;
        }

        for process in self.registry.retired() {
            if !self.reap(&process) {
                self.escalate(&process, now);
            }
        }

        self.monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|monitor| !monitor.is_finished());
        Ok(())
    }

    fn reap(&self, process: &Arc<TrackedProcess>) -> bool {
        if process.exit_handled() {
            return true;
        }
        match process.try_exit_status() {
            Some(status) => {
                self.handle_exit(process, status.into());
                true
            }
            None => false,
        }
    }

    fn escalate(&self, process: &TrackedProcess, now: Instant) {
        if process.take_escalation(now, self.settings.kill_grace) {
            warn!(
                worker = %process.worker_id(),
                pid = process.pid(),
                "Worker ignored SIGTERM; sending SIGKILL"
            );
            signal_process(process.pid(), Signal::Kill);
        }
    }

    fn sweep_process(&self, process: &Arc<TrackedProcess>, now: Instant) -> Result<(), StoreError> {
        let worker = match self.store.get_worker(process.worker_id()) {
            Ok(Some(worker)) => worker,
            Ok(None) => return Ok(()),
            Err(err) if err.is_schema() => return Err(err),
            Err(err) => {
                warn!(worker = %process.worker_id(), error = %err, "Skipping presence sweep");
                return Ok(());
            }
        };

        if let Some(session_id) = process.session_id() {
            if worker.session_id.as_deref() != Some(session_id.as_str()) {
                self.persist_session(&worker.id, &session_id);
            }
        }

        let observation = self.observe(process, &worker, now)?;
        match presence::evaluate(&observation, process.invoke()) {
            Action::Stay => {}
            Action::Transition(next) => self.transition(process, worker.presence, next, now),
            Action::Kill(reason) => self.kill(process, reason),
        }
        Ok(())
    }

    fn observe(
        &self,
        process: &TrackedProcess,
        worker: &Worker,
        now: Instant,
    ) -> Result<Observation, StoreError> {
        let presence = worker.presence;
        let usage = match presence {
            Presence::Spawning | Presence::Prompting | Presence::Prompted => {
                self.usage(process)
            }
            _ => Usage::Unknown,
        };

        let last_io = process.last_io();
        let io_since_prompted = match (last_io, process.prompted_at()) {
            (Some(io), Some(prompted)) => io > prompted,
            _ => false,
        };
        let quiet_for = now.saturating_duration_since(last_io.unwrap_or(process.started_at()));

        let since_checkin = if presence == Presence::Idle && process.invoke().min_checkin().is_some()
        {
            let last_message = match self.store.last_message_from(&worker.id) {
                Ok(last) => last,
                Err(err) if err.is_schema() => return Err(err),
                Err(err) => {
                    warn!(worker = %worker.id, error = %err, "Failed to read last message");
                    None
                }
            };
            [Some(process.started_wall()), last_message, worker.last_heartbeat]
                .into_iter()
                .flatten()
                .max()
                .map(|latest| (Utc::now() - latest).to_std().unwrap_or(Duration::ZERO))
        } else {
            None
        };

        Ok(Observation {
            presence,
            elapsed: process.elapsed(now),
            usage,
            io_seen: last_io.is_some(),
            io_since_prompted,
            quiet_for,
            since_checkin,
        })
    }

    fn usage(&self, process: &TrackedProcess) -> Usage {
        let kind = process.driver().kind();
        if !self.telemetry.supports(kind) {
            return Usage::Unsupported;
        }
        process
            .session_id()
            .and_then(|session_id| self.telemetry.token_counts(kind, &session_id))
            .map(|counts: TokenCounts| Usage::Delta(counts.since(&process.baseline())))
            .unwrap_or(Usage::Unknown)
    }

    fn transition(&self, process: &TrackedProcess, from: Presence, to: Presence, now: Instant) {
        let guard = self.registry.lock();
        if !guard.is_current(process) || process.exit_handled() {
            return;
        }
        if let Err(err) = self.store.update_worker_presence(process.worker_id(), to) {
            warn!(worker = %process.worker_id(), error = %err, "Failed to update presence");
            return;
        }
        drop(guard);
        if to == Presence::Prompted {
            process.mark_prompted(now);
        }
        debug!(worker = %process.worker_id(), from = %from, to = %to, "Presence transition");
    }

    /// Resets busy presences that have no tracked process. Run once at
    /// startup, before the first tick.
    pub fn recover_orphans(&self) -> Result<usize, StoreError> {
        let workers = self.store.list_managed_workers()?;
        let guard = self.registry.lock();
        let mut reset = 0;
        for worker in workers {
            if worker.presence.is_busy() && guard.get(&worker.id).is_none() {
                info!(
                    worker = %worker.id,
                    presence = %worker.presence,
                    "Resetting orphaned presence to idle"
                );
                self.store
                    .update_worker_presence(&worker.id, Presence::Idle)?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Cancels, SIGKILLs every process group and waits for all monitors.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let now = Instant::now();
        let mut victims = Vec::new();
        self.registry.for_each(|process| victims.push(process.clone()));
        for process in victims {
            if process.exit_handled() {
                continue;
            }
            process.record_kill(KillReason::Shutdown, now);
            debug!(worker = %process.worker_id(), pid = process.pid(), "Killing worker for shutdown");
            signal_process(process.pid(), Signal::Kill);
        }

        let monitors = std::mem::take(
            &mut *self
                .monitors
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for monitor in monitors {
            if monitor.join().is_err() {
                warn!("Monitor thread panicked");
            }
        }
    }
}

/// Reads a pipe line by line, recording activity. Stdout lines are also
/// offered to the driver for a session id.
fn start_drain<R: Read + Send + 'static>(
    process: Arc<TrackedProcess>,
    reader: R,
    stream: &'static str,
    sessions: Option<Sender<String>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(reader);
        for chunk in reader.split(b'\n') {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(worker = %process.worker_id(), stream, error = %err, "Drain stopped");
                    break;
                }
            };
            process.record_io();
            let line = String::from_utf8_lossy(&bytes);
            trace!(worker = %process.worker_id(), stream, line = %line, "Worker output");

            if let Some(sessions) = &sessions {
                if let Some(session_id) = process.driver().session_id_from_output(&line) {
                    if process.session_id().as_deref() != Some(session_id.as_str()) {
                        process.set_session_id(session_id.clone());
                        let _ = sessions.send(session_id);
                    }
                }
            }
        }
    })
}
