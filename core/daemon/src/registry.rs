//! Live process registry.
//!
//! One mutex guards the worker → process map. Admission decisions and exit
//! finalization both run while holding [`RegistryGuard`], so a process that is
//! exiting and a spawn that replaces it never interleave their presence writes.
//! Lock order is always registry, then store.

use chrono::{DateTime, Utc};
use relay_protocol::{InvokeConfig, TokenCounts};
use std::collections::HashMap;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::driver::Driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    MaxRuntime,
    SpawnTimeout,
    Checkin,
    Superseded,
    Shutdown,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillReason::MaxRuntime => "max_runtime",
            KillReason::SpawnTimeout => "spawn_timeout",
            KillReason::Checkin => "checkin",
            KillReason::Superseded => "superseded",
            KillReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KillState {
    reason: KillReason,
    sent_at: Instant,
    escalated: bool,
}

/// Everything needed to start tracking a freshly launched child.
pub struct ProcessSpec {
    pub id: u64,
    pub worker_id: String,
    pub driver: Arc<dyn Driver>,
    pub invoke: InvokeConfig,
    pub resumed: bool,
    pub baseline: TokenCounts,
    pub session_id: Option<String>,
    pub child: Child,
}

/// One worker process owned by the daemon.
pub struct TrackedProcess {
    id: u64,
    worker_id: String,
    pid: u32,
    driver: Arc<dyn Driver>,
    invoke: InvokeConfig,
    resumed: bool,
    baseline: TokenCounts,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    session_id: Mutex<Option<String>>,
    last_io: Mutex<Option<Instant>>,
    prompted_at: Mutex<Option<Instant>>,
    kill: Mutex<Option<KillState>>,
    child: Mutex<Child>,
    exit_handled: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TrackedProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            id: spec.id,
            worker_id: spec.worker_id,
            pid: spec.child.id(),
            driver: spec.driver,
            invoke: spec.invoke,
            resumed: spec.resumed,
            baseline: spec.baseline,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            session_id: Mutex::new(spec.session_id),
            last_io: Mutex::new(None),
            prompted_at: Mutex::new(None),
            kill: Mutex::new(None),
            child: Mutex::new(spec.child),
            exit_handled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn invoke(&self) -> &InvokeConfig {
        &self.invoke
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn baseline(&self) -> TokenCounts {
        self.baseline
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn started_wall(&self) -> DateTime<Utc> {
        self.started_wall
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    pub fn set_session_id(&self, session_id: String) {
        *lock(&self.session_id) = Some(session_id);
    }

    pub fn record_io(&self) {
        *lock(&self.last_io) = Some(Instant::now());
    }

    pub fn last_io(&self) -> Option<Instant> {
        *lock(&self.last_io)
    }

    pub fn mark_prompted(&self, at: Instant) {
        *lock(&self.prompted_at) = Some(at);
    }

    pub fn prompted_at(&self) -> Option<Instant> {
        *lock(&self.prompted_at)
    }

    pub fn kill_reason(&self) -> Option<KillReason> {
        lock(&self.kill).map(|state| state.reason)
    }

    /// Records the first kill request. Later requests keep the original
    /// reason and return false.
    pub fn record_kill(&self, reason: KillReason, at: Instant) -> bool {
        let mut kill = lock(&self.kill);
        if kill.is_some() {
            return false;
        }
        *kill = Some(KillState {
            reason,
            sent_at: at,
            escalated: false,
        });
        true
    }

    /// True exactly once, when a SIGTERM has gone unanswered for `grace`.
    pub fn take_escalation(&self, now: Instant, grace: Duration) -> bool {
        let mut kill = lock(&self.kill);
        match kill.as_mut() {
            Some(state) if !state.escalated && now.saturating_duration_since(state.sent_at) >= grace => {
                state.escalated = true;
                true
            }
            _ => false,
        }
    }

    /// Non-blocking exit probe. Skips the check while the monitor thread is
    /// blocked in `wait`, which reports the exit itself.
    pub fn try_exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.try_lock().ok()?;
        child.try_wait().ok().flatten()
    }

    pub fn wait(&self) -> std::io::Result<ExitStatus> {
        lock(&self.child).wait()
    }

    pub fn exit_handled(&self) -> bool {
        self.exit_handled.load(Ordering::SeqCst)
    }

    /// Check-and-set of the exit flag. Requiring the guard keeps the flag and
    /// the registry map consistent.
    pub fn claim_exit(&self, _guard: &RegistryGuard<'_>) -> bool {
        !self.exit_handled.swap(true, Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<String, Arc<TrackedProcess>>,
    /// Replaced processes that may still be running.
    retired: Vec<Arc<TrackedProcess>>,
}

#[derive(Default)]
pub struct ProcessRegistry {
    state: Mutex<RegistryState>,
}

pub struct RegistryGuard<'a> {
    state: MutexGuard<'a, RegistryState>,
}

impl RegistryGuard<'_> {
    pub fn get(&self, worker_id: &str) -> Option<Arc<TrackedProcess>> {
        self.state.live.get(worker_id).cloned()
    }

    pub fn is_current(&self, process: &TrackedProcess) -> bool {
        self.state
            .live
            .get(process.worker_id())
            .map(|current| current.id() == process.id())
            .unwrap_or(false)
    }

    /// Tracks `process` for its worker. A different process already tracked
    /// for the worker is retired and returned.
    pub fn put(&mut self, process: Arc<TrackedProcess>) -> Option<Arc<TrackedProcess>> {
        let previous = self
            .state
            .live
            .insert(process.worker_id().to_string(), process.clone());
        match previous {
            Some(previous) if previous.id() != process.id() => {
                self.state.retired.push(previous.clone());
                Some(previous)
            }
            _ => None,
        }
    }

    pub fn remove(&mut self, worker_id: &str) -> Option<Arc<TrackedProcess>> {
        self.state.live.remove(worker_id)
    }

    /// Stops tracking the worker's process as current but keeps watching it
    /// until its exit is handled.
    pub fn retire(&mut self, worker_id: &str) -> Option<Arc<TrackedProcess>> {
        let previous = self.state.live.remove(worker_id)?;
        self.state.retired.push(previous.clone());
        Some(previous)
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            state: lock(&self.state),
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<TrackedProcess>> {
        self.lock().get(worker_id)
    }

    /// Current processes, copied out so callers can do I/O without the lock.
    pub fn snapshot(&self) -> Vec<Arc<TrackedProcess>> {
        let mut processes: Vec<_> = self.lock().state.live.values().cloned().collect();
        processes.sort_by(|a, b| a.worker_id().cmp(b.worker_id()));
        processes
    }

    /// Retired processes still awaiting exit; finished ones are dropped.
    pub fn retired(&self) -> Vec<Arc<TrackedProcess>> {
        let mut guard = self.lock();
        guard.state.retired.retain(|process| !process.exit_handled());
        guard.state.retired.clone()
    }

    /// Visits every process, live or retired, under the lock. `f` must not
    /// touch the registry or the store.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<TrackedProcess>)) {
        let guard = self.lock();
        guard
            .state
            .live
            .values()
            .chain(guard.state.retired.iter())
            .for_each(|process| f(process));
    }

    pub fn len(&self) -> usize {
        self.lock().state.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
