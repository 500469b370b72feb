//! In-memory fakes for tests. Enabled under `cfg(test)` and the
//! `test-helpers` feature.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use relay_protocol::{
    AuditEvent, InvokeSettings, Message, ParticipantKind, Presence, TokenCounts, Worker,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DriverConfig;
use crate::driver::{CommandDriver, Driver};
use crate::error::StoreError;
use crate::router::{RouteRequest, Router, RouterError, Verdict};
use crate::store::Store;
use crate::telemetry::UsageTelemetry;

static RE_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_.\-]*)").expect("mention regex"));

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MemoryState {
    workers: Vec<Worker>,
    messages: Vec<Message>,
    trust: BTreeSet<(String, String)>,
    watermarks: HashMap<(String, String), i64>,
    watermark_writes: usize,
    presence_updates: Vec<(String, Presence)>,
    audit: Vec<AuditEvent>,
    broken_schema: bool,
    unavailable: bool,
}

/// Store backed by plain collections. Presence writes and audit events are
/// recorded for assertions.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, worker_id: &str, invoke: InvokeSettings) {
        self.add_participant(worker_id, ParticipantKind::Agent, true, invoke);
    }

    pub fn add_human(&self, id: &str) {
        self.add_participant(id, ParticipantKind::Human, false, InvokeSettings::default());
    }

    pub fn add_agent(&self, id: &str) {
        self.add_participant(id, ParticipantKind::Agent, false, InvokeSettings::default());
    }

    fn add_participant(&self, id: &str, kind: ParticipantKind, managed: bool, invoke: InvokeSettings) {
        let mut state = lock(&self.state);
        state.workers.retain(|worker| worker.id != id);
        state.workers.push(Worker {
            id: id.to_string(),
            kind,
            managed,
            presence: Presence::Idle,
            session_id: None,
            last_heartbeat: None,
            left_at: None,
            invoke,
        });
    }

    pub fn post(&self, sender: &str, body: &str) -> i64 {
        self.post_message(sender, body, None, None)
    }

    pub fn post_message(
        &self,
        sender: &str,
        body: &str,
        thread_id: Option<i64>,
        reply_to: Option<&str>,
    ) -> i64 {
        let mut state = lock(&self.state);
        let id = state.messages.last().map(|message| message.id).unwrap_or(0) + 1;
        state.messages.push(Message {
            id,
            lane: relay_protocol::DEFAULT_LANE.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
            thread_id,
            reply_to: reply_to.map(str::to_string),
            created_at: Utc::now(),
        });
        id
    }

    pub fn grant_trust(&self, grantee: &str, worker_id: &str) {
        lock(&self.state)
            .trust
            .insert((grantee.to_string(), worker_id.to_string()));
    }

    /// Overwrites presence without recording it as a daemon update.
    pub fn force_presence(&self, worker_id: &str, presence: Presence) {
        if let Some(worker) = self.worker_mut(&mut lock(&self.state), worker_id) {
            worker.presence = presence;
        }
    }

    pub fn set_session(&self, worker_id: &str, session_id: &str) {
        if let Some(worker) = self.worker_mut(&mut lock(&self.state), worker_id) {
            worker.session_id = Some(session_id.to_string());
        }
    }

    pub fn set_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) {
        if let Some(worker) = self.worker_mut(&mut lock(&self.state), worker_id) {
            worker.last_heartbeat = Some(at);
        }
    }

    pub fn presence(&self, worker_id: &str) -> Option<Presence> {
        self.worker(worker_id).map(|worker| worker.presence)
    }

    pub fn worker(&self, worker_id: &str) -> Option<Worker> {
        lock(&self.state)
            .workers
            .iter()
            .find(|worker| worker.id == worker_id)
            .cloned()
    }

    pub fn presence_updates(&self, worker_id: &str) -> Vec<Presence> {
        lock(&self.state)
            .presence_updates
            .iter()
            .filter(|(id, _)| id == worker_id)
            .map(|(_, presence)| *presence)
            .collect()
    }

    pub fn audit_events(&self, worker_id: &str) -> Vec<AuditEvent> {
        lock(&self.state)
            .audit
            .iter()
            .filter(|event| event.worker() == worker_id)
            .cloned()
            .collect()
    }

    pub fn session_ends(&self, worker_id: &str) -> Vec<AuditEvent> {
        self.audit_events(worker_id)
            .into_iter()
            .filter(|event| matches!(event, AuditEvent::SessionEnd { .. }))
            .collect()
    }

    pub fn watermark_writes(&self) -> usize {
        lock(&self.state).watermark_writes
    }

    pub fn current_watermark(&self, worker_id: &str) -> i64 {
        lock(&self.state)
            .watermarks
            .get(&(worker_id.to_string(), relay_protocol::DEFAULT_LANE.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Makes every call fail as if the schema were from another version.
    pub fn break_schema(&self) {
        lock(&self.state).broken_schema = true;
    }

    /// Makes every call fail transiently until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.state).unavailable = unavailable;
    }

    fn worker_mut<'a>(&self, state: &'a mut MemoryState, worker_id: &str) -> Option<&'a mut Worker> {
        state.workers.iter_mut().find(|worker| worker.id == worker_id)
    }

    fn check(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = lock(&self.state);
        if state.broken_schema {
            return Err(StoreError::Schema("no such column: presence".to_string()));
        }
        if state.unavailable {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(state)
    }
}

fn mentions(message: &Message, worker_id: &str) -> bool {
    message.reply_to.as_deref() == Some(worker_id)
        || RE_MENTION
            .captures_iter(&message.body)
            .any(|cap| cap[1].trim_end_matches(['.', '-']).eq_ignore_ascii_case(worker_id))
}

impl Store for MemoryStore {
    fn list_managed_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let state = self.check()?;
        Ok(state
            .workers
            .iter()
            .filter(|worker| worker.managed)
            .cloned()
            .collect())
    }

    fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>, StoreError> {
        let state = self.check()?;
        Ok(state
            .workers
            .iter()
            .find(|worker| worker.id == worker_id)
            .cloned())
    }

    fn update_worker_presence(
        &self,
        worker_id: &str,
        presence: Presence,
    ) -> Result<(), StoreError> {
        let mut state = self.check()?;
        let worker = self
            .worker_mut(&mut state, worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.presence = presence;
        state
            .presence_updates
            .push((worker_id.to_string(), presence));
        Ok(())
    }

    fn set_worker_session(&self, worker_id: &str, session_id: &str) -> Result<(), StoreError> {
        let mut state = self.check()?;
        let worker = self
            .worker_mut(&mut state, worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.session_id = Some(session_id.to_string());
        Ok(())
    }

    fn mark_worker_left(&self, worker_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.check()?;
        let worker = self
            .worker_mut(&mut state, worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.left_at = Some(at);
        Ok(())
    }

    fn messages_mentioning(
        &self,
        worker_id: &str,
        lane: &str,
        since: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.check()?;
        Ok(state
            .messages
            .iter()
            .filter(|message| message.lane == lane && message.id > since)
            .filter(|message| mentions(message, worker_id))
            .cloned()
            .collect())
    }

    fn get_messages(&self, ids: &[i64]) -> Result<Vec<Message>, StoreError> {
        let state = self.check()?;
        Ok(state
            .messages
            .iter()
            .filter(|message| ids.contains(&message.id))
            .cloned()
            .collect())
    }

    fn get_thread(&self, thread_id: i64) -> Result<Vec<Message>, StoreError> {
        let state = self.check()?;
        Ok(state
            .messages
            .iter()
            .filter(|message| message.id == thread_id || message.thread_id == Some(thread_id))
            .cloned()
            .collect())
    }

    fn last_message_from(&self, worker_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.check()?;
        Ok(state
            .messages
            .iter()
            .filter(|message| message.sender == worker_id)
            .map(|message| message.created_at)
            .max())
    }

    fn is_wake_authorized(&self, message: &Message, worker_id: &str) -> Result<bool, StoreError> {
        let state = self.check()?;
        let human = state
            .workers
            .iter()
            .any(|worker| worker.id == message.sender && worker.kind == ParticipantKind::Human);
        if human {
            return Ok(true);
        }
        if state
            .trust
            .contains(&(message.sender.clone(), worker_id.to_string()))
            || state
                .trust
                .contains(&(message.sender.clone(), "*".to_string()))
        {
            return Ok(true);
        }
        let owns_thread = message.thread_id.is_some_and(|thread_id| {
            state
                .messages
                .iter()
                .any(|root| root.id == thread_id && root.sender == message.sender)
        });
        Ok(owns_thread)
    }

    fn watermark(&self, worker_id: &str, lane: &str) -> Result<i64, StoreError> {
        let state = self.check()?;
        Ok(state
            .watermarks
            .get(&(worker_id.to_string(), lane.to_string()))
            .copied()
            .unwrap_or(0))
    }

    fn set_watermark(
        &self,
        worker_id: &str,
        lane: &str,
        message_id: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.check()?;
        state.watermark_writes += 1;
        let entry = state
            .watermarks
            .entry((worker_id.to_string(), lane.to_string()))
            .or_insert(0);
        *entry = (*entry).max(message_id);
        Ok(())
    }

    fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let mut state = self.check()?;
        state.audit.push(event.clone());
        Ok(())
    }
}

/// Telemetry whose readings tests set directly.
#[derive(Default)]
pub struct FakeTelemetry {
    counts: Mutex<HashMap<String, TokenCounts>>,
}

impl FakeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session_id: &str, input: u64, output: u64) {
        lock(&self.counts).insert(session_id.to_string(), TokenCounts { input, output });
    }
}

impl UsageTelemetry for FakeTelemetry {
    fn supports(&self, _driver_kind: &str) -> bool {
        true
    }

    fn token_counts(&self, _driver_kind: &str, session_id: &str) -> Option<TokenCounts> {
        lock(&self.counts).get(session_id).copied()
    }
}

/// Router with a fixed answer that counts its calls.
pub struct FakeRouter {
    should_spawn: bool,
    calls: Arc<AtomicUsize>,
}

impl FakeRouter {
    pub fn new(should_spawn: bool) -> Self {
        Self {
            should_spawn,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the router is boxed.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Router for FakeRouter {
    fn classify(&self, _request: &RouteRequest<'_>) -> Result<Verdict, RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Verdict {
            should_spawn: self.should_spawn,
            confidence: 1.0,
        })
    }
}

/// Command driver running `script` under `/bin/sh`. The prompt arrives on
/// stdin; print `{"session_id":"..."}` to report a session.
pub fn sh_driver(script: &str) -> Arc<dyn Driver> {
    let config = DriverConfig {
        program: Some("/bin/sh".to_string()),
        args: vec!["-c".to_string(), script.to_string()],
        ..DriverConfig::default()
    };
    match CommandDriver::from_config("sh", &config) {
        Ok(driver) => Arc::new(driver),
        Err(err) => panic!("sh driver: {err}"),
    }
}
