//! Mention pipeline: turns new messages for a worker into spawn, queue or
//! skip decisions.
//!
//! Messages are handled in id order, at most one spawn per worker per tick.
//! The watermark moves past skipped messages only while nothing has been
//! spawned or queued this tick, and past a spawn's folded messages on success.
//! It never moves past a message that was only queued.

use once_cell::sync::Lazy;
use regex::Regex;
use relay_protocol::{Message, Worker};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::debounce::Debouncer;
use crate::error::{SpawnError, StoreError};
use crate::prompt::build_wake_prompt;
use crate::registry::KillReason;
use crate::router::{FailOpenRouter, RouteRequest};
use crate::store::Store;
use crate::supervisor::{Admission, Supervisor};

static RE_INFORMATIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(fyi|cc|heads[\s-]?up|for your information)\b").expect("informational regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SelfMention,
    Informational,
    RouterDeclined,
    Unauthorized,
    ErrorBlocked,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SelfMention => "self_mention",
            SkipReason::Informational => "informational",
            SkipReason::RouterDeclined => "router_declined",
            SkipReason::Unauthorized => "unauthorized",
            SkipReason::ErrorBlocked => "error_blocked",
        }
    }
}

/// What one tick did for one worker.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerTick {
    pub spawned: Option<u32>,
    /// Ids folded into the wake prompt of this tick's spawn.
    pub folded_through: Option<i64>,
    pub queued: Vec<i64>,
    pub skipped: Vec<(i64, SkipReason)>,
}

impl WorkerTick {
    fn holding(&self) -> bool {
        self.spawned.is_some() || !self.queued.is_empty()
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    debouncer: Debouncer,
    router: FailOpenRouter,
    supervisor: Arc<Supervisor>,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn Store>,
        debouncer: Debouncer,
        router: FailOpenRouter,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        Self {
            store,
            debouncer,
            router,
            supervisor,
        }
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }

    pub fn process_worker(&self, worker: &Worker) -> Result<WorkerTick, StoreError> {
        let since = self.debouncer.watermark(&worker.id)?;
        let messages =
            self.store
                .messages_mentioning(&worker.id, self.debouncer.lane(), since)?;
        let mut tick = WorkerTick::default();

        for message in &messages {
            if tick
                .folded_through
                .is_some_and(|folded| message.id <= folded)
            {
                continue;
            }

            if let Some(reason) = self.screen(worker, message)? {
                self.skip(worker, message, reason, &mut tick)?;
                continue;
            }

            if tick.spawned.is_some() {
                self.queue(worker, message, &mut tick);
                continue;
            }

            match self.supervisor.admit(&worker.id)? {
                Admission::Queue => self.queue(worker, message, &mut tick),
                Admission::Blocked => {
                    let dropped = self.debouncer.flush_pending(&worker.id);
                    if !dropped.is_empty() {
                        debug!(
                            worker = %worker.id,
                            dropped = dropped.len(),
                            "Dropping queued mentions for errored worker"
                        );
                    }
                    self.skip(worker, message, SkipReason::ErrorBlocked, &mut tick)?;
                }
                Admission::Spawn {
                    worker: fresh,
                    superseded,
                } => {
                    if let Some(previous) = superseded {
                        self.supervisor.kill(&previous, KillReason::Superseded);
                    }
                    match self.spawn(&fresh, message) {
                        Ok((pid, folded)) => {
                            self.debouncer.update_watermark(&worker.id, folded)?;
                            tick.spawned = Some(pid);
                            tick.folded_through = Some(folded);
                        }
                        Err(SpawnError::Store(err)) if err.is_schema() => return Err(err),
                        Err(err) => {
                            warn!(
                                worker = %worker.id,
                                message_id = message.id,
                                error = %err,
                                "Wake failed"
                            );
                            break;
                        }
                    }
                }
            }
        }

        Ok(tick)
    }

    /// Steps that can rule a message out before admission. None means the
    /// message is a spawn candidate.
    fn screen(&self, worker: &Worker, message: &Message) -> Result<Option<SkipReason>, StoreError> {
        if message.sender == worker.id {
            return Ok(Some(SkipReason::SelfMention));
        }
        if is_informational(&message.body) {
            return Ok(Some(SkipReason::Informational));
        }

        if !is_direct_address(worker, message) {
            let thread = self.thread_context(message)?;
            let verdict = self.router.classify(&RouteRequest {
                message: &message.body,
                sender: &message.sender,
                worker: &worker.id,
                thread: &thread,
            });
            if !verdict.should_spawn {
                return Ok(Some(SkipReason::RouterDeclined));
            }
        }

        if !self.store.is_wake_authorized(message, &worker.id)? {
            return Ok(Some(SkipReason::Unauthorized));
        }
        Ok(None)
    }

    fn thread_context(&self, message: &Message) -> Result<Vec<String>, StoreError> {
        let Some(thread_id) = message.thread_id else {
            return Ok(Vec::new());
        };
        Ok(self
            .store
            .get_thread(thread_id)?
            .into_iter()
            .filter(|entry| entry.id != message.id)
            .map(|entry| format!("{}: {}", entry.sender, entry.body))
            .collect())
    }

    fn skip(
        &self,
        worker: &Worker,
        message: &Message,
        reason: SkipReason,
        tick: &mut WorkerTick,
    ) -> Result<(), StoreError> {
        debug!(
            worker = %worker.id,
            message_id = message.id,
            reason = reason.as_str(),
            "Skipping mention"
        );
        if !tick.holding() {
            self.debouncer.update_watermark(&worker.id, message.id)?;
        }
        tick.skipped.push((message.id, reason));
        Ok(())
    }

    fn queue(&self, worker: &Worker, message: &Message, tick: &mut WorkerTick) {
        if self.debouncer.queue_mention(&worker.id, message.id) {
            debug!(worker = %worker.id, message_id = message.id, "Queued mention");
        }
        tick.queued.push(message.id);
    }

    /// Folds pending mentions and the trigger into one prompt and spawns.
    /// Returns the pid and the last folded message id.
    fn spawn(&self, worker: &Worker, trigger: &Message) -> Result<(u32, i64), SpawnError> {
        let pending_ids: Vec<i64> = self
            .debouncer
            .flush_pending(&worker.id)
            .into_iter()
            .filter(|id| *id != trigger.id)
            .collect();
        let pending = if pending_ids.is_empty() {
            Vec::new()
        } else {
            self.store.get_messages(&pending_ids)?
        };

        let prompt = build_wake_prompt(&worker.id, self.debouncer.lane(), trigger, &pending);
        let process = self.supervisor.spawn(worker, &prompt.text)?;
        info!(
            worker = %worker.id,
            trigger = trigger.id,
            folded = pending.len() + 1,
            folded_through = prompt.last_message_id,
            "Woke worker"
        );
        Ok((process.pid(), prompt.last_message_id))
    }
}

/// The body opens with `@worker`, or the message is a reply to the worker.
pub fn is_direct_address(worker: &Worker, message: &Message) -> bool {
    if message.reply_to.as_deref() == Some(worker.id.as_str()) {
        return true;
    }
    let body = message.body.trim_start();
    let Some(rest) = body.strip_prefix('@') else {
        return false;
    };
    match rest.get(..worker.id.len()) {
        Some(name) if name.eq_ignore_ascii_case(&worker.id) => rest[worker.id.len()..]
            .chars()
            .next()
            .map_or(true, |next| !(next.is_alphanumeric() || next == '_' || next == '-')),
        _ => false,
    }
}

pub fn is_informational(body: &str) -> bool {
    RE_INFORMATIONAL.is_match(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_protocol::{ParticipantKind, Presence};

    fn worker(id: &str) -> Worker {
        Worker {
            id: id.to_string(),
            kind: ParticipantKind::Agent,
            managed: true,
            presence: Presence::Idle,
            session_id: None,
            last_heartbeat: None,
            left_at: None,
            invoke: Default::default(),
        }
    }

    fn message(body: &str, reply_to: Option<&str>) -> Message {
        Message {
            id: 1,
            lane: "room".to_string(),
            sender: "alice".to_string(),
            body: body.to_string(),
            thread_id: None,
            reply_to: reply_to.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn direct_address_requires_leading_mention() {
        let builder = worker("builder");
        assert!(is_direct_address(&builder, &message("@builder fix it", None)));
        assert!(is_direct_address(&builder, &message("  @Builder: fix it", None)));
        assert!(is_direct_address(&builder, &message("@builder", None)));
        assert!(!is_direct_address(&builder, &message("@builder2 fix it", None)));
        assert!(!is_direct_address(&builder, &message("can @builder fix it?", None)));
        assert!(is_direct_address(&builder, &message("sounds good", Some("builder"))));
    }

    #[test]
    fn informational_patterns() {
        assert!(is_informational("FYI @builder the deploy finished"));
        assert!(is_informational("cc @builder"));
        assert!(is_informational("heads up @builder, main is red"));
        assert!(is_informational("Heads-up: @builder"));
        assert!(is_informational("for your information @builder"));
        assert!(!is_informational("@builder please fix the build"));
        assert!(!is_informational("@builder run gcc again"));
    }
}
