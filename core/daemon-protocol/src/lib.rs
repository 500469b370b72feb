//! Shared data model for relay-daemon and its clients.
//!
//! This crate is shared by the daemon and `relayctl` to prevent schema drift.
//! The daemon remains the authority on state transitions, but clients reuse
//! the same types to read the store and the lock file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The only message lane the daemon watches today.
pub const DEFAULT_LANE: &str = "room";

pub const DEFAULT_SPAWN_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_IDLE_AFTER_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Idle,
    Spawning,
    Prompting,
    Prompted,
    Active,
    Compacting,
    Offline,
    Error,
}

impl Presence {
    /// Busy presences imply a tracked process owned by the daemon.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Presence::Spawning
                | Presence::Prompting
                | Presence::Prompted
                | Presence::Active
                | Presence::Compacting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Idle => "idle",
            Presence::Spawning => "spawning",
            Presence::Prompting => "prompting",
            Presence::Prompted => "prompted",
            Presence::Active => "active",
            Presence::Compacting => "compacting",
            Presence::Offline => "offline",
            Presence::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Presence::Idle),
            "spawning" => Some(Presence::Spawning),
            "prompting" => Some(Presence::Prompting),
            "prompted" => Some(Presence::Prompted),
            "active" => Some(Presence::Active),
            "compacting" => Some(Presence::Compacting),
            "offline" => Some(Presence::Offline),
            "error" => Some(Presence::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    Human,
    Agent,
}

impl ParticipantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantKind::Human => "human",
            ParticipantKind::Agent => "agent",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "human" => Some(ParticipantKind::Human),
            "agent" => Some(ParticipantKind::Agent),
            _ => None,
        }
    }
}

/// Per-worker `invoke` settings as stored. Unset fields fall back to the
/// daemon-wide defaults when resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_checkin_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime_ms: Option<u64>,
}

impl InvokeSettings {
    pub fn resolve(&self, defaults: &InvokeConfig) -> InvokeConfig {
        InvokeConfig {
            driver: self.driver.clone().or_else(|| defaults.driver.clone()),
            spawn_timeout_ms: self.spawn_timeout_ms.unwrap_or(defaults.spawn_timeout_ms),
            idle_after_ms: self.idle_after_ms.unwrap_or(defaults.idle_after_ms),
            min_checkin_ms: self.min_checkin_ms.unwrap_or(defaults.min_checkin_ms),
            max_runtime_ms: self.max_runtime_ms.unwrap_or(defaults.max_runtime_ms),
        }
    }
}

/// Effective invoke settings for one worker. A value of 0 disables the
/// corresponding timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokeConfig {
    pub driver: Option<String>,
    pub spawn_timeout_ms: u64,
    pub idle_after_ms: u64,
    pub min_checkin_ms: u64,
    pub max_runtime_ms: u64,
}

impl Default for InvokeConfig {
    fn default() -> Self {
        Self {
            driver: None,
            spawn_timeout_ms: DEFAULT_SPAWN_TIMEOUT_MS,
            idle_after_ms: DEFAULT_IDLE_AFTER_MS,
            min_checkin_ms: 0,
            max_runtime_ms: 0,
        }
    }
}

impl InvokeConfig {
    pub fn spawn_timeout(&self) -> Option<Duration> {
        non_zero(self.spawn_timeout_ms)
    }

    pub fn idle_after(&self) -> Option<Duration> {
        non_zero(self.idle_after_ms)
    }

    pub fn min_checkin(&self) -> Option<Duration> {
        non_zero(self.min_checkin_ms)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        non_zero(self.max_runtime_ms)
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub kind: ParticipantKind,
    pub managed: bool,
    pub presence: Presence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invoke: InvokeSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub lane: String,
    pub sender: String,
    pub body: String,
    /// Root message id when this message is a thread reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<i64>,
    /// Worker this message replies to, when it is a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Singleton marker written by a running daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
}

impl TokenCounts {
    /// Tokens added on top of `baseline`. Readings below the baseline (a
    /// rotated or truncated transcript) count as no new activity.
    pub fn since(&self, baseline: &TokenCounts) -> TokenCounts {
        TokenCounts {
            input: self.input.saturating_sub(baseline.input),
            output: self.output.saturating_sub(baseline.output),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    SessionStart {
        worker: String,
        pid: u32,
        driver: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        resumed: bool,
    },
    SessionEnd {
        worker: String,
        pid: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kill_reason: Option<String>,
        superseded: bool,
    },
}

impl AuditEvent {
    pub fn worker(&self) -> &str {
        match self {
            AuditEvent::SessionStart { worker, .. } | AuditEvent::SessionEnd { worker, .. } => {
                worker
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::SessionStart { .. } => "session_start",
            AuditEvent::SessionEnd { .. } => "session_end",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_strings_match_serde() {
        for presence in [
            Presence::Idle,
            Presence::Spawning,
            Presence::Prompting,
            Presence::Prompted,
            Presence::Active,
            Presence::Compacting,
            Presence::Offline,
            Presence::Error,
        ] {
            let json = serde_json::to_string(&presence).expect("serialize");
            assert_eq!(json.trim_matches('"'), presence.as_str());
            assert_eq!(Presence::from_str(presence.as_str()), Some(presence));
        }
        assert_eq!(Presence::from_str("asleep"), None);
    }

    #[test]
    fn only_process_backed_presences_are_busy() {
        assert!(Presence::Spawning.is_busy());
        assert!(Presence::Active.is_busy());
        assert!(!Presence::Idle.is_busy());
        assert!(!Presence::Error.is_busy());
        assert!(!Presence::Offline.is_busy());
    }

    #[test]
    fn invoke_settings_fall_back_to_defaults() {
        let defaults = InvokeConfig {
            driver: Some("claude".to_string()),
            max_runtime_ms: 3_600_000,
            ..InvokeConfig::default()
        };
        let settings = InvokeSettings {
            min_checkin_ms: Some(60_000),
            ..InvokeSettings::default()
        };

        let resolved = settings.resolve(&defaults);
        assert_eq!(resolved.driver.as_deref(), Some("claude"));
        assert_eq!(resolved.min_checkin(), Some(Duration::from_secs(60)));
        assert_eq!(resolved.max_runtime(), Some(Duration::from_secs(3600)));
        assert_eq!(resolved.spawn_timeout_ms, DEFAULT_SPAWN_TIMEOUT_MS);
    }

    #[test]
    fn zero_disables_timers() {
        let config = InvokeConfig {
            max_runtime_ms: 0,
            min_checkin_ms: 0,
            ..InvokeConfig::default()
        };
        assert!(config.max_runtime().is_none());
        assert!(config.min_checkin().is_none());
    }

    #[test]
    fn token_delta_never_goes_negative() {
        let baseline = TokenCounts {
            input: 100,
            output: 50,
        };
        let reading = TokenCounts {
            input: 90,
            output: 80,
        };
        assert_eq!(
            reading.since(&baseline),
            TokenCounts {
                input: 0,
                output: 30
            }
        );
    }

    #[test]
    fn lock_info_uses_plain_field_names() {
        let info = LockInfo {
            pid: 42,
            started_at: DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
                .expect("timestamp")
                .with_timezone(&Utc),
        };
        let value = serde_json::to_value(&info).expect("serialize");
        assert_eq!(value["pid"], 42);
        assert!(value["started_at"].is_string());
    }

    #[test]
    fn audit_event_is_tagged() {
        let event = AuditEvent::SessionEnd {
            worker: "w".to_string(),
            pid: 7,
            session_id: None,
            exit_code: Some(0),
            signal: None,
            kill_reason: None,
            superseded: false,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "session_end");
        assert_eq!(event.kind(), "session_end");
        assert_eq!(event.worker(), "w");
    }
}
