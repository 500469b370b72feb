//! Presence state machine.
//!
//! `idle → spawning → prompting → prompted → active → idle`, with `error`
//! reached from a spawn timeout or a failing exit. The sweep gathers an
//! [`Observation`] per live process and [`evaluate`] decides the next step.
//! Evaluation is pure so timer behavior can be checked without waiting.

use relay_protocol::{InvokeConfig, Presence, TokenCounts};
use std::time::Duration;

use crate::registry::KillReason;

/// What usage telemetry says about a session relative to its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    /// The backend has no telemetry source; stdout activity stands in.
    Unsupported,
    /// Supported, but nothing readable yet (no session id, no transcript).
    Unknown,
    /// Tokens added since the baseline.
    Delta(TokenCounts),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub presence: Presence,
    /// Time since the process was spawned.
    pub elapsed: Duration,
    pub usage: Usage,
    /// Any stdout or stderr line seen since spawn.
    pub io_seen: bool,
    /// Output observed after the process entered `prompted`.
    pub io_since_prompted: bool,
    /// Time since the last output line, or since spawn when there was none.
    pub quiet_for: Duration,
    /// Time since the latest of process start, the worker's last posted
    /// message and its last heartbeat. Only gathered for idle processes.
    pub since_checkin: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Stay,
    Transition(Presence),
    Kill(KillReason),
}

pub fn evaluate(observation: &Observation, invoke: &InvokeConfig) -> Action {
    if let Some(max_runtime) = invoke.max_runtime() {
        if observation.elapsed > max_runtime {
            return Action::Kill(KillReason::MaxRuntime);
        }
    }

    match observation.presence {
        Presence::Spawning | Presence::Prompting | Presence::Prompted => {
            evaluate_starting(observation, invoke)
        }
        Presence::Active => match invoke.idle_after() {
            Some(idle_after) if observation.quiet_for > idle_after => {
                Action::Transition(Presence::Idle)
            }
            _ => Action::Stay,
        },
        Presence::Idle => match (invoke.min_checkin(), observation.since_checkin) {
            (Some(min_checkin), Some(since)) if since > min_checkin => {
                Action::Kill(KillReason::Checkin)
            }
            _ => Action::Stay,
        },
        Presence::Compacting | Presence::Offline | Presence::Error => Action::Stay,
    }
}

fn evaluate_starting(observation: &Observation, invoke: &InvokeConfig) -> Action {
    let presence = observation.presence;
    let next = match observation.usage {
        Usage::Delta(delta) if delta.output > 0 => Some(Presence::Prompted),
        Usage::Delta(delta) if delta.input > 0 && presence == Presence::Spawning => {
            Some(Presence::Prompting)
        }
        Usage::Unsupported if observation.io_seen => Some(Presence::Prompted),
        _ => None,
    };
    if let Some(next) = next {
        if next != presence {
            return Action::Transition(next);
        }
    }

    if presence == Presence::Spawning {
        if let Some(spawn_timeout) = invoke.spawn_timeout() {
            if observation.elapsed > spawn_timeout {
                return Action::Kill(KillReason::SpawnTimeout);
            }
        }
    }

    if presence == Presence::Prompted && observation.io_since_prompted {
        return Action::Transition(Presence::Active);
    }

    Action::Stay
}

/// Presence recorded when a process exit is finalized. Our own kills end
/// cleanly whatever the exit code, except a spawn that never came up.
pub fn exit_presence(
    exit_code: Option<i32>,
    signal: Option<i32>,
    kill_reason: Option<KillReason>,
) -> Presence {
    match kill_reason {
        Some(KillReason::SpawnTimeout) => return Presence::Error,
        Some(_) => return Presence::Idle,
        None => {}
    }
    match (exit_code, signal) {
        (Some(0), _) => Presence::Idle,
        (_, Some(_)) => Presence::Idle,
        (Some(_), None) => Presence::Error,
        (None, None) => Presence::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(presence: Presence) -> Observation {
        Observation {
            presence,
            elapsed: Duration::from_secs(5),
            usage: Usage::Unknown,
            io_seen: false,
            io_since_prompted: false,
            quiet_for: Duration::ZERO,
            since_checkin: None,
        }
    }

    fn delta(input: u64, output: u64) -> Usage {
        Usage::Delta(TokenCounts { input, output })
    }

    #[test]
    fn new_output_over_baseline_means_prompted() {
        let baseline = TokenCounts {
            input: 100,
            output: 50,
        };
        let reading = TokenCounts {
            input: 100,
            output: 80,
        };
        let obs = Observation {
            usage: Usage::Delta(reading.since(&baseline)),
            ..observation(Presence::Spawning)
        };
        assert_eq!(
            evaluate(&obs, &InvokeConfig::default()),
            Action::Transition(Presence::Prompted)
        );
    }

    #[test]
    fn input_only_moves_spawning_to_prompting() {
        let obs = Observation {
            usage: delta(12, 0),
            ..observation(Presence::Spawning)
        };
        assert_eq!(
            evaluate(&obs, &InvokeConfig::default()),
            Action::Transition(Presence::Prompting)
        );

        let obs = Observation {
            usage: delta(12, 0),
            ..observation(Presence::Prompting)
        };
        assert_eq!(evaluate(&obs, &InvokeConfig::default()), Action::Stay);
    }

    #[test]
    fn unchanged_telemetry_stays() {
        let obs = Observation {
            usage: delta(0, 0),
            io_seen: true,
            ..observation(Presence::Spawning)
        };
        assert_eq!(evaluate(&obs, &InvokeConfig::default()), Action::Stay);
    }

    #[test]
    fn backends_without_telemetry_advance_on_output() {
        let obs = Observation {
            usage: Usage::Unsupported,
            io_seen: true,
            ..observation(Presence::Spawning)
        };
        assert_eq!(
            evaluate(&obs, &InvokeConfig::default()),
            Action::Transition(Presence::Prompted)
        );
    }

    #[test]
    fn spawning_times_out() {
        let invoke = InvokeConfig {
            spawn_timeout_ms: 1_000,
            ..InvokeConfig::default()
        };
        let obs = Observation {
            elapsed: Duration::from_millis(1_500),
            ..observation(Presence::Spawning)
        };
        assert_eq!(
            evaluate(&obs, &invoke),
            Action::Kill(KillReason::SpawnTimeout)
        );

        let obs = Observation {
            elapsed: Duration::from_millis(1_500),
            ..observation(Presence::Prompting)
        };
        assert_eq!(evaluate(&obs, &invoke), Action::Stay);
    }

    #[test]
    fn max_runtime_wins_even_mid_response() {
        let invoke = InvokeConfig {
            max_runtime_ms: 60_000,
            ..InvokeConfig::default()
        };
        let obs = Observation {
            elapsed: Duration::from_secs(61),
            usage: delta(0, 500),
            io_seen: true,
            io_since_prompted: true,
            ..observation(Presence::Prompted)
        };
        assert_eq!(evaluate(&obs, &invoke), Action::Kill(KillReason::MaxRuntime));

        let unlimited = InvokeConfig {
            max_runtime_ms: 0,
            ..InvokeConfig::default()
        };
        assert_eq!(
            evaluate(&obs, &unlimited),
            Action::Transition(Presence::Active)
        );
    }

    #[test]
    fn active_goes_idle_after_quiet_period() {
        let invoke = InvokeConfig {
            idle_after_ms: 30_000,
            ..InvokeConfig::default()
        };
        let obs = Observation {
            quiet_for: Duration::from_secs(31),
            ..observation(Presence::Active)
        };
        assert_eq!(
            evaluate(&obs, &invoke),
            Action::Transition(Presence::Idle)
        );

        let obs = Observation {
            quiet_for: Duration::from_secs(10),
            ..observation(Presence::Active)
        };
        assert_eq!(evaluate(&obs, &invoke), Action::Stay);
    }

    #[test]
    fn silent_idle_worker_past_min_checkin_is_killed() {
        let invoke = InvokeConfig {
            min_checkin_ms: 60_000,
            ..InvokeConfig::default()
        };
        let obs = Observation {
            since_checkin: Some(Duration::from_secs(61)),
            ..observation(Presence::Idle)
        };
        assert_eq!(evaluate(&obs, &invoke), Action::Kill(KillReason::Checkin));

        let recent = Observation {
            since_checkin: Some(Duration::from_secs(59)),
            ..observation(Presence::Idle)
        };
        assert_eq!(evaluate(&recent, &invoke), Action::Stay);
        assert_eq!(evaluate(&obs, &InvokeConfig::default()), Action::Stay);
    }

    #[test]
    fn exit_presence_rules() {
        assert_eq!(exit_presence(Some(0), None, None), Presence::Idle);
        assert_eq!(exit_presence(None, Some(15), None), Presence::Idle);
        assert_eq!(
            exit_presence(None, Some(15), Some(KillReason::Checkin)),
            Presence::Idle
        );
        assert_eq!(
            exit_presence(None, Some(15), Some(KillReason::SpawnTimeout)),
            Presence::Error
        );
        assert_eq!(exit_presence(Some(2), None, None), Presence::Error);
        assert_eq!(
            exit_presence(Some(143), None, Some(KillReason::MaxRuntime)),
            Presence::Idle
        );
        assert_eq!(
            exit_presence(Some(1), None, Some(KillReason::Superseded)),
            Presence::Idle
        );
        assert_eq!(
            exit_presence(Some(143), None, Some(KillReason::SpawnTimeout)),
            Presence::Error
        );
    }
}
