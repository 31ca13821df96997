//! State derivation
//!
//! Pure functions computing run, step and hook state from a set of events.
//! None of them assume the input is sorted: "current status" is always decided
//! by the latest timestamp among the status-relevant events, so events that
//! arrive out of temporal order are handled the same as ordered ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::event::ReplayEvent;
use crate::error::Failure;

/// Derived run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Interrupted,
    Completed,
    Failed,
}

impl RunStatus {
    /// Completed and Failed runs never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Derived step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Error,
    Interrupted,
    Completed,
    Failed,
}

impl StepStatus {
    /// Completed and Failed steps never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// Snapshot of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub replayable_id: String,
    pub args: Value,
    pub status: RunStatus,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<Failure>,
}

/// One attempt of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// When the attempt started
    pub on: DateTime<Utc>,
    /// Error that ended the attempt, if any
    pub error: Option<Failure>,
}

/// Snapshot of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub run_id: String,
    pub step: u32,
    pub status: StepStatus,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub attempts: Vec<Attempt>,
    pub result: Option<Value>,
    pub error: Option<Failure>,
}

/// A run waiting on a hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookBinding {
    pub run_id: String,
    pub hook_id: String,
    pub on: DateTime<Utc>,
}

/// A value delivered to a hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookTrigger {
    pub value: Value,
    pub on: DateTime<Utc>,
}

/// Key identifying a settled operation within a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettleKey {
    /// Terminal event of a step
    Step(u32),
    /// The `index`-th trigger (0-based) of a hook token
    Hook { token: String, index: usize },
}

/// Recorded settlement of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub key: SettleKey,
    pub on: DateTime<Utc>,
}

/// Events sorted by timestamp; ties keep their input order
fn chronological<'a>(events: impl IntoIterator<Item = &'a ReplayEvent>) -> Vec<&'a ReplayEvent> {
    let mut sorted: Vec<&ReplayEvent> = events.into_iter().collect();
    sorted.sort_by_key(|e| e.timestamp());
    sorted
}

/// Derive the state of `run_id`. `None` until `run:started` is present.
pub fn derive_run_state<'a>(
    events: impl IntoIterator<Item = &'a ReplayEvent>,
    run_id: &str,
) -> Option<RunState> {
    let events = chronological(
        events
            .into_iter()
            .filter(|e| e.is_run_event() && e.run_id() == Some(run_id)),
    );

    let (replayable_id, args, started) = events.iter().find_map(|e| match e {
        ReplayEvent::RunStarted {
            replayable_id,
            args,
            timestamp,
            ..
        } => Some((replayable_id.clone(), args.clone(), *timestamp)),
        _ => None,
    })?;

    let completed = events.iter().find_map(|e| match e {
        ReplayEvent::RunCompleted {
            result, timestamp, ..
        } => Some((result.clone(), *timestamp)),
        _ => None,
    });
    let failed = events.iter().find_map(|e| match e {
        ReplayEvent::RunFailed {
            error, timestamp, ..
        } => Some((error.clone(), *timestamp)),
        _ => None,
    });

    let latest_pause = events.iter().rev().find(|e| {
        matches!(
            e,
            ReplayEvent::RunPaused { .. }
                | ReplayEvent::RunResumed { .. }
                | ReplayEvent::RunRecovered { .. }
        )
    });
    let latest_interruption = events.iter().rev().find(|e| {
        matches!(
            e,
            ReplayEvent::RunInterrupted { .. } | ReplayEvent::RunRecovered { .. }
        )
    });

    let status = if completed.is_some() {
        RunStatus::Completed
    } else if failed.is_some() {
        RunStatus::Failed
    } else if matches!(latest_pause, Some(ReplayEvent::RunPaused { .. })) {
        RunStatus::Paused
    } else if matches!(latest_interruption, Some(ReplayEvent::RunInterrupted { .. })) {
        RunStatus::Interrupted
    } else {
        RunStatus::Running
    };

    let finished = completed
        .as_ref()
        .map(|(_, at)| *at)
        .or(failed.as_ref().map(|(_, at)| *at));

    Some(RunState {
        run_id: run_id.to_string(),
        replayable_id,
        args,
        status,
        started,
        finished,
        result: completed.map(|(result, _)| result),
        error: failed.map(|(error, _)| error),
    })
}

/// Derive the state of step `step` of `run_id`. `None` until `step:started` is present.
pub fn derive_step_state<'a>(
    events: impl IntoIterator<Item = &'a ReplayEvent>,
    run_id: &str,
    step: u32,
) -> Option<StepState> {
    let events = chronological(
        events
            .into_iter()
            .filter(|e| e.run_id() == Some(run_id) && e.step() == Some(step)),
    );

    let started = events.iter().find_map(|e| match e {
        ReplayEvent::StepStarted { timestamp, .. } => Some(*timestamp),
        _ => None,
    })?;

    let completed = events.iter().find_map(|e| match e {
        ReplayEvent::StepCompleted {
            result, timestamp, ..
        } => Some((result.clone(), *timestamp)),
        _ => None,
    });
    let failed = events.iter().find_map(|e| match e {
        ReplayEvent::StepFailed {
            error, timestamp, ..
        } => Some((error.clone(), *timestamp)),
        _ => None,
    });

    let mut attempts: Vec<Attempt> = Vec::new();
    for event in &events {
        match event {
            ReplayEvent::StepStarted { timestamp, .. }
            | ReplayEvent::StepRetried { timestamp, .. }
            | ReplayEvent::StepRecovered { timestamp, .. } => attempts.push(Attempt {
                on: *timestamp,
                error: None,
            }),
            ReplayEvent::StepError { error, .. } => {
                if let Some(open) = attempts.last_mut().filter(|a| a.error.is_none()) {
                    open.error = Some(error.clone());
                }
            }
            _ => {}
        }
    }

    let latest_interruption = events.iter().rev().find(|e| {
        matches!(
            e,
            ReplayEvent::StepInterrupted { .. } | ReplayEvent::StepRecovered { .. }
        )
    });

    let status = if completed.is_some() {
        StepStatus::Completed
    } else if failed.is_some() {
        StepStatus::Failed
    } else if matches!(latest_interruption, Some(ReplayEvent::StepInterrupted { .. })) {
        StepStatus::Interrupted
    } else if attempts.last().is_some_and(|a| a.error.is_some()) {
        StepStatus::Error
    } else {
        StepStatus::Running
    };

    let finished = completed
        .as_ref()
        .map(|(_, at)| *at)
        .or(failed.as_ref().map(|(_, at)| *at));

    Some(StepState {
        run_id: run_id.to_string(),
        step,
        status,
        started,
        finished,
        attempts,
        result: completed.map(|(result, _)| result),
        error: failed.map(|(error, _)| error),
    })
}

/// Runs bound to `token`, oldest binding first
pub fn hook_bindings<'a>(
    events: impl IntoIterator<Item = &'a ReplayEvent>,
    token: &str,
) -> Vec<HookBinding> {
    chronological(events)
        .into_iter()
        .filter_map(|e| match e {
            ReplayEvent::HookBound {
                hook_id,
                token: t,
                run_id,
                timestamp,
            } if t == token => Some(HookBinding {
                run_id: run_id.clone(),
                hook_id: hook_id.clone(),
                on: *timestamp,
            }),
            _ => None,
        })
        .collect()
}

/// Values delivered to `token`, oldest first
pub fn hook_triggers<'a>(
    events: impl IntoIterator<Item = &'a ReplayEvent>,
    token: &str,
) -> Vec<HookTrigger> {
    chronological(events)
        .into_iter()
        .filter_map(|e| match e {
            ReplayEvent::HookTriggered {
                token: t,
                value,
                timestamp,
            } if t == token => Some(HookTrigger {
                value: value.clone(),
                on: *timestamp,
            }),
            _ => None,
        })
        .collect()
}

/// Whether `run_id` is bound to `token`
pub fn is_hook_bound<'a>(
    events: impl IntoIterator<Item = &'a ReplayEvent>,
    token: &str,
    run_id: &str,
) -> bool {
    events.into_iter().any(|e| {
        matches!(e, ReplayEvent::HookBound { token: t, run_id: r, .. } if t == token && r == run_id)
    })
}

/// States of every run without a terminal event, oldest first
pub fn pending_runs<'a, I>(events: I) -> Vec<RunState>
where
    I: IntoIterator<Item = &'a ReplayEvent> + Clone,
{
    let mut seen = HashSet::new();
    let run_ids: Vec<String> = chronological(events.clone())
        .into_iter()
        .filter_map(|e| match e {
            ReplayEvent::RunStarted { run_id, .. } if seen.insert(run_id.clone()) => {
                Some(run_id.clone())
            }
            _ => None,
        })
        .collect();

    run_ids
        .iter()
        .filter_map(|run_id| derive_run_state(events.clone(), run_id))
        .filter(|state| !state.status.is_terminal())
        .collect()
}

/// States of every step of `run_id` without a terminal event, by step number
pub fn pending_steps<'a, I>(events: I, run_id: &str) -> Vec<StepState>
where
    I: IntoIterator<Item = &'a ReplayEvent> + Clone,
{
    let mut steps: Vec<u32> = events
        .clone()
        .into_iter()
        .filter(|e| matches!(e, ReplayEvent::StepStarted { run_id: r, .. } if r == run_id))
        .filter_map(|e| e.step())
        .collect();
    steps.sort_unstable();
    steps.dedup();

    steps
        .into_iter()
        .filter_map(|step| derive_step_state(events.clone(), run_id, step))
        .filter(|state| !state.status.is_terminal())
        .collect()
}

/// Recorded settlement order of `run_id`.
///
/// Includes the first terminal event of each step of the run and every trigger
/// of every token the run is bound to, sorted by timestamp.
pub fn settlements<'a, I>(events: I, run_id: &str) -> Vec<Settlement>
where
    I: IntoIterator<Item = &'a ReplayEvent> + Clone,
{
    let events = chronological(events);

    let tokens: HashSet<&str> = events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::HookBound {
                token, run_id: r, ..
            } if r == run_id => Some(token.as_str()),
            _ => None,
        })
        .collect();

    let mut settled_steps = HashSet::new();
    let mut trigger_counts: std::collections::HashMap<&str, usize> = Default::default();
    let mut order = Vec::new();

    for event in &events {
        match event {
            ReplayEvent::StepCompleted {
                run_id: r,
                step,
                timestamp,
                ..
            }
            | ReplayEvent::StepFailed {
                run_id: r,
                step,
                timestamp,
                ..
            } if r == run_id && settled_steps.insert(*step) => {
                order.push(Settlement {
                    key: SettleKey::Step(*step),
                    on: *timestamp,
                });
            }
            ReplayEvent::HookTriggered {
                token, timestamp, ..
            } if tokens.contains(token.as_str()) => {
                let index = trigger_counts.entry(token.as_str()).or_insert(0);
                order.push(Settlement {
                    key: SettleKey::Hook {
                        token: token.clone(),
                        index: *index,
                    },
                    on: *timestamp,
                });
                *index += 1;
            }
            _ => {}
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn step_event(kind: &str, step: u32, millis: i64) -> ReplayEvent {
        let run_id = "r".to_string();
        let timestamp = at(millis);
        match kind {
            "started" => ReplayEvent::StepStarted { run_id, step, timestamp },
            "retried" => ReplayEvent::StepRetried { run_id, step, timestamp },
            "recovered" => ReplayEvent::StepRecovered { run_id, step, timestamp },
            "interrupted" => ReplayEvent::StepInterrupted { run_id, step, timestamp },
            "error" => ReplayEvent::StepError {
                run_id,
                step,
                timestamp,
                error: Failure::new(format!("boom@{}", millis)),
            },
            "completed" => ReplayEvent::StepCompleted {
                run_id,
                step,
                timestamp,
                result: json!(millis),
            },
            other => panic!("unknown kind {}", other),
        }
    }

    #[test]
    fn test_step_attempts_pair_errors_with_their_start() {
        let events = vec![
            step_event("error", 1, 2),
            step_event("started", 1, 1),
            step_event("retried", 1, 3),
            step_event("error", 1, 4),
            step_event("retried", 1, 5),
        ];

        let state = derive_step_state(&events, "r", 1).unwrap();
        assert_eq!(state.status, StepStatus::Running);
        assert_eq!(state.attempts.len(), 3);
        assert_eq!(state.attempts[0].on, at(1));
        assert_eq!(state.attempts[0].error.as_ref().unwrap().message, "boom@2");
        assert_eq!(state.attempts[1].error.as_ref().unwrap().message, "boom@4");
        assert!(state.attempts[2].error.is_none());
    }

    #[test]
    fn test_step_status_error_then_completed() {
        let mut events = vec![step_event("started", 1, 1), step_event("error", 1, 2)];
        assert_eq!(
            derive_step_state(&events, "r", 1).unwrap().status,
            StepStatus::Error
        );

        events.push(step_event("started", 1, 3));
        events.push(step_event("completed", 1, 4));
        let state = derive_step_state(&events, "r", 1).unwrap();
        assert_eq!(state.status, StepStatus::Completed);
        assert_eq!(state.result, Some(json!(4)));
        assert_eq!(state.finished, Some(at(4)));
    }

    #[test]
    fn test_step_interruption_and_recovery() {
        let mut events = vec![
            step_event("started", 1, 1),
            step_event("interrupted", 1, 2),
        ];
        assert_eq!(
            derive_step_state(&events, "r", 1).unwrap().status,
            StepStatus::Interrupted
        );

        events.push(step_event("recovered", 1, 3));
        let state = derive_step_state(&events, "r", 1).unwrap();
        assert_eq!(state.status, StepStatus::Running);
        assert_eq!(state.attempts.len(), 2);
    }

    #[test]
    fn test_step_without_start_does_not_exist() {
        let events = vec![step_event("error", 1, 2)];
        assert!(derive_step_state(&events, "r", 1).is_none());
        assert!(derive_step_state(&events, "r", 2).is_none());
    }

    #[test]
    fn test_run_interrupted_is_overridden_by_recovery() {
        let events = vec![
            ReplayEvent::RunStarted {
                run_id: "r".to_string(),
                timestamp: at(1),
                replayable_id: "x".to_string(),
                args: Value::Null,
                source: None,
            },
            ReplayEvent::RunInterrupted {
                run_id: "r".to_string(),
                timestamp: at(2),
            },
        ];
        assert_eq!(
            derive_run_state(&events, "r").unwrap().status,
            RunStatus::Interrupted
        );

        let mut events = events;
        events.push(ReplayEvent::RunRecovered {
            run_id: "r".to_string(),
            timestamp: at(3),
            source: None,
        });
        assert_eq!(
            derive_run_state(&events, "r").unwrap().status,
            RunStatus::Running
        );
    }

    #[test]
    fn test_settlements_merge_steps_and_bound_triggers() {
        let events = vec![
            ReplayEvent::HookBound {
                hook_id: "confirm".to_string(),
                token: "tok".to_string(),
                run_id: "r".to_string(),
                timestamp: at(1),
            },
            step_event("started", 1, 2),
            step_event("started", 2, 3),
            step_event("completed", 2, 5),
            ReplayEvent::HookTriggered {
                token: "tok".to_string(),
                timestamp: at(4),
                value: json!(64),
            },
            ReplayEvent::HookTriggered {
                token: "other".to_string(),
                timestamp: at(6),
                value: json!(1),
            },
            step_event("completed", 1, 7),
        ];

        let keys: Vec<SettleKey> = settlements(&events, "r").into_iter().map(|s| s.key).collect();
        assert_eq!(
            keys,
            vec![
                SettleKey::Hook {
                    token: "tok".to_string(),
                    index: 0
                },
                SettleKey::Step(2),
                SettleKey::Step(1),
            ]
        );
    }
}
