//! Replay event types
//!
//! Every event is immutable and timestamped. The log is append-only; all run,
//! step and hook state is derived from these events (see [`super::state`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::Failure;

/// Why a paused or interrupted run is being played again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResumptionSource {
    /// A step of the run settled
    #[serde(rename = "step:completed")]
    StepCompleted { step: u32, result: Value },

    /// A step of the run failed for good
    #[serde(rename = "step:failed")]
    StepFailed { step: u32, error: Failure },

    /// A hook the run is bound to received a value
    #[serde(rename = "hook:triggered")]
    HookTriggered { token: String, value: Value },

    /// Crash-recovery sweep
    #[serde(rename = "recovery")]
    Recovery,
}

/// Event stored in the replay log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplayEvent {
    #[serde(rename = "run:started")]
    RunStarted {
        run_id: String,
        timestamp: DateTime<Utc>,
        replayable_id: String,
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ResumptionSource>,
    },

    #[serde(rename = "run:paused")]
    RunPaused {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "run:resumed")]
    RunResumed {
        run_id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ResumptionSource>,
    },

    #[serde(rename = "run:recovered")]
    RunRecovered {
        run_id: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ResumptionSource>,
    },

    #[serde(rename = "run:completed")]
    RunCompleted {
        run_id: String,
        timestamp: DateTime<Utc>,
        result: Value,
    },

    #[serde(rename = "run:failed")]
    RunFailed {
        run_id: String,
        timestamp: DateTime<Utc>,
        error: Failure,
    },

    #[serde(rename = "run:interrupted")]
    RunInterrupted {
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "step:started")]
    StepStarted {
        run_id: String,
        step: u32,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "step:retried")]
    StepRetried {
        run_id: String,
        step: u32,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "step:recovered")]
    StepRecovered {
        run_id: String,
        step: u32,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "step:error")]
    StepError {
        run_id: String,
        step: u32,
        timestamp: DateTime<Utc>,
        error: Failure,
    },

    #[serde(rename = "step:completed")]
    StepCompleted {
        run_id: String,
        step: u32,
        timestamp: DateTime<Utc>,
        result: Value,
    },

    #[serde(rename = "step:failed")]
    StepFailed {
        run_id: String,
        step: u32,
        timestamp: DateTime<Utc>,
        error: Failure,
    },

    #[serde(rename = "step:interrupted")]
    StepInterrupted {
        run_id: String,
        step: u32,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "hook:bound")]
    HookBound {
        hook_id: String,
        token: String,
        run_id: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "hook:triggered")]
    HookTriggered {
        token: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        value: Value,
    },
}

impl ReplayEvent {
    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ReplayEvent::RunStarted { timestamp, .. }
            | ReplayEvent::RunPaused { timestamp, .. }
            | ReplayEvent::RunResumed { timestamp, .. }
            | ReplayEvent::RunRecovered { timestamp, .. }
            | ReplayEvent::RunCompleted { timestamp, .. }
            | ReplayEvent::RunFailed { timestamp, .. }
            | ReplayEvent::RunInterrupted { timestamp, .. }
            | ReplayEvent::StepStarted { timestamp, .. }
            | ReplayEvent::StepRetried { timestamp, .. }
            | ReplayEvent::StepRecovered { timestamp, .. }
            | ReplayEvent::StepError { timestamp, .. }
            | ReplayEvent::StepCompleted { timestamp, .. }
            | ReplayEvent::StepFailed { timestamp, .. }
            | ReplayEvent::StepInterrupted { timestamp, .. }
            | ReplayEvent::HookBound { timestamp, .. }
            | ReplayEvent::HookTriggered { timestamp, .. } => *timestamp,
        }
    }

    /// Run the event belongs to (hook triggers belong to no run)
    pub fn run_id(&self) -> Option<&str> {
        match self {
            ReplayEvent::RunStarted { run_id, .. }
            | ReplayEvent::RunPaused { run_id, .. }
            | ReplayEvent::RunResumed { run_id, .. }
            | ReplayEvent::RunRecovered { run_id, .. }
            | ReplayEvent::RunCompleted { run_id, .. }
            | ReplayEvent::RunFailed { run_id, .. }
            | ReplayEvent::RunInterrupted { run_id, .. }
            | ReplayEvent::StepStarted { run_id, .. }
            | ReplayEvent::StepRetried { run_id, .. }
            | ReplayEvent::StepRecovered { run_id, .. }
            | ReplayEvent::StepError { run_id, .. }
            | ReplayEvent::StepCompleted { run_id, .. }
            | ReplayEvent::StepFailed { run_id, .. }
            | ReplayEvent::StepInterrupted { run_id, .. }
            | ReplayEvent::HookBound { run_id, .. } => Some(run_id),
            ReplayEvent::HookTriggered { .. } => None,
        }
    }

    /// Step number for step events
    pub fn step(&self) -> Option<u32> {
        match self {
            ReplayEvent::StepStarted { step, .. }
            | ReplayEvent::StepRetried { step, .. }
            | ReplayEvent::StepRecovered { step, .. }
            | ReplayEvent::StepError { step, .. }
            | ReplayEvent::StepCompleted { step, .. }
            | ReplayEvent::StepFailed { step, .. }
            | ReplayEvent::StepInterrupted { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Hook token for hook events
    pub fn token(&self) -> Option<&str> {
        match self {
            ReplayEvent::HookBound { token, .. } | ReplayEvent::HookTriggered { token, .. } => {
                Some(token)
            }
            _ => None,
        }
    }

    /// Wire name of the event type, e.g. `run:started`
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplayEvent::RunStarted { .. } => "run:started",
            ReplayEvent::RunPaused { .. } => "run:paused",
            ReplayEvent::RunResumed { .. } => "run:resumed",
            ReplayEvent::RunRecovered { .. } => "run:recovered",
            ReplayEvent::RunCompleted { .. } => "run:completed",
            ReplayEvent::RunFailed { .. } => "run:failed",
            ReplayEvent::RunInterrupted { .. } => "run:interrupted",
            ReplayEvent::StepStarted { .. } => "step:started",
            ReplayEvent::StepRetried { .. } => "step:retried",
            ReplayEvent::StepRecovered { .. } => "step:recovered",
            ReplayEvent::StepError { .. } => "step:error",
            ReplayEvent::StepCompleted { .. } => "step:completed",
            ReplayEvent::StepFailed { .. } => "step:failed",
            ReplayEvent::StepInterrupted { .. } => "step:interrupted",
            ReplayEvent::HookBound { .. } => "hook:bound",
            ReplayEvent::HookTriggered { .. } => "hook:triggered",
        }
    }

    /// Whether this is a run-level event
    pub fn is_run_event(&self) -> bool {
        self.type_name().starts_with("run:")
    }

    /// Whether this is a step-level event
    pub fn is_step_event(&self) -> bool {
        self.step().is_some()
    }

    /// Whether this is a hook event
    pub fn is_hook_event(&self) -> bool {
        self.token().is_some()
    }
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(i64::MIN);

/// Strictly increasing wall-clock timestamp (microsecond resolution).
///
/// Events issued by one process never share a timestamp, so the log order of
/// e.g. `step:error` and the `step:retried` that follows it is never ambiguous.
pub fn now() -> DateTime<Utc> {
    let wall = Utc::now().timestamp_micros();
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last.saturating_add(1));
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
            Err(current) => last = current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_uses_colon_type_names() {
        let event = ReplayEvent::StepCompleted {
            run_id: "r1".to_string(),
            step: 2,
            timestamp: now(),
            result: json!(42),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "step:completed");
        assert_eq!(value["run_id"], "r1");
        assert_eq!(value["step"], 2);
        assert_eq!(value["result"], 42);

        let parsed: ReplayEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.type_name(), "step:completed");
    }

    #[test]
    fn test_resumption_source_round_trips_inside_event() {
        let event = ReplayEvent::RunResumed {
            run_id: "r1".to_string(),
            timestamp: now(),
            source: Some(ResumptionSource::HookTriggered {
                token: "abc".to_string(),
                value: json!({"ok": true}),
            }),
        };

        let text = serde_json::to_string(&event).unwrap();
        let parsed: ReplayEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_accessors() {
        let trigger = ReplayEvent::HookTriggered {
            token: "t".to_string(),
            timestamp: now(),
            value: Value::Null,
        };
        assert_eq!(trigger.run_id(), None);
        assert_eq!(trigger.token(), Some("t"));
        assert!(trigger.is_hook_event());
        assert!(!trigger.is_run_event());

        let paused = ReplayEvent::RunPaused {
            run_id: "r".to_string(),
            timestamp: now(),
        };
        assert!(paused.is_run_event());
        assert_eq!(paused.step(), None);
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let stamps: Vec<_> = (0..1000).map(|_| now()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }
}
