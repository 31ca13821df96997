//! Error types for Encore operations
//!
//! Four layers, from the inside out:
//!
//! - [`StepError`] classifies what a step function returned when it failed:
//!   fatal ([`Fatal`]) or transient (anything else, optionally [`RetryAfter`]).
//! - [`Failure`] is the serializable record of an error. It is what gets written
//!   into `step:error`, `step:failed` and `run:failed` events and what failure
//!   listeners receive.
//! - [`Halt`] is the non-ready half of an [`Outcome`]: a run either cannot make
//!   progress yet ([`Halt::Pending`]) or has hit a failure ([`Halt::Failed`]).
//! - [`EncoreError`] covers engine-level problems (storage, configuration,
//!   programming errors such as out-of-context calls).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Result type for Encore operations
pub type Result<T> = std::result::Result<T, EncoreError>;

/// Engine-level error types
#[derive(Debug, thiserror::Error)]
pub enum EncoreError {
    /// Event log backend failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was invoked outside the scope it requires
    #[error("Out of context execution: {0}")]
    OutOfContext(String),

    /// No replayable registered under this name
    #[error("Replayable {0} is not registered")]
    UnregisteredReplayable(String),

    /// Run does not exist in the log
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for EncoreError {
    fn from(s: String) -> Self {
        EncoreError::Other(s)
    }
}

impl From<&str> for EncoreError {
    fn from(s: &str) -> Self {
        EncoreError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for EncoreError {
    fn from(err: anyhow::Error) -> Self {
        EncoreError::Other(err.to_string())
    }
}

/// Classification of a recorded failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Raised by application code (a step function or the replayable body)
    #[default]
    Application,

    /// Step kept failing transiently until the retry policy gave up
    RetriesExhausted,

    /// A recorded value could not be decoded into the requested type
    Serialization,

    /// Operation used outside of its scope
    OutOfContext,

    /// Replayable not registered
    Unregistered,

    /// Event log backend failed
    Storage,
}

/// Serializable record of an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct Failure {
    /// Human readable message
    pub message: String,

    /// Error classification
    #[serde(default)]
    pub kind: FailureKind,
}

impl Failure {
    /// Application failure with the given message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Application,
        }
    }

    /// Set the failure kind
    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = kind;
        self
    }
}

impl From<EncoreError> for Failure {
    fn from(err: EncoreError) -> Self {
        let kind = match &err {
            EncoreError::Storage(_) | EncoreError::Io(_) => FailureKind::Storage,
            EncoreError::Serialization(_) => FailureKind::Serialization,
            EncoreError::OutOfContext(_) => FailureKind::OutOfContext,
            EncoreError::UnregisteredReplayable(_) => FailureKind::Unregistered,
            _ => FailureKind::Application,
        };
        Failure {
            message: err.to_string(),
            kind,
        }
    }
}

/// Marks a step error as non-retryable
///
/// ```rust,ignore
/// return Err(Fatal::new(anyhow!("card declined")).into());
/// ```
#[derive(Debug)]
pub struct Fatal(pub anyhow::Error);

impl Fatal {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Fatal(err.into())
    }
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for Fatal {}

/// Transient step error that asks to be retried after a specific delay
#[derive(Debug)]
pub struct RetryAfter {
    pub delay: Duration,
    pub error: anyhow::Error,
}

impl RetryAfter {
    pub fn new(delay: Duration, err: impl Into<anyhow::Error>) -> Self {
        Self {
            delay,
            error: err.into(),
        }
    }
}

impl fmt::Display for RetryAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.error)
    }
}

impl std::error::Error for RetryAfter {}

/// How the step engine treats an error raised by a step function
#[derive(Debug, Clone, PartialEq)]
pub enum StepError {
    /// Not retried; the step fails immediately
    Fatal(Failure),

    /// Retried according to the retry policy, or after `retry_after` when set
    Transient {
        failure: Failure,
        retry_after: Option<Duration>,
    },
}

impl StepError {
    /// Classify an error returned by a step function.
    ///
    /// Errors wrapped in [`Fatal`] are fatal, errors wrapped in [`RetryAfter`]
    /// carry their own delay, everything else is transient.
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(fatal) = err.downcast_ref::<Fatal>() {
            return StepError::Fatal(Failure::new(fatal.to_string()));
        }
        if let Some(retry) = err.downcast_ref::<RetryAfter>() {
            return StepError::Transient {
                failure: Failure::new(retry.to_string()),
                retry_after: Some(retry.delay),
            };
        }
        StepError::Transient {
            failure: Failure::new(format!("{:#}", err)),
            retry_after: None,
        }
    }

    /// Whether this error must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Fatal(_))
    }

    /// Record of this error
    pub fn failure(&self) -> &Failure {
        match self {
            StepError::Fatal(failure) => failure,
            StepError::Transient { failure, .. } => failure,
        }
    }
}

/// Why an operation cannot settle in the current pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingSignal {
    /// A step attempt is in flight
    Step {
        replayable_id: String,
        run_id: String,
        step: u32,
    },

    /// A hook has no unconsumed trigger yet
    Hook { hook_id: String },

    /// A composition whose children are all pending
    Aggregate(Vec<PendingSignal>),
}

impl PendingSignal {
    /// Collapse a list of signals into one
    pub fn aggregate(mut signals: Vec<PendingSignal>) -> Self {
        if signals.len() == 1 {
            signals.remove(0)
        } else {
            PendingSignal::Aggregate(signals)
        }
    }
}

impl fmt::Display for PendingSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingSignal::Step {
                replayable_id,
                run_id,
                step,
            } => write!(
                f,
                "Step {} of replayable {} (run {}) is still pending",
                step, replayable_id, run_id
            ),
            PendingSignal::Hook { hook_id } => write!(f, "Hook {} is still pending", hook_id),
            PendingSignal::Aggregate(signals) => {
                write!(f, "{} operations are still pending", signals.len())
            }
        }
    }
}

/// An outcome that is not ready
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Halt {
    /// Suspension marker, never an error
    #[error("{0}")]
    Pending(PendingSignal),

    /// Terminal failure of the operation
    #[error("{0}")]
    Failed(Failure),
}

impl Halt {
    /// Whether this is a suspension rather than a failure
    pub fn is_pending(&self) -> bool {
        matches!(self, Halt::Pending(_))
    }
}

impl From<Failure> for Halt {
    fn from(failure: Failure) -> Self {
        Halt::Failed(failure)
    }
}

impl From<EncoreError> for Halt {
    fn from(err: EncoreError) -> Self {
        Halt::Failed(err.into())
    }
}

impl From<serde_json::Error> for Halt {
    fn from(err: serde_json::Error) -> Self {
        Halt::Failed(EncoreError::Serialization(err).into())
    }
}

/// Tagged result of a step, hook or replayable body
pub type Outcome<T> = std::result::Result<T, Halt>;

/// Explicit three-way view of an [`Outcome`]
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<T> {
    Ready(T),
    Pending(PendingSignal),
    Failed(Failure),
}

impl<T> From<Outcome<T>> for Settled<T> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Ok(value) => Settled::Ready(value),
            Err(Halt::Pending(signal)) => Settled::Pending(signal),
            Err(Halt::Failed(failure)) => Settled::Failed(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_step_errors() {
        let plain = anyhow::anyhow!("connection reset");
        let class = StepError::classify(&plain);
        assert!(!class.is_fatal());
        assert_eq!(class.failure().message, "connection reset");

        let fatal: anyhow::Error = Fatal::new(anyhow::anyhow!("card declined")).into();
        assert!(StepError::classify(&fatal).is_fatal());

        let retry: anyhow::Error =
            RetryAfter::new(Duration::from_secs(5), anyhow::anyhow!("rate limited")).into();
        assert_eq!(
            StepError::classify(&retry),
            StepError::Transient {
                failure: Failure::new("rate limited"),
                retry_after: Some(Duration::from_secs(5)),
            }
        );
    }

    #[test]
    fn test_failure_kind_from_engine_error() {
        let failure: Failure = EncoreError::OutOfContext("step scope".to_string()).into();
        assert_eq!(failure.kind, FailureKind::OutOfContext);
        assert!(failure.message.contains("Out of context"));

        let failure: Failure = EncoreError::UnregisteredReplayable("r".to_string()).into();
        assert_eq!(failure.kind, FailureKind::Unregistered);
        assert_eq!(failure.message, "Replayable r is not registered");
    }

    #[test]
    fn test_aggregate_of_one_collapses() {
        let signal = PendingSignal::Hook {
            hook_id: "confirm".to_string(),
        };
        assert_eq!(PendingSignal::aggregate(vec![signal.clone()]), signal);

        let both = PendingSignal::aggregate(vec![signal.clone(), signal]);
        assert!(matches!(both, PendingSignal::Aggregate(ref v) if v.len() == 2));
    }

    #[test]
    fn test_settled_view() {
        let ready: Settled<i32> = Ok(4).into();
        assert_eq!(ready, Settled::Ready(4));

        let failed: Settled<i32> = Err(Halt::Failed(Failure::new("boom"))).into();
        assert!(matches!(failed, Settled::Failed(f) if f.message == "boom"));
    }

    #[test]
    fn test_failure_serialization_defaults_kind() {
        let failure: Failure = serde_json::from_str(r#"{"message":"x"}"#).unwrap();
        assert_eq!(failure.kind, FailureKind::Application);
    }
}
