//! Steps
//!
//! A step is an idempotent unit of work inside a run. The first pass that
//! reaches a step starts it on a background task and suspends; later passes
//! either keep waiting (still running) or get the recorded outcome back
//! without running anything.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::{RunContext, StepContext};
use crate::driver::{Engine, StepGuard};
use crate::error::{Failure, FailureKind, Halt, Outcome, PendingSignal, Result, StepError};
use crate::log::event::{self, ReplayEvent, ResumptionSource};
use crate::log::{SettleKey, StepState, StepStatus};
use crate::retry::RetryPolicy;
use crate::sequencer::Ticket;

/// Per-call step settings
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Overrides the engine-wide retry policy
    pub retry: Option<RetryPolicy>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Where a step stands at the start of a pass
enum Lookup {
    Settled(Outcome<Value>),
    Running,
    Start { recovering: bool, prior_attempts: u32 },
}

fn lookup(state: Option<StepState>) -> Lookup {
    match state {
        None => Lookup::Start {
            recovering: false,
            prior_attempts: 0,
        },
        Some(state) => match state.status {
            StepStatus::Completed => Lookup::Settled(Ok(state.result.unwrap_or(Value::Null))),
            StepStatus::Failed => Lookup::Settled(Err(Halt::Failed(
                state.error.unwrap_or_else(|| Failure::new("step failed")),
            ))),
            StepStatus::Running => Lookup::Running,
            StepStatus::Error | StepStatus::Interrupted => Lookup::Start {
                recovering: state.status == StepStatus::Interrupted,
                prior_attempts: state.attempts.len() as u32,
            },
        },
    }
}

/// Replay a recorded outcome once its turn comes up
async fn replay<T: DeserializeOwned>(ticket: Option<Ticket>, recorded: Outcome<Value>) -> Outcome<T> {
    if let Some(ticket) = ticket {
        ticket.turn().await;
    }
    let value = recorded?;
    Ok(serde_json::from_value(value)?)
}

fn start_event(run_id: &str, step: u32, recovering: bool) -> ReplayEvent {
    let run_id = run_id.to_string();
    let timestamp = event::now();
    if recovering {
        ReplayEvent::StepRecovered {
            run_id,
            step,
            timestamp,
        }
    } else {
        ReplayEvent::StepStarted {
            run_id,
            step,
            timestamp,
        }
    }
}

impl RunContext {
    /// Run `f` as the next step of this run, with the engine's retry policy.
    ///
    /// The step number is taken when the future is created, so creation order
    /// must be the same on every pass. Nothing runs until it is awaited.
    pub fn step<T, F, Fut>(
        &self,
        f: F,
    ) -> impl Future<Output = Outcome<T>> + Send + 'static + use<T, F, Fut>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.step_with(StepOptions::default(), f)
    }

    /// [`step`](Self::step) with per-call options
    pub fn step_with<T, F, Fut>(
        &self,
        options: StepOptions,
        f: F,
    ) -> impl Future<Output = Outcome<T>> + Send + 'static + use<T, F, Fut>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ctx = self.clone();
        let step = self.next_step();

        async move {
            ctx.ensure_active("step")?;
            let ticket = ctx.sequencer().ticket(&SettleKey::Step(step));
            let log = ctx.log();
            let pending = || {
                Halt::Pending(PendingSignal::Step {
                    replayable_id: ctx.replayable_id().to_string(),
                    run_id: ctx.run_id().to_string(),
                    step,
                })
            };

            match lookup(log.step_state(ctx.run_id(), step).await?) {
                // Settled after this pass began: the settling task wakes the run
                Lookup::Settled(_) if ticket.is_none() => Err(pending()),
                Lookup::Settled(recorded) => replay(ticket, recorded).await,
                Lookup::Running => {
                    drop(ticket);
                    tokio::task::yield_now().await;
                    Err(pending())
                }
                Lookup::Start {
                    recovering,
                    prior_attempts,
                } => {
                    drop(ticket);
                    log.log(vec![start_event(ctx.run_id(), step, recovering)])
                        .await?;
                    tracing::debug!(run_id = %ctx.run_id(), step, recovering, "Step started");

                    let policy = options
                        .retry
                        .unwrap_or_else(|| ctx.engine().retry_policy().clone());
                    let attempts = Attempts {
                        engine: ctx.engine().clone(),
                        run_id: ctx.run_id().to_string(),
                        replayable_id: ctx.replayable_id().to_string(),
                        step,
                        policy,
                        first_attempt: prior_attempts + 1,
                        _guard: ctx.engine().track_step(ctx.run_id(), step),
                    };
                    tokio::spawn(attempts.run(f));

                    Err(pending())
                }
            }
        }
    }

    /// Run `f` inline as the next step of this run: a single attempt, and any
    /// error fails the step.
    pub fn once<T, F, Fut>(
        &self,
        f: F,
    ) -> impl Future<Output = Outcome<T>> + Send + 'static + use<T, F, Fut>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ctx = self.clone();
        let step = self.next_step();

        async move {
            ctx.ensure_active("once")?;
            let ticket = ctx.sequencer().ticket(&SettleKey::Step(step));
            let log = ctx.log();

            let (recovering, prior_attempts) = match lookup(log.step_state(ctx.run_id(), step).await?) {
                Lookup::Settled(recorded) => return replay(ticket, recorded).await,
                Lookup::Running => {
                    return Err(Halt::Pending(PendingSignal::Step {
                        replayable_id: ctx.replayable_id().to_string(),
                        run_id: ctx.run_id().to_string(),
                        step,
                    }));
                }
                Lookup::Start {
                    recovering,
                    prior_attempts,
                } => (recovering, prior_attempts),
            };
            drop(ticket);

            log.log(vec![start_event(ctx.run_id(), step, recovering)])
                .await?;

            let scope = StepContext {
                run_id: ctx.run_id().to_string(),
                replayable_id: ctx.replayable_id().to_string(),
                step,
                attempt: prior_attempts + 1,
            };
            let outcome = scope
                .scope(f())
                .await
                .map_err(|err| StepError::classify(&err).failure().clone())
                .and_then(|value| {
                    serde_json::to_value(&value)
                        .map(|json| (value, json))
                        .map_err(|e| Failure::new(e.to_string()).with_kind(FailureKind::Serialization))
                });

            match outcome {
                Ok((value, result)) => {
                    log.log(vec![ReplayEvent::StepCompleted {
                        run_id: ctx.run_id().to_string(),
                        step,
                        timestamp: event::now(),
                        result,
                    }])
                    .await?;
                    Ok(value)
                }
                Err(error) => {
                    tracing::warn!(run_id = %ctx.run_id(), step, error = %error, "Once step failed");
                    log.log(vec![ReplayEvent::StepFailed {
                        run_id: ctx.run_id().to_string(),
                        step,
                        timestamp: event::now(),
                        error: error.clone(),
                    }])
                    .await?;
                    Err(Halt::Failed(error))
                }
            }
        }
    }
}

/// Attempt loop of one step, run on its own task
struct Attempts {
    engine: Engine,
    run_id: String,
    replayable_id: String,
    step: u32,
    policy: RetryPolicy,
    first_attempt: u32,
    _guard: StepGuard,
}

impl Attempts {
    async fn run<T, F, Fut>(self, mut f: F)
    where
        T: Serialize + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut attempt = self.first_attempt;

        let settled = loop {
            let scope = StepContext {
                run_id: self.run_id.clone(),
                replayable_id: self.replayable_id.clone(),
                step: self.step,
                attempt,
            };

            let error = match scope.scope(f()).await {
                Ok(value) => match serde_json::to_value(&value) {
                    Ok(result) => break self.complete(result).await,
                    Err(e) => StepError::Fatal(
                        Failure::new(e.to_string()).with_kind(FailureKind::Serialization),
                    ),
                },
                Err(err) => StepError::classify(&err),
            };

            match error {
                StepError::Fatal(failure) => break self.fail(vec![], failure).await,
                StepError::Transient {
                    failure,
                    retry_after,
                } => {
                    let errored = ReplayEvent::StepError {
                        run_id: self.run_id.clone(),
                        step: self.step,
                        timestamp: event::now(),
                        error: failure.clone(),
                    };

                    if !self.policy.allows_retry(attempt) {
                        let exhausted = Failure::new(format!(
                            "Step {} failed after {} attempts: {}",
                            self.step, attempt, failure.message
                        ))
                        .with_kind(FailureKind::RetriesExhausted);
                        break self.fail(vec![errored], exhausted).await;
                    }

                    let delay = retry_after.unwrap_or_else(|| self.policy.delay_for_attempt(attempt));
                    tracing::warn!(
                        run_id = %self.run_id,
                        step = self.step,
                        attempt,
                        error = %failure,
                        ?delay,
                        "Step attempt failed, retrying"
                    );

                    let retried = ReplayEvent::StepRetried {
                        run_id: self.run_id.clone(),
                        step: self.step,
                        timestamp: event::now(),
                    };
                    if let Err(e) = self.engine.log().log(vec![errored, retried]).await {
                        break Err(e);
                    }

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        match settled {
            Ok(source) => {
                if let Err(e) = self.engine.wake(&self.run_id, Some(source)).await {
                    tracing::warn!(run_id = %self.run_id, step = self.step, error = %e, "Failed to resume run after step settled");
                }
            }
            Err(e) => {
                tracing::error!(run_id = %self.run_id, step = self.step, error = %e, "Failed to record step outcome");
                self.engine.abandon(&self.run_id, e.into()).await;
            }
        }
    }

    async fn complete(&self, result: Value) -> Result<ResumptionSource> {
        let completed = ReplayEvent::StepCompleted {
            run_id: self.run_id.clone(),
            step: self.step,
            timestamp: event::now(),
            result: result.clone(),
        };
        self.engine.log().log(vec![completed]).await?;
        tracing::debug!(run_id = %self.run_id, step = self.step, "Step completed");
        Ok(ResumptionSource::StepCompleted {
            step: self.step,
            result,
        })
    }

    async fn fail(&self, mut events: Vec<ReplayEvent>, failure: Failure) -> Result<ResumptionSource> {
        events.push(ReplayEvent::StepFailed {
            run_id: self.run_id.clone(),
            step: self.step,
            timestamp: event::now(),
            error: failure.clone(),
        });
        self.engine.log().log(events).await?;
        tracing::warn!(run_id = %self.run_id, step = self.step, error = %failure, "Step failed");
        Ok(ResumptionSource::StepFailed {
            step: self.step,
            error: failure,
        })
    }
}
