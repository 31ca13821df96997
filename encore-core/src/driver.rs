//! Run driver
//!
//! The [`Engine`] plays runs: it logs the opening event of a pass, runs the
//! replayable body from the top, and turns the body's outcome into
//! `run:completed`, `run:failed` or `run:paused`. Paused runs are played again
//! when one of their steps settles or a hook they are bound to is triggered.
//!
//! An engine only plays a run it owns. Ownership is claimed in-process when a
//! pass is scheduled and released when the pass ends, so two wake-ups racing
//! for the same paused run never play it twice; the loser leaves a wake
//! request that the owner honours once its pass is done.

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::EncoreConfig;
use crate::context::{ReplayContext, RunContext};
use crate::error::{EncoreError, Failure, Halt, Outcome, Result};
use crate::log::event::{self, ReplayEvent, ResumptionSource};
use crate::log::{EventLog, FileLog, MemoryLog, RunState, RunStatus, StepStatus};
use crate::notifier::{LocalNotifier, Notifier, Subscription};
use crate::registry::{Registry, ReplayableFn};
use crate::retry::RetryPolicy;
use crate::sequencer::Sequencer;

/// Durable execution engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    log: Arc<dyn EventLog>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    registry: RwLock<Registry>,
    /// Runs this process is currently playing
    active: Mutex<HashMap<String, ActiveRun>>,
    /// Step attempt loops running in this process
    in_flight: Mutex<HashSet<(String, u32)>>,
}

#[derive(Default)]
struct ActiveRun {
    wake_requested: bool,
    source: Option<ResumptionSource>,
}

/// What a wake-up did
#[derive(Debug)]
pub(crate) enum Wake {
    /// The run is being played; it will be played again when the pass ends
    Owned,
    /// A new pass was scheduled
    Played,
    /// The run already completed or failed
    Settled(RunState),
    /// The run is neither paused nor owned here
    Waiting(RunStatus),
}

enum PassEnd {
    Paused,
    Completed(Value),
    Failed(Failure),
    /// The log could not record the pass
    Aborted(Failure),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    /// Engine over the given replay context with the default retry policy
    pub fn new(context: ReplayContext) -> Self {
        Self::builder().context(context).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Engine configured from `config`: a file log when a path is set, memory otherwise
    pub fn from_config(config: &EncoreConfig) -> Result<Self> {
        config.validate()?;
        let log: Arc<dyn EventLog> = match &config.log.path {
            Some(path) => Arc::new(FileLog::open(path)?),
            None => Arc::new(MemoryLog::new()),
        };

        Ok(Self::builder()
            .log(log)
            .retry_policy(config.retry.clone())
            .build())
    }

    pub fn log(&self) -> Arc<dyn EventLog> {
        self.inner.log.clone()
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.inner.notifier.clone()
    }

    /// Retry policy used by steps without their own
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Names of every registered replayable
    pub fn registered(&self) -> Vec<String> {
        self.registry().names()
    }

    /// Whether this engine is currently playing `run_id`
    pub fn is_active(&self, run_id: &str) -> bool {
        lock(&self.inner.active).contains_key(run_id)
    }

    /// Current state of a run
    pub async fn run_state(&self, run_id: &str) -> Result<Option<RunState>> {
        self.inner.log.run_state(run_id).await
    }

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `body` under `name` and return a handle to start runs of it
    pub fn replayable<A, R, F, Fut>(&self, name: impl Into<String>, body: F) -> Replayable<A, R>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(RunContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<R>> + Send + 'static,
    {
        let name = name.into();
        let erased: ReplayableFn = Arc::new(move |ctx: RunContext, args: Value| {
            let run = serde_json::from_value::<A>(args).map(|args| body(ctx, args));
            async move {
                let result = run?.await?;
                Ok(serde_json::to_value(result)?)
            }
            .boxed()
        });

        self.inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(name.clone(), erased);
        tracing::debug!(replayable = %name, "Registered replayable");

        Replayable {
            name,
            engine: self.clone(),
            _marker: PhantomData,
        }
    }

    /// Start a new run of the replayable registered under `name`
    pub fn start(&self, name: &str, args: Value) -> Result<RunHandle<Value>> {
        self.start_as(name, args)
    }

    fn start_as<T>(&self, name: &str, args: Value) -> Result<RunHandle<T>> {
        if !self.registry().contains(name) {
            return Err(EncoreError::UnregisteredReplayable(name.to_string()));
        }

        let run_id = Uuid::new_v4().to_string();
        let handle = self.subscribe(&run_id);
        lock(&self.inner.active).insert(run_id.clone(), ActiveRun::default());
        self.spawn_drive(run_id, name.to_string(), args, None, None);

        Ok(handle)
    }

    /// Play a paused run again.
    ///
    /// The returned handle settles when the run completes or fails. A run that
    /// already settled yields a handle that is ready immediately.
    pub async fn resume(
        &self,
        run_id: &str,
        source: Option<ResumptionSource>,
    ) -> Result<RunHandle<Value>> {
        self.resume_as(run_id, source).await
    }

    async fn resume_as<T>(
        &self,
        run_id: &str,
        source: Option<ResumptionSource>,
    ) -> Result<RunHandle<T>> {
        let handle = self.subscribe(run_id);
        if let Wake::Settled(state) = self.wake(run_id, source).await? {
            handle.settle_from(&state);
        }
        Ok(handle)
    }

    /// Play `run_id` if it is paused, or ask its current owner to play it again
    pub(crate) async fn wake(
        &self,
        run_id: &str,
        source: Option<ResumptionSource>,
    ) -> Result<Wake> {
        {
            let mut active = lock(&self.inner.active);
            if let Some(run) = active.get_mut(run_id) {
                run.wake_requested = true;
                if source.is_some() {
                    run.source = source;
                }
                tracing::debug!(run_id = %run_id, "Run is being played, wake requested");
                return Ok(Wake::Owned);
            }
            active.insert(run_id.to_string(), ActiveRun::default());
        }

        let state = match self.inner.log.run_state(run_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                self.release(run_id);
                return Err(EncoreError::RunNotFound(run_id.to_string()));
            }
            Err(e) => {
                self.release(run_id);
                return Err(e);
            }
        };

        if state.status != RunStatus::Paused {
            self.release(run_id);
            return Ok(if state.status.is_terminal() {
                Wake::Settled(state)
            } else {
                Wake::Waiting(state.status)
            });
        }

        if !self.registry().contains(&state.replayable_id) {
            self.release(run_id);
            return Err(EncoreError::UnregisteredReplayable(state.replayable_id));
        }

        self.spawn_drive(
            state.run_id,
            state.replayable_id,
            state.args,
            Some(RunStatus::Paused),
            source,
        );
        Ok(Wake::Played)
    }

    /// Pick up runs left unfinished by a previous process.
    ///
    /// Running runs and the step attempts they had in flight are marked
    /// interrupted, then played again. Paused runs whose step attempts were
    /// lost are played again as well. Returns the ids of the runs scheduled.
    pub async fn recover(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();

        for run in self.inner.log.pending_runs().await? {
            if self.is_active(&run.run_id) {
                continue;
            }
            if !self.registry().contains(&run.replayable_id) {
                tracing::warn!(run_id = %run.run_id, replayable = %run.replayable_id, "Cannot recover run of unregistered replayable");
                continue;
            }

            let mut events = Vec::new();
            if run.status == RunStatus::Running {
                events.push(ReplayEvent::RunInterrupted {
                    run_id: run.run_id.clone(),
                    timestamp: event::now(),
                });
            }
            for step in self.inner.log.pending_steps(&run.run_id).await? {
                if step.status == StepStatus::Running && !self.is_in_flight(&run.run_id, step.step) {
                    events.push(ReplayEvent::StepInterrupted {
                        run_id: run.run_id.clone(),
                        step: step.step,
                        timestamp: event::now(),
                    });
                }
            }

            let prior = match run.status {
                RunStatus::Running | RunStatus::Interrupted => RunStatus::Interrupted,
                RunStatus::Paused if !events.is_empty() => RunStatus::Paused,
                _ => continue,
            };

            {
                let mut active = lock(&self.inner.active);
                if active.contains_key(&run.run_id) {
                    continue;
                }
                active.insert(run.run_id.clone(), ActiveRun::default());
            }

            if !events.is_empty() {
                if let Err(e) = self.inner.log.log(events).await {
                    self.release(&run.run_id);
                    return Err(e);
                }
            }

            tracing::info!(run_id = %run.run_id, replayable = %run.replayable_id, status = ?run.status, "Recovering run");
            recovered.push(run.run_id.clone());
            self.spawn_drive(
                run.run_id,
                run.replayable_id,
                run.args,
                Some(prior),
                Some(ResumptionSource::Recovery),
            );
        }

        Ok(recovered)
    }

    /// Fail a run whose events could not be recorded, so its waiters settle.
    ///
    /// Recording `run:failed` is attempted but may fail as well; listeners are
    /// notified either way.
    pub(crate) async fn abandon(&self, run_id: &str, failure: Failure) {
        let failed = ReplayEvent::RunFailed {
            run_id: run_id.to_string(),
            timestamp: event::now(),
            error: failure.clone(),
        };
        if let Err(e) = self.inner.log.log(vec![failed]).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to record run failure");
        }
        tracing::error!(run_id = %run_id, error = %failure, kind = ?failure.kind, "Run abandoned");
        self.inner.notifier.notify_failed(run_id, &failure);
    }

    fn release(&self, run_id: &str) {
        lock(&self.inner.active).remove(run_id);
    }

    pub(crate) fn track_step(&self, run_id: &str, step: u32) -> StepGuard {
        lock(&self.inner.in_flight).insert((run_id.to_string(), step));
        StepGuard {
            engine: self.clone(),
            run_id: run_id.to_string(),
            step,
        }
    }

    fn is_in_flight(&self, run_id: &str, step: u32) -> bool {
        lock(&self.inner.in_flight).contains(&(run_id.to_string(), step))
    }

    fn subscribe<T>(&self, run_id: &str) -> RunHandle<T> {
        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(sender)));

        let on_complete = sender.clone();
        let completed = self.inner.notifier.on_run_completed(
            run_id,
            Arc::new(move |result: &Value| {
                if let Some(sender) = lock(&on_complete).take() {
                    let _ = sender.send(Ok(result.clone()));
                }
            }),
        );
        let on_fail = sender.clone();
        let failed = self.inner.notifier.on_run_failed(
            run_id,
            Arc::new(move |error: &Failure| {
                if let Some(sender) = lock(&on_fail).take() {
                    let _ = sender.send(Err(error.clone()));
                }
            }),
        );

        RunHandle {
            run_id: run_id.to_string(),
            receiver,
            sender,
            _subscriptions: vec![completed, failed],
            _marker: PhantomData,
        }
    }

    fn spawn_drive(
        &self,
        run_id: String,
        replayable_id: String,
        args: Value,
        prior: Option<RunStatus>,
        source: Option<ResumptionSource>,
    ) {
        let span = tracing::info_span!("run", run_id = %run_id, replayable_id = %replayable_id);
        let engine = self.clone();
        tokio::spawn(
            async move {
                engine
                    .drive(run_id, replayable_id, args, prior, source)
                    .await
            }
            .instrument(span),
        );
    }

    async fn drive(
        &self,
        run_id: String,
        replayable_id: String,
        args: Value,
        mut prior: Option<RunStatus>,
        mut source: Option<ResumptionSource>,
    ) {
        loop {
            let end = match self
                .pass(&run_id, &replayable_id, &args, prior, source.take())
                .await
            {
                Ok(end) => end,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "Run pass aborted");
                    PassEnd::Aborted(e.into())
                }
            };

            // Release ownership before notifying so waiters that resume on
            // notification see a settled run instead of an owned one
            let again = {
                let mut active = lock(&self.inner.active);
                match (&end, active.get_mut(&run_id)) {
                    (PassEnd::Paused, Some(run)) if run.wake_requested => {
                        run.wake_requested = false;
                        Some(run.source.take())
                    }
                    _ => {
                        active.remove(&run_id);
                        None
                    }
                }
            };

            match end {
                PassEnd::Completed(result) => {
                    self.inner.notifier.notify_complete(&run_id, &result);
                }
                PassEnd::Failed(failure) => {
                    self.inner.notifier.notify_failed(&run_id, &failure);
                }
                PassEnd::Aborted(failure) => self.abandon(&run_id, failure).await,
                PassEnd::Paused => {}
            }

            match again {
                Some(next) => {
                    tracing::debug!(run_id = %run_id, "Woken during pass, playing again");
                    prior = Some(RunStatus::Paused);
                    source = next;
                }
                None => break,
            }
        }
    }

    async fn pass(
        &self,
        run_id: &str,
        replayable_id: &str,
        args: &Value,
        prior: Option<RunStatus>,
        source: Option<ResumptionSource>,
    ) -> Result<PassEnd> {
        let body = self.registry().get(replayable_id)?;
        let log = &self.inner.log;

        let run = run_id.to_string();
        let timestamp = event::now();
        let opening = match prior {
            None => ReplayEvent::RunStarted {
                run_id: run,
                timestamp,
                replayable_id: replayable_id.to_string(),
                args: args.clone(),
                source,
            },
            Some(RunStatus::Interrupted) => ReplayEvent::RunRecovered {
                run_id: run,
                timestamp,
                source,
            },
            Some(_) => ReplayEvent::RunResumed {
                run_id: run,
                timestamp,
                source,
            },
        };
        let opened = opening.type_name();
        log.log(vec![opening]).await?;
        tracing::info!(event = opened, "Playing run");

        let sequencer = Sequencer::new(log.settlements(run_id).await?);
        let ctx = RunContext::new(self.clone(), run_id, replayable_id, sequencer);
        let outcome = body(ctx.clone(), args.clone()).await;
        ctx.close();

        match outcome {
            Ok(result) => {
                log.log(vec![ReplayEvent::RunCompleted {
                    run_id: run_id.to_string(),
                    timestamp: event::now(),
                    result: result.clone(),
                }])
                .await?;
                tracing::info!(steps = ctx.step_count(), "Run completed");
                Ok(PassEnd::Completed(result))
            }
            Err(Halt::Pending(signal)) => {
                log.log(vec![ReplayEvent::RunPaused {
                    run_id: run_id.to_string(),
                    timestamp: event::now(),
                }])
                .await?;
                tracing::info!(waiting_on = %signal, "Run paused");
                Ok(PassEnd::Paused)
            }
            Err(Halt::Failed(failure)) => {
                log.log(vec![ReplayEvent::RunFailed {
                    run_id: run_id.to_string(),
                    timestamp: event::now(),
                    error: failure.clone(),
                }])
                .await?;
                tracing::error!(error = %failure, kind = ?failure.kind, "Run failed");
                Ok(PassEnd::Failed(failure))
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("retry", &self.inner.retry)
            .field("registry", &*self.registry())
            .field("active", &lock(&self.inner.active).len())
            .finish()
    }
}

/// Marks a step attempt loop as running in this process until dropped
pub(crate) struct StepGuard {
    engine: Engine,
    run_id: String,
    step: u32,
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        lock(&self.engine.inner.in_flight).remove(&(std::mem::take(&mut self.run_id), self.step));
    }
}

/// Builder for [`Engine`]
#[derive(Default)]
pub struct EngineBuilder {
    log: Option<Arc<dyn EventLog>>,
    notifier: Option<Arc<dyn Notifier>>,
    retry: RetryPolicy,
}

impl EngineBuilder {
    /// Set log and notifier from a replay context
    pub fn context(mut self, context: ReplayContext) -> Self {
        self.log = Some(context.log);
        self.notifier = Some(context.notifier);
        self
    }

    pub fn log(mut self, log: Arc<dyn EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Build the engine. Missing parts default to an in-memory log and an
    /// in-process notifier.
    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(EngineInner {
                log: self.log.unwrap_or_else(|| Arc::new(MemoryLog::new())),
                notifier: self
                    .notifier
                    .unwrap_or_else(|| Arc::new(LocalNotifier::new())),
                retry: self.retry,
                registry: RwLock::new(Registry::new()),
                active: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }
}

/// Typed entry point of a registered replayable
pub struct Replayable<A, R> {
    name: String,
    engine: Engine,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for Replayable<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            engine: self.engine.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for Replayable<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replayable").field("name", &self.name).finish()
    }
}

impl<A, R> Replayable<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a new run with a fresh run id
    pub fn start(&self, args: A) -> Result<RunHandle<R>> {
        let args = serde_json::to_value(args)?;
        self.engine.start_as(&self.name, args)
    }

    /// Handle on an existing run, playing it again if it is paused
    pub async fn resume(&self, run_id: &str) -> Result<RunHandle<R>> {
        self.engine.resume_as(run_id, None).await
    }
}

type RunOutcome = std::result::Result<Value, Failure>;

/// Resolves with the outcome of a run once it completes or fails
pub struct RunHandle<T = Value> {
    run_id: String,
    receiver: oneshot::Receiver<RunOutcome>,
    sender: Arc<Mutex<Option<oneshot::Sender<RunOutcome>>>>,
    _subscriptions: Vec<Subscription>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RunHandle<T> {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn settle_from(&self, state: &RunState) {
        let outcome = match state.status {
            RunStatus::Completed => Ok(state.result.clone().unwrap_or(Value::Null)),
            _ => Err(state
                .error
                .clone()
                .unwrap_or_else(|| Failure::new(format!("Run {} failed", state.run_id)))),
        };
        if let Some(sender) = lock(&self.sender).take() {
            let _ = sender.send(outcome);
        }
    }
}

impl<T> fmt::Debug for RunHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl<T: DeserializeOwned> Future for RunHandle<T> {
    type Output = std::result::Result<T, Failure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(
                serde_json::from_value(value)
                    .map_err(|e| Failure::from(EncoreError::Serialization(e))),
            ),
            Poll::Ready(Ok(Err(failure))) => Poll::Ready(Err(failure)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Failure::new(format!(
                "Run {} handle closed",
                self.run_id
            )))),
        }
    }
}
