//! Execution scopes
//!
//! Three nested scopes exist while user code runs:
//!
//! - [`ReplayContext`]: the event log and notifier a process works with.
//!   Installed by building an [`Engine`](crate::Engine).
//! - [`RunContext`]: one pass of one run. Handed to the replayable body as an
//!   argument; counts the steps and hooks the pass reaches.
//! - [`StepContext`]: one attempt of one step. Carried in a tokio task-local
//!   while the step function runs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::driver::Engine;
use crate::error::{EncoreError, Halt, Result};
use crate::log::{EventLog, MemoryLog, ResumptionSource};
use crate::notifier::{LocalNotifier, Notifier};
use crate::sequencer::Sequencer;

/// Process-wide replay scope: where events go and who hears about run outcomes
#[derive(Clone)]
pub struct ReplayContext {
    pub log: Arc<dyn EventLog>,
    pub notifier: Arc<dyn Notifier>,
}

impl ReplayContext {
    pub fn new(log: Arc<dyn EventLog>, notifier: Arc<dyn Notifier>) -> Self {
        Self { log, notifier }
    }

    /// In-memory log with an in-process notifier
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLog::new()), Arc::new(LocalNotifier::new()))
    }
}

impl fmt::Debug for ReplayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayContext").finish_non_exhaustive()
    }
}

/// Scope of a single pass over a replayable body.
///
/// Step numbers and hook ids come from counters that restart at zero on
/// every pass, so a body with deterministic control flow reaches the same
/// step numbers on each replay. A context only works during its own pass;
/// afterwards every operation fails with an out-of-context error.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RunScope>,
}

struct RunScope {
    engine: Engine,
    run_id: String,
    replayable_id: String,
    step_counter: AtomicU32,
    hook_counter: AtomicU32,
    sequencer: Sequencer,
    closed: AtomicBool,
}

impl RunContext {
    pub(crate) fn new(
        engine: Engine,
        run_id: impl Into<String>,
        replayable_id: impl Into<String>,
        sequencer: Sequencer,
    ) -> Self {
        Self {
            inner: Arc::new(RunScope {
                engine,
                run_id: run_id.into(),
                replayable_id: replayable_id.into(),
                step_counter: AtomicU32::new(0),
                hook_counter: AtomicU32::new(0),
                sequencer,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn replayable_id(&self) -> &str {
        &self.inner.replayable_id
    }

    /// Steps reached so far in this pass
    pub fn step_count(&self) -> u32 {
        self.inner.step_counter.load(Ordering::SeqCst)
    }

    /// Hooks reached so far in this pass
    pub fn hook_count(&self) -> u32 {
        self.inner.hook_counter.load(Ordering::SeqCst)
    }

    /// Whether the pass this context belongs to is still running
    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Ask the engine to play this run again once the current pass ends
    pub async fn resume(&self, source: Option<ResumptionSource>) -> Result<()> {
        self.inner.engine.wake(self.run_id(), source).await.map(|_| ())
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub(crate) fn log(&self) -> Arc<dyn EventLog> {
        self.inner.engine.log()
    }

    pub(crate) fn sequencer(&self) -> &Sequencer {
        &self.inner.sequencer
    }

    pub(crate) fn next_step(&self) -> u32 {
        self.inner.step_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn next_hook(&self) -> u32 {
        self.inner.hook_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn ensure_active(&self, operation: &str) -> std::result::Result<(), Halt> {
        if self.is_active() {
            Ok(())
        } else {
            Err(EncoreError::OutOfContext(format!(
                "{} called after the pass of run {} ended",
                operation,
                self.run_id()
            ))
            .into())
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.inner.run_id)
            .field("replayable_id", &self.inner.replayable_id)
            .field("steps", &self.step_count())
            .field("hooks", &self.hook_count())
            .field("active", &self.is_active())
            .finish()
    }
}

tokio::task_local! {
    static STEP: StepContext;
}

/// Scope of one step attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepContext {
    pub run_id: String,
    pub replayable_id: String,
    pub step: u32,
    /// 1-based attempt number
    pub attempt: u32,
}

impl StepContext {
    /// The step attempt the calling task is running, if any
    pub fn current() -> Result<StepContext> {
        STEP.try_with(|ctx| ctx.clone()).map_err(|_| {
            EncoreError::OutOfContext("StepContext::current called outside of a step".to_string())
        })
    }

    pub(crate) async fn scope<F: Future>(self, future: F) -> F::Output {
        STEP.scope(self, future).await
    }
}
