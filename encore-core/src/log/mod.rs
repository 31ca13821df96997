//! Append-only replay log
//!
//! The [`EventLog`] trait is the storage seam of the engine. Backends only
//! need to store events and answer queries; every query has the same meaning
//! as the pure derivation functions in [`state`], which both bundled
//! backends delegate to.

pub mod event;
pub mod file;
pub mod memory;
pub mod state;


pub use event::{ReplayEvent, ResumptionSource};
pub use file::FileLog;
pub use memory::MemoryLog;
pub use state::{
    Attempt, HookBinding, HookTrigger, RunState, RunStatus, SettleKey, Settlement, StepState,
    StepStatus,
};

use async_trait::async_trait;

use crate::error::Result;

/// Storage backend for replay events
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append events. A batch is stored atomically and in order.
    async fn log(&self, events: Vec<ReplayEvent>) -> Result<()>;

    /// Current state of a run, `None` if it never started
    async fn run_state(&self, run_id: &str) -> Result<Option<RunState>>;

    /// Current state of a step, `None` if it never started
    async fn step_state(&self, run_id: &str, step: u32) -> Result<Option<StepState>>;

    /// Whether the run is bound to the hook token
    async fn is_hook_bound(&self, token: &str, run_id: &str) -> Result<bool>;

    /// Runs bound to the hook token
    async fn hook_bindings(&self, token: &str) -> Result<Vec<HookBinding>>;

    /// Values delivered to the hook token, oldest first
    async fn hook_triggers(&self, token: &str) -> Result<Vec<HookTrigger>>;

    /// Runs that have not completed or failed
    async fn pending_runs(&self) -> Result<Vec<RunState>>;

    /// Steps of a run that have not completed or failed
    async fn pending_steps(&self, run_id: &str) -> Result<Vec<StepState>>;

    /// Recorded settlement order of a run's steps and hook triggers
    async fn settlements(&self, run_id: &str) -> Result<Vec<Settlement>>;

    /// Every stored event, in timestamp order
    async fn events(&self) -> Result<Vec<ReplayEvent>>;
}
