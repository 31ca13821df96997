//! In-memory event log

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::event::ReplayEvent;
use super::state::{self, HookBinding, HookTrigger, RunState, Settlement, StepState};
use super::EventLog;
use crate::error::Result;

/// Event log held in process memory.
///
/// Events are kept sorted by timestamp. Inserting out of order is fine: a
/// late batch is placed where it belongs, after any event with an equal
/// timestamp.
#[derive(Debug, Default)]
pub struct MemoryLog {
    events: RwLock<Vec<ReplayEvent>>,
}

impl MemoryLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log holding `events`
    pub fn with_events(mut events: Vec<ReplayEvent>) -> Self {
        events.sort_by_key(|e| e.timestamp());
        Self {
            events: RwLock::new(events),
        }
    }

    /// Number of stored events
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Whether the log is empty
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    pub(crate) async fn insert(&self, batch: Vec<ReplayEvent>) {
        let mut events = self.events.write().await;
        for event in batch {
            let at = event.timestamp();
            let position = events.partition_point(|e| e.timestamp() <= at);
            events.insert(position, event);
        }
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn log(&self, events: Vec<ReplayEvent>) -> Result<()> {
        self.insert(events).await;
        Ok(())
    }

    async fn run_state(&self, run_id: &str) -> Result<Option<RunState>> {
        Ok(state::derive_run_state(self.events.read().await.iter(), run_id))
    }

    async fn step_state(&self, run_id: &str, step: u32) -> Result<Option<StepState>> {
        Ok(state::derive_step_state(
            self.events.read().await.iter(),
            run_id,
            step,
        ))
    }

    async fn is_hook_bound(&self, token: &str, run_id: &str) -> Result<bool> {
        Ok(state::is_hook_bound(
            self.events.read().await.iter(),
            token,
            run_id,
        ))
    }

    async fn hook_bindings(&self, token: &str) -> Result<Vec<HookBinding>> {
        Ok(state::hook_bindings(self.events.read().await.iter(), token))
    }

    async fn hook_triggers(&self, token: &str) -> Result<Vec<HookTrigger>> {
        Ok(state::hook_triggers(self.events.read().await.iter(), token))
    }

    async fn pending_runs(&self) -> Result<Vec<RunState>> {
        Ok(state::pending_runs(self.events.read().await.iter()))
    }

    async fn pending_steps(&self, run_id: &str) -> Result<Vec<StepState>> {
        Ok(state::pending_steps(self.events.read().await.iter(), run_id))
    }

    async fn settlements(&self, run_id: &str) -> Result<Vec<Settlement>> {
        Ok(state::settlements(self.events.read().await.iter(), run_id))
    }

    async fn events(&self) -> Result<Vec<ReplayEvent>> {
        Ok(self.events.read().await.clone())
    }
}
