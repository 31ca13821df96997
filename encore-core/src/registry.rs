//! Replayable registry
//!
//! Maps replayable names to their bodies. Built up at startup by
//! [`Engine::replayable`](crate::Engine::replayable); a run can only be
//! played or resumed when its replayable is registered.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::RunContext;
use crate::error::{EncoreError, Outcome, Result};

/// Type-erased replayable body: JSON args in, JSON result out
pub type ReplayableFn = Arc<dyn Fn(RunContext, Value) -> BoxFuture<'static, Outcome<Value>> + Send + Sync>;

#[derive(Default, Clone)]
pub struct Registry {
    entries: HashMap<String, ReplayableFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `name`, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, body: ReplayableFn) {
        let name = name.into();
        if self.entries.insert(name.clone(), body).is_some() {
            tracing::warn!(replayable = %name, "Replayable registered twice, keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Result<ReplayableFn> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| EncoreError::UnregisteredReplayable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("replayables", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_lookup() {
        let mut registry = Registry::new();
        registry.register(
            "echo",
            Arc::new(|_ctx: RunContext, args: Value| async move { Ok(args) }.boxed()),
        );

        assert!(registry.contains("echo"));
        assert!(registry.get("echo").is_ok());
        assert_eq!(registry.names(), vec!["echo".to_string()]);

        let err = registry.get("missing").err().unwrap();
        assert_eq!(err.to_string(), "Replayable missing is not registered");
    }
}
