//! Hooks
//!
//! A hook is a signal delivered from outside a run. Runs bind to a hook's
//! token and consume its triggers in timestamp order; triggering a hook
//! resumes every run bound to it.

use futures::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::context::RunContext;
use crate::driver::Engine;
use crate::error::{Halt, Outcome, PendingSignal, Result};
use crate::log::event::{self, ReplayEvent, ResumptionSource};
use crate::log::SettleKey;

/// Token of the hook with the given id: the first 24 lowercase hex digits
/// of its SHA-256 digest.
///
/// Other engines that encode the digest differently (base64url, say) derive
/// different tokens for the same id, so their logs do not share hooks with
/// ours.
pub fn hook_token(hook_id: &str) -> String {
    let digest = Sha256::digest(hook_id.as_bytes());
    format!("{:x}", digest)[..24].to_string()
}

/// How a trigger addresses a hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookIdentifier {
    /// Hook id, hashed into its token
    Id(String),
    /// Token, used as is
    Token(String),
}

impl HookIdentifier {
    pub fn id(id: impl Into<String>) -> Self {
        HookIdentifier::Id(id.into())
    }

    pub fn token(token: impl Into<String>) -> Self {
        HookIdentifier::Token(token.into())
    }

    /// Token this identifier refers to
    pub fn resolve(&self) -> String {
        match self {
            HookIdentifier::Id(id) => hook_token(id),
            HookIdentifier::Token(token) => token.clone(),
        }
    }
}

/// A run's handle on a hook.
///
/// Each [`next`](Hook::next) consumes one trigger. Triggers are shared by
/// every run bound to the token, so two runs waiting on the same hook both
/// see every value.
#[derive(Debug)]
pub struct Hook<T> {
    ctx: RunContext,
    id: String,
    token: String,
    consumed: usize,
    bound: Arc<AtomicBool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Hook<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The next trigger of this hook, or Pending if it has not arrived yet
    pub fn next(&mut self) -> impl Future<Output = Outcome<T>> + Send + 'static + use<T> {
        let index = self.consumed;
        self.consumed += 1;

        let ctx = self.ctx.clone();
        let hook_id = self.id.clone();
        let token = self.token.clone();
        let bound = self.bound.clone();

        async move {
            ctx.ensure_active("hook")?;
            let ticket = ctx.sequencer().ticket(&SettleKey::Hook {
                token: token.clone(),
                index,
            });
            let log = ctx.log();

            if !bound.load(Ordering::SeqCst) {
                if !log.is_hook_bound(&token, ctx.run_id()).await? {
                    log.log(vec![ReplayEvent::HookBound {
                        hook_id: hook_id.clone(),
                        token: token.clone(),
                        run_id: ctx.run_id().to_string(),
                        timestamp: event::now(),
                    }])
                    .await?;
                    tracing::debug!(run_id = %ctx.run_id(), hook_id = %hook_id, token = %token, "Hook bound");
                }
                bound.store(true, Ordering::SeqCst);
            }

            let mut triggers = log.hook_triggers(&token).await?;
            if index < triggers.len() {
                if let Some(ticket) = ticket {
                    ticket.turn().await;
                }
                let trigger = triggers.swap_remove(index);
                return Ok(serde_json::from_value(trigger.value)?);
            }

            drop(ticket);
            tokio::task::yield_now().await;
            Err(Halt::Pending(PendingSignal::Hook { hook_id }))
        }
    }

    /// The first value this handle sees
    pub fn once(mut self) -> impl Future<Output = Outcome<T>> + Send + 'static {
        self.next()
    }

    /// Every available trigger in order, then one Pending outcome
    pub fn iterate(mut self) -> impl Stream<Item = Outcome<T>> + Send + 'static {
        futures::stream::unfold(Some(()), move |state| {
            let next = state.map(|_| self.next());
            async move {
                let outcome = next?.await;
                let more = match &outcome {
                    Err(Halt::Pending(_)) => None,
                    _ => Some(()),
                };
                Some((outcome, more))
            }
        })
    }
}

impl RunContext {
    /// Handle on a hook. Without an id the hook gets `hook:{run_id}:{n}`,
    /// where `n` counts the hooks this pass has reached.
    pub fn hook<T>(&self, hook_id: Option<&str>) -> Hook<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let counter = self.next_hook();
        let id = hook_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("hook:{}:{}", self.run_id(), counter));

        Hook {
            ctx: self.clone(),
            token: hook_token(&id),
            id,
            consumed: 0,
            bound: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        }
    }

    /// Trigger a hook from inside a run.
    ///
    /// The delivery is recorded as the run's next step, so later passes
    /// replay it instead of triggering the hook again.
    pub fn trigger<V>(
        &self,
        hook: HookIdentifier,
        value: V,
    ) -> impl Future<Output = Outcome<()>> + Send + 'static + use<V>
    where
        V: Serialize + Send + 'static,
    {
        let engine = self.engine().clone();
        self.once(move || async move {
            engine.trigger(hook, value).await?;
            Ok(())
        })
    }
}

impl Engine {
    /// Deliver `value` to a hook and resume every run bound to it
    pub async fn trigger<V: Serialize + Send>(&self, hook: HookIdentifier, value: V) -> Result<()> {
        let token = hook.resolve();
        let value = serde_json::to_value(value)?;

        self.log()
            .log(vec![ReplayEvent::HookTriggered {
                token: token.clone(),
                timestamp: event::now(),
                value: value.clone(),
            }])
            .await?;

        let bindings = self.log().hook_bindings(&token).await?;
        tracing::debug!(token = %token, bindings = bindings.len(), "Hook triggered");

        let mut seen = HashSet::new();
        for binding in bindings {
            if !seen.insert(binding.run_id.clone()) {
                continue;
            }
            let source = ResumptionSource::HookTriggered {
                token: token.clone(),
                value: value.clone(),
            };
            if let Err(e) = self.wake(&binding.run_id, Some(source)).await {
                tracing::warn!(run_id = %binding.run_id, token = %token, error = %e, "Failed to resume run bound to hook");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_stable_hex() {
        let token = hook_token("confirm");
        assert_eq!(token.len(), 24);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(token, hook_token("confirm"));
        assert_ne!(token, hook_token("confirm2"));
    }

    #[test]
    fn test_identifier_resolution() {
        assert_eq!(HookIdentifier::id("x").resolve(), hook_token("x"));
        assert_eq!(HookIdentifier::token("abc").resolve(), "abc");
    }
}
