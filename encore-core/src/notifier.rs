//! Run completion notifications
//!
//! In-process pub/sub between the driver, which announces terminal run
//! outcomes, and whoever waits on them (run handles, application code).

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use uuid::Uuid;

use crate::error::Failure;

/// Called with the result of a completed run
pub type CompletionListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Called with the error of a failed run
pub type FailureListener = Arc<dyn Fn(&Failure) + Send + Sync>;

/// Delivers terminal run outcomes to listeners
pub trait Notifier: Send + Sync {
    /// Listen for the completion of `run_id`
    fn on_run_completed(&self, run_id: &str, listener: CompletionListener) -> Subscription;

    /// Listen for the failure of `run_id`
    fn on_run_failed(&self, run_id: &str, listener: FailureListener) -> Subscription;

    /// Announce that `run_id` completed
    fn notify_complete(&self, run_id: &str, result: &Value);

    /// Announce that `run_id` failed
    fn notify_failed(&self, run_id: &str, error: &Failure);
}

/// Registration of a listener. Dropping it removes the listener.
pub struct Subscription {
    id: Uuid,
    run_id: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Subscription that runs `cancel` when it ends
    pub fn new(
        id: Uuid,
        run_id: impl Into<String>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            run_id: run_id.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Remove the listener
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .finish()
    }
}

type Listeners<L> = Mutex<HashMap<String, Vec<(Uuid, L)>>>;

#[derive(Default)]
struct ListenerTable {
    completed: Listeners<CompletionListener>,
    failed: Listeners<FailureListener>,
}

/// Notifier for listeners in the same process
#[derive(Default, Clone)]
pub struct LocalNotifier {
    registry: Arc<ListenerTable>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listeners waiting on `run_id`
    pub fn listener_count(&self, run_id: &str) -> usize {
        let completed = lock(&self.registry.completed)
            .get(run_id)
            .map_or(0, Vec::len);
        let failed = lock(&self.registry.failed).get(run_id).map_or(0, Vec::len);
        completed + failed
    }
}

fn lock<L>(listeners: &Listeners<L>) -> MutexGuard<'_, HashMap<String, Vec<(Uuid, L)>>> {
    listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn completed(registry: &ListenerTable) -> &Listeners<CompletionListener> {
    &registry.completed
}

fn failed(registry: &ListenerTable) -> &Listeners<FailureListener> {
    &registry.failed
}

fn subscribe<L: Send + Sync + 'static>(
    registry: &Arc<ListenerTable>,
    select: fn(&ListenerTable) -> &Listeners<L>,
    run_id: &str,
    listener: L,
) -> Subscription {
    let id = Uuid::new_v4();
    lock(select(registry))
        .entry(run_id.to_string())
        .or_default()
        .push((id, listener));

    let weak: Weak<ListenerTable> = Arc::downgrade(registry);
    let key = run_id.to_string();
    Subscription::new(id, run_id, move || {
        if let Some(registry) = weak.upgrade() {
            let mut listeners = lock(select(&registry));
            if let Some(entries) = listeners.get_mut(&key) {
                entries.retain(|(entry, _)| *entry != id);
                if entries.is_empty() {
                    listeners.remove(&key);
                }
            }
        }
    })
}

fn snapshot<L: Clone>(listeners: &Listeners<L>, run_id: &str) -> Vec<L> {
    lock(listeners)
        .get(run_id)
        .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
        .unwrap_or_default()
}

impl Notifier for LocalNotifier {
    fn on_run_completed(&self, run_id: &str, listener: CompletionListener) -> Subscription {
        subscribe(&self.registry, completed, run_id, listener)
    }

    fn on_run_failed(&self, run_id: &str, listener: FailureListener) -> Subscription {
        subscribe(&self.registry, failed, run_id, listener)
    }

    fn notify_complete(&self, run_id: &str, result: &Value) {
        // Listeners run outside the lock so they may unsubscribe
        for listener in snapshot(&self.registry.completed, run_id) {
            listener(result);
        }
    }

    fn notify_failed(&self, run_id: &str, error: &Failure) {
        for listener in snapshot(&self.registry.failed, run_id) {
            listener(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listeners_receive_their_run_only() {
        let notifier = LocalNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let _sub = notifier.on_run_completed(
            "a",
            Arc::new(move |value: &Value| {
                assert_eq!(value, &json!(1));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        notifier.notify_complete("b", &json!(2));
        notifier.notify_complete("a", &json!(1));
        notifier.notify_failed("a", &Failure::new("ignored"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_subscription_removes_listener() {
        let notifier = LocalNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let sub = notifier.on_run_failed(
            "a",
            Arc::new(move |_: &Failure| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(notifier.listener_count("a"), 1);

        drop(sub);
        assert_eq!(notifier.listener_count("a"), 0);

        notifier.notify_failed("a", &Failure::new("boom"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let notifier = LocalNotifier::new();
        let sub = notifier.on_run_completed("a", Arc::new(|_: &Value| {}));
        let other = notifier.on_run_completed("a", Arc::new(|_: &Value| {}));
        assert_eq!(notifier.listener_count("a"), 2);

        sub.unsubscribe();
        assert_eq!(notifier.listener_count("a"), 1);
        assert_eq!(other.run_id(), "a");
    }
}
