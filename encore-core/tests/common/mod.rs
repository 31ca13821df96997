//! Shared helpers for engine integration tests

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use encore_core::prelude::*;
use std::future::Future;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Retry policy that keeps tests fast
pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

pub fn quick_engine() -> Engine {
    Engine::builder().retry_policy(quick_retry(3)).build()
}

/// Await a run handle, failing the test if it never settles
pub async fn settle<T: serde::de::DeserializeOwned>(
    handle: RunHandle<T>,
) -> std::result::Result<T, Failure> {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("run did not settle in time")
}

/// Poll `check` until it holds
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Wire names of a run's events, in log order
pub async fn event_types(engine: &Engine, run_id: &str) -> Vec<&'static str> {
    engine
        .log()
        .events()
        .await
        .unwrap()
        .iter()
        .filter(|event| event.run_id() == Some(run_id))
        .map(|event| event.type_name())
        .collect()
}

pub fn count(types: &[&str], name: &str) -> usize {
    types.iter().filter(|t| **t == name).count()
}

/// Fixed timestamp in the past, for prepopulated logs
pub fn at(offset_millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000 + offset_millis).unwrap()
}
