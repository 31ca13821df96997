//! Composition of step and hook outcomes
//!
//! ```ignore
//! use futures::FutureExt;
//!
//! let confirm = ctx.hook::<i64>(Some("confirm"));
//! let value = race(vec![
//!     confirm.once().boxed(),
//!     ctx.step(|| async { slow().await }).boxed(),
//! ])
//! .await?;
//! ```
//!
//! Pending children never win or lose anything: a race waits for the first
//! child that is Ready or Failed, and only reports Pending when every child
//! is Pending.

use futures::StreamExt;
use futures::stream::FuturesUnordered;

use crate::error::{Failure, Halt, Outcome, PendingSignal};

/// Outcome of the first operation to settle.
///
/// Failed children settle too: if the first one to settle failed, the race
/// fails. When every child is Pending the race is Pending on all of them.
pub async fn race<T, I>(operations: I) -> Outcome<T>
where
    I: IntoIterator,
    I::Item: Future<Output = Outcome<T>>,
{
    let mut running: FuturesUnordered<_> = operations.into_iter().collect();
    if running.is_empty() {
        return Err(Halt::Failed(Failure::new("race over no operations")));
    }

    let mut pending = Vec::new();
    while let Some(outcome) = running.next().await {
        match outcome {
            Err(Halt::Pending(signal)) => pending.push(signal),
            settled => return settled,
        }
    }

    Err(Halt::Pending(PendingSignal::aggregate(pending)))
}

/// Every operation's value, in input order.
///
/// Fails as soon as any child fails. Otherwise Pending if any child is
/// Pending, on all the pending children.
pub async fn all<T, I>(operations: I) -> Outcome<Vec<T>>
where
    I: IntoIterator,
    I::Item: Future<Output = Outcome<T>>,
{
    let mut running: FuturesUnordered<_> = operations
        .into_iter()
        .enumerate()
        .map(|(index, operation)| async move { (index, operation.await) })
        .collect();

    let mut values: Vec<Option<T>> = (0..running.len()).map(|_| None).collect();
    let mut pending = Vec::new();

    while let Some((index, outcome)) = running.next().await {
        match outcome {
            Ok(value) => values[index] = Some(value),
            Err(Halt::Pending(signal)) => pending.push(signal),
            Err(failed) => return Err(failed),
        }
    }

    if !pending.is_empty() {
        return Err(Halt::Pending(PendingSignal::aggregate(pending)));
    }

    Ok(values.into_iter().flatten().collect())
}
