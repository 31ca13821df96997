//! Settlement sequencing for replays
//!
//! When a body races several operations and keeps whichever settles first,
//! the winner on replay must be the operation that won originally, even though
//! every cached operation now settles instantly. Each pass builds a
//! [`Sequencer`] from the run's recorded settlement order. Cached operations
//! take a [`Ticket`] for their position when they are first polled and wait
//! for their [`turn`](Ticket::turn) before returning the recorded outcome: a
//! turn is granted once no live ticket with a lower position remains.
//! Operations created but not yet polled hold no ticket, so a body may await
//! them in any order.
//!
//! Operations missing from the recorded order are new concurrency. They get
//! no ticket and fall back to ordinary suspension.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::log::{SettleKey, Settlement};

/// Gate enforcing the recorded settlement order of one run
#[derive(Clone, Debug)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    positions: HashMap<SettleKey, usize>,
    state: Mutex<Open>,
    released: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct Open {
    /// Live tickets per position
    tickets: BTreeMap<usize, usize>,
}

impl Sequencer {
    /// Build a gate for the given settlement order
    pub fn new(order: impl IntoIterator<Item = Settlement>) -> Self {
        let mut positions = HashMap::new();
        for (position, settlement) in order.into_iter().enumerate() {
            positions.entry(settlement.key).or_insert(position);
        }
        let (released, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                positions,
                state: Mutex::new(Open::default()),
                released,
            }),
        }
    }

    /// A gate with nothing recorded
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Recorded position of an operation
    pub fn position(&self, key: &SettleKey) -> Option<usize> {
        self.inner.positions.get(key).copied()
    }

    /// Number of recorded settlements
    pub fn len(&self) -> usize {
        self.inner.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.positions.is_empty()
    }

    /// Claim a ticket for `key`. `None` when the operation was never recorded settling.
    pub fn ticket(&self, key: &SettleKey) -> Option<Ticket> {
        let position = self.position(key)?;
        *self.lock().tickets.entry(position).or_insert(0) += 1;

        Some(Ticket {
            position,
            sequencer: self.clone(),
            released: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Open> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn blocked(&self, position: usize) -> bool {
        self.lock().tickets.range(..position).next().is_some()
    }

    fn release(&self, position: usize) {
        {
            let mut open = self.lock();
            if let Some(count) = open.tickets.get_mut(&position) {
                *count -= 1;
                if *count == 0 {
                    open.tickets.remove(&position);
                }
            }
        }
        self.inner.released.send_modify(|generation| *generation += 1);
    }
}

/// A cached operation's place in the recorded settlement order.
///
/// Blocks every higher position until it has taken its turn or is dropped.
#[derive(Debug)]
pub struct Ticket {
    position: usize,
    sequencer: Sequencer,
    released: bool,
}

impl Ticket {
    pub fn position(&self) -> usize {
        self.position
    }

    /// Wait until every lower position has settled, then settle this one.
    ///
    /// Yields once before checking, so operations polled in the same round
    /// (the children of a `race` or `all`) have claimed their tickets.
    pub async fn turn(mut self) {
        let mut released = self.sequencer.inner.released.subscribe();
        tokio::task::yield_now().await;
        while self.sequencer.blocked(self.position) {
            if released.changed().await.is_err() {
                break;
            }
        }

        self.released = true;
        self.sequencer.release(self.position);
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.released {
            self.sequencer.release(self.position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn order(keys: &[SettleKey]) -> Vec<Settlement> {
        keys.iter()
            .map(|key| Settlement {
                key: key.clone(),
                on: Utc::now(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_lower_position_goes_first() {
        let sequencer = Sequencer::new(order(&[SettleKey::Step(1), SettleKey::Step(2)]));
        let first = sequencer.ticket(&SettleKey::Step(1)).unwrap();
        let second = sequencer.ticket(&SettleKey::Step(2)).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let tx2 = tx.clone();
        let late = tokio::spawn(async move {
            second.turn().await;
            tx2.send(2).unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        first.turn().await;
        tx.send(1).unwrap();
        late.await.unwrap();

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_dropped_ticket_unblocks() {
        let sequencer = Sequencer::new(order(&[SettleKey::Step(1), SettleKey::Step(2)]));
        let first = sequencer.ticket(&SettleKey::Step(1)).unwrap();
        let second = sequencer.ticket(&SettleKey::Step(2)).unwrap();

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), second.turn())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unrecorded_operations_get_no_ticket() {
        let sequencer = Sequencer::new(order(&[SettleKey::Step(1)]));
        assert!(sequencer.ticket(&SettleKey::Step(2)).is_none());
        assert!(
            sequencer
                .ticket(&SettleKey::Hook {
                    token: "t".to_string(),
                    index: 0
                })
                .is_none()
        );
        assert_eq!(sequencer.len(), 1);
    }

    #[tokio::test]
    async fn test_same_round_claim_blocks_higher_turn() {
        let sequencer = Sequencer::new(order(&[SettleKey::Step(1), SettleKey::Step(2)]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        // The higher position is claimed and polled first
        let higher = {
            let sequencer = sequencer.clone();
            let tx = tx.clone();
            async move {
                sequencer.ticket(&SettleKey::Step(2)).unwrap().turn().await;
                tx.send(2).unwrap();
            }
        };
        let lower = {
            let sequencer = sequencer.clone();
            async move {
                sequencer.ticket(&SettleKey::Step(1)).unwrap().turn().await;
                tx.send(1).unwrap();
            }
        };
        tokio::join!(higher, lower);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_unclaimed_positions_do_not_block() {
        let sequencer = Sequencer::new(order(&[SettleKey::Step(1), SettleKey::Step(2)]));
        let second = sequencer.ticket(&SettleKey::Step(2)).unwrap();

        tokio::time::timeout(Duration::from_secs(1), second.turn())
            .await
            .unwrap();
    }
}
