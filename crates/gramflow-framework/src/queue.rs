//! Bounded inbound event queue.
//!
//! Transports push into an [`EventQueue`]; dispatcher workers pull from the
//! matching receiver. The queue is FIFO and bounded: when it is full the
//! configured [`OverflowPolicy`] either suspends the producer or rejects the
//! event. Every overflow is counted and reported to the producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::{debug, warn};

use gramflow_core::Event;

use crate::error::QueueError;

/// What `push` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Suspend the producer until a slot frees up.
    #[default]
    Block,
    /// Fail with [`QueueError::Overflow`].
    Reject,
}

struct QueueShared {
    sender: RwLock<Option<Sender<Arc<Event>>>>,
    capacity: usize,
    policy: OverflowPolicy,
    overflows: AtomicU64,
}

/// Producer handle of the event queue.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<QueueShared>,
}

impl EventQueue {
    /// Creates a queue holding at most `capacity` events, and its receiver.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> (Self, Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            shared: Arc::new(QueueShared {
                sender: RwLock::new(Some(tx)),
                capacity,
                policy,
                overflows: AtomicU64::new(0),
            }),
        };
        (queue, rx)
    }

    fn sender(&self) -> Result<Sender<Arc<Event>>, QueueError> {
        self.shared.sender.read().clone().ok_or(QueueError::Closed)
    }

    fn overflowed(&self) -> QueueError {
        let total = self.shared.overflows.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            capacity = self.shared.capacity,
            total_overflows = total,
            "Event queue overflow"
        );
        QueueError::Overflow {
            capacity: self.shared.capacity,
        }
    }

    /// Enqueues `event` according to the overflow policy.
    ///
    /// With [`OverflowPolicy::Block`] a full queue is counted as an overflow
    /// once, then the producer waits for space.
    pub async fn push(&self, event: impl Into<Arc<Event>>) -> Result<(), QueueError> {
        let sender = self.sender()?;
        match sender.try_send(event.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            Err(TrySendError::Full(event)) => match self.shared.policy {
                OverflowPolicy::Reject => Err(self.overflowed()),
                OverflowPolicy::Block => {
                    self.overflowed();
                    debug!(event_id = %event.id(), "Queue full, waiting for space");
                    sender.send(event).await.map_err(|_| QueueError::Closed)
                }
            },
        }
    }

    /// Enqueues `event` without waiting, regardless of policy.
    pub fn try_push(&self, event: impl Into<Arc<Event>>) -> Result<(), QueueError> {
        let sender = self.sender()?;
        match sender.try_send(event.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
            Err(TrySendError::Full(_)) => Err(self.overflowed()),
        }
    }

    /// Stops accepting events. Already queued events stay available to the
    /// receiver, which observes the end of the stream once they are drained.
    ///
    /// Producers blocked in `push` keep their own sender alive until they
    /// complete.
    pub fn close(&self) {
        if self.shared.sender.write().take().is_some() {
            debug!("Event queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.sender.read().is_none()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.shared.policy
    }

    /// Events currently waiting.
    pub fn len(&self) -> usize {
        self.shared
            .sender
            .read()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of times a push found the queue full.
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflows.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("capacity", &self.shared.capacity)
            .field("policy", &self.shared.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn event(n: u64) -> Event {
        Event::message(1, "x").id(n).build()
    }

    #[tokio::test]
    async fn test_fifo() {
        let (queue, mut rx) = EventQueue::new(4, OverflowPolicy::Reject);
        for n in 0..3 {
            queue.push(event(n)).await.unwrap();
        }
        assert_eq!(queue.len(), 3);
        for n in 0..3 {
            assert_eq!(rx.recv().await.unwrap().id().as_str(), n.to_string());
        }
    }

    #[tokio::test]
    async fn test_reject_policy_counts_overflow() {
        let (queue, _rx) = EventQueue::new(2, OverflowPolicy::Reject);
        queue.push(event(1)).await.unwrap();
        queue.push(event(2)).await.unwrap();
        assert_eq!(
            queue.push(event(3)).await,
            Err(QueueError::Overflow { capacity: 2 })
        );
        assert_eq!(
            queue.try_push(event(4)),
            Err(QueueError::Overflow { capacity: 2 })
        );
        assert_eq!(queue.overflow_count(), 2);
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_space() {
        let (queue, mut rx) = EventQueue::new(1, OverflowPolicy::Block);
        queue.push(event(1)).await.unwrap();

        let mut blocked = task::spawn(queue.push(event(2)));
        assert_pending!(blocked.poll());
        assert_eq!(queue.overflow_count(), 1);

        rx.recv().await.unwrap();
        assert!(blocked.is_woken());
        assert_ready_ok!(blocked.poll());
        assert_eq!(rx.recv().await.unwrap().id().as_str(), "2");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (queue, mut rx) = EventQueue::new(4, OverflowPolicy::Block);
        queue.push(event(1)).await.unwrap();
        queue.close();

        assert_eq!(queue.push(event(2)).await, Err(QueueError::Closed));
        assert_eq!(queue.try_push(event(3)), Err(QueueError::Closed));
        assert!(rx.recv().await.is_some());
        let end = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(end, Ok(None)));
    }
}
