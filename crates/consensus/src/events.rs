//! Consensus events.
//!
//! Emitted while the coordinator mutex is held, so same-task subscribers
//! observe them in chain order. Backed by a `tokio::sync::broadcast`
//! channel; slow subscribers lag rather than block the core.

use meridian_types::{Block, BlockHeader};
use tokio::sync::broadcast;

/// The four events the core publishes.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// A block was verified, executed and persisted as the new tip.
    BlockNew(Box<Block>),
    /// The tip was removed (tie-break swap or chain switch).
    BlockDelete(Box<Block>),
    /// A block was handed to the network layer for relay.
    BlockBroadcast(Box<Block>),
    /// A contradicting header was observed (double forge, discarded fork).
    ForkDetected(Box<BlockHeader>),
}

/// Cloneable handle to the event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConsensusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ConsensusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
