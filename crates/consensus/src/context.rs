//! Shared collaborator bundle.

use crate::events::EventBus;
use meridian_bft::{BftModule, CommitPool};
use meridian_chain::Chain;
use meridian_engine::StateMachine;
use meridian_network::{NetworkAdapter, PeerTable};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Everything the processing pipeline and the sync mechanisms need.
///
/// Components receive their collaborators explicitly at construction; there
/// are no process-wide singletons.
pub struct ConsensusContext {
    pub chain: Arc<Chain>,
    pub machine: Arc<StateMachine>,
    pub bft: Arc<BftModule>,
    pub commit_pool: Arc<CommitPool>,
    pub network: Arc<dyn NetworkAdapter>,
    pub peers: Arc<PeerTable>,
    pub events: EventBus,
    /// Cooperative shutdown flag; long-running syncs check it between
    /// batches.
    pub stop: AtomicBool,
}
