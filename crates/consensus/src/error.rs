//! Error taxonomy of the consensus core.
//!
//! Processing errors split into peer-misbehavior (the sender is penalized)
//! and local-fatal (storage trouble, invariant violations - surfaced upward,
//! chain left unchanged). Synchronization errors are translated by the
//! supervisor: restart, penalize-and-restart, abort, or decline to the next
//! mechanism.

use meridian_bft::CommitError;
use meridian_chain::ChainError;
use meridian_engine::EngineError;
use meridian_network::{NetworkError, PeerId};
use thiserror::Error;

/// Errors from verifying or executing a single block.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The block failed a verification check. When it came from a peer,
    /// that peer is penalized.
    #[error("Block verification failed: {0}")]
    Verification(String),

    /// Execution rejected the block (bad transaction, nonce gap, ...).
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Storage or invariant trouble. Local-fatal: never a peer penalty.
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    /// The node is shutting down.
    #[error("Consensus is stopped")]
    Stopped,
}

impl ProcessError {
    /// True when the error indicates peer misbehavior rather than local
    /// trouble.
    pub fn is_penalty(&self) -> bool {
        matches!(self, ProcessError::Verification(_) | ProcessError::Engine(_))
    }
}

/// Errors raised inside the synchronization mechanisms.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient failure (peer timeout, empty result): the supervisor
    /// restarts the sync with no penalty.
    #[error("Synchronization must restart: {0}")]
    Restart(String),

    /// Peer misbehavior mid-sync: the supervisor penalizes `peer` and
    /// restarts.
    #[error("Peer {peer} misbehaved during synchronization: {reason}")]
    ApplyPenaltyAndRestart { peer: PeerId, reason: String },

    /// The sync cannot proceed (ancestor below finality, no viable peer):
    /// log and return to idle.
    #[error("Synchronization aborted: {0}")]
    Abort(String),

    /// The mechanism does not apply to this fork; the supervisor falls
    /// through to the next one.
    #[error("Mechanism declined")]
    Declined,

    /// Local-fatal error from the processing pipeline; propagated.
    #[error(transparent)]
    Process(ProcessError),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl From<NetworkError> for SyncError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Timeout(peer) => SyncError::Restart(format!("request to {peer} timed out")),
            NetworkError::PeerUnavailable(peer) => {
                SyncError::Restart(format!("{peer} is unavailable"))
            }
            other => SyncError::Restart(other.to_string()),
        }
    }
}

impl From<ProcessError> for SyncError {
    fn from(e: ProcessError) -> Self {
        SyncError::Process(e)
    }
}

impl SyncError {
    /// Map a processing failure of a peer-provided block: verification and
    /// execution failures penalize the peer, local trouble propagates.
    pub fn from_peer_block(peer: PeerId, e: ProcessError) -> Self {
        if e.is_penalty() {
            SyncError::ApplyPenaltyAndRestart {
                peer,
                reason: e.to_string(),
            }
        } else {
            SyncError::Process(e)
        }
    }
}
