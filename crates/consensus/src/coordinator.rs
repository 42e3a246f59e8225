//! The consensus coordinator.
//!
//! Top level of the core: owns the mutex, the chain handle, the network
//! handle, the state machine and the commit pool, and composes the fork
//! choice, the processor and the synchronizer.
//!
//! Exactly one tip-modifying operation proceeds at any moment: `execute`,
//! `on_block_receive` (after the syncing fast path) and `delete_last_block`
//! all take the mutex, and the synchronizer runs entirely under the
//! `on_block_receive` hold. Incoming blocks observed while syncing are
//! dropped, not queued, to keep memory bounded.

use crate::context::ConsensusContext;
use crate::error::ProcessError;
use crate::events::{ConsensusEvent, EventBus};
use crate::fork_choice::{self, ForkChoice};
use crate::metrics;
use crate::processor::{BlockProcessor, ExecuteOptions};
use crate::sync::{
    BlockSyncConfig, BlockSyncMechanism, FastChainSwitchConfig, FastChainSwitchMechanism,
    SyncMechanism, Synchronizer,
};
use async_trait::async_trait;
use meridian_bft::{BftModule, CommitError, CommitPool};
use meridian_chain::Chain;
use meridian_engine::StateMachine;
use meridian_messages::SingleCommitGossip;
use meridian_network::{
    BroadcastMessage, ConsensusHandle, NetworkAdapter, PeerId, PeerTable, MALFORMED_PEER_PENALTY,
};
use meridian_types::{Block, SingleCommit, CURRENT_BLOCK_VERSION};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

/// Configuration for the coordinator and its sync mechanisms.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub block_sync: BlockSyncConfig,
    pub fast_switch: FastChainSwitchConfig,
}

/// Owns the mutex and composes the consensus core.
pub struct ConsensusCoordinator {
    ctx: Arc<ConsensusContext>,
    processor: BlockProcessor,
    synchronizer: Synchronizer,
    mutex: Mutex<()>,
}

impl ConsensusCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoordinatorConfig,
        chain: Arc<Chain>,
        machine: Arc<StateMachine>,
        bft: Arc<BftModule>,
        commit_pool: Arc<CommitPool>,
        network: Arc<dyn NetworkAdapter>,
        peers: Arc<PeerTable>,
    ) -> Arc<Self> {
        let ctx = Arc::new(ConsensusContext {
            chain,
            machine,
            bft,
            commit_pool,
            network,
            peers,
            events: EventBus::default(),
            stop: std::sync::atomic::AtomicBool::new(false),
        });
        let processor = BlockProcessor::new(Arc::clone(&ctx));
        let mechanisms: Vec<Box<dyn SyncMechanism>> = vec![
            Box::new(FastChainSwitchMechanism::new(config.fast_switch)),
            Box::new(BlockSyncMechanism::new(config.block_sync)),
        ];
        Arc::new(Self {
            ctx,
            processor,
            synchronizer: Synchronizer::new(mechanisms),
            mutex: Mutex::new(()),
        })
    }

    /// Load or create the genesis block and rebuild the BFT vote ledger
    /// from stored headers. Idempotent across restarts.
    pub fn init(&self, genesis: &Block) -> Result<(), ProcessError> {
        self.ctx.chain.init(genesis)?;

        let tip = self.ctx.chain.last_header();
        let params = self.ctx.bft.params_at(tip.height);
        let window = (3 * params.validator_count()).max(50);
        let headers = self.ctx.chain.recent_headers(window)?;
        self.ctx.bft.recompute_from(&headers);

        info!(
            tip = tip.height,
            finalized = self.ctx.chain.finalized_height(),
            "Consensus initialized"
        );
        Ok(())
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn context(&self) -> &Arc<ConsensusContext> {
        &self.ctx
    }

    /// True while a synchronization is in flight.
    pub fn syncing(&self) -> bool {
        self.synchronizer.is_active()
    }

    pub fn finalized_height(&self) -> u32 {
        self.ctx.chain.finalized_height()
    }

    /// Whether a peer's advertised position does NOT beat ours under the
    /// different-chain rule.
    pub fn is_synced(&self, height: u32, max_height_prevoted: u32) -> bool {
        let ours = self.ctx.bft.heights().max_height_prevoted;
        let tip = self.ctx.chain.last_header().height;
        !(max_height_prevoted > ours || (max_height_prevoted == ours && height > tip))
    }

    fn ensure_running(&self) -> Result<(), ProcessError> {
        if self.ctx.stop.load(Ordering::SeqCst) {
            return Err(ProcessError::Stopped);
        }
        Ok(())
    }

    /// Apply a block the forging layer built. Fork choice is the caller's
    /// concern: the block must extend (or tie-break) the tip.
    pub async fn execute(&self, block: Block) -> Result<(), ProcessError> {
        self.ensure_running()?;
        let _guard = self.mutex.lock().await;
        self.processor.verify(&block)?;
        self.processor
            .execute_validated(&block, ExecuteOptions::default())
            .await
    }

    /// Remove the tip. Refused at or below the finalized height.
    pub async fn delete_last_block(&self, save_temp: bool) -> Result<Block, ProcessError> {
        self.ensure_running()?;
        let _guard = self.mutex.lock().await;
        self.processor.delete_last_block(save_temp).await
    }

    /// Ingest a block announced by a peer.
    ///
    /// Peer misbehavior is penalized and swallowed; only local-fatal errors
    /// surface.
    #[instrument(skip(self, bytes), fields(%peer, len = bytes.len()))]
    pub async fn receive_block(&self, bytes: Vec<u8>, peer: PeerId) -> Result<(), ProcessError> {
        if self.ctx.stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Fast path: drop everything while a sync holds the core.
        if self.synchronizer.is_active() {
            trace!("Dropping block received during synchronization");
            return Ok(());
        }

        let _guard = self.mutex.lock().await;

        let block = match Block::from_bytes(&bytes) {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "Undecodable block from peer");
                self.penalize(peer);
                return Ok(());
            }
        };
        if block.header.version != CURRENT_BLOCK_VERSION {
            warn!(version = block.header.version, "Wrong block version from peer");
            self.penalize(peer);
            return Ok(());
        }

        let tip = self.ctx.chain.last_header();
        let status = fork_choice::evaluate(
            &block.header,
            &tip,
            self.ctx.chain.tip_received_at(),
            self.ctx.chain.slots(),
            BlockProcessor::now_secs(),
        );
        debug!(height = block.height(), ?status, "Classified incoming block");

        match status {
            ForkChoice::IdenticalBlock => Ok(()),
            ForkChoice::Discard => {
                trace!(height = block.height(), "Discarding block");
                Ok(())
            }
            ForkChoice::DoubleForging => {
                warn!(
                    generator = %block.header.generator_address,
                    height = block.height(),
                    "Double forging detected"
                );
                metrics::record_fork_detected();
                self.ctx
                    .events
                    .emit(ConsensusEvent::ForkDetected(Box::new(block.header)));
                Ok(())
            }
            ForkChoice::ValidBlock => self.apply_peer_block(&block, peer).await,
            ForkChoice::TieBreak => self.handle_tie_break(&block, peer).await,
            ForkChoice::DifferentChain => {
                info!(
                    height = block.height(),
                    their_prevoted = block.header.max_height_prevoted,
                    "Peer is on a different chain, synchronizing"
                );
                metrics::record_fork_detected();
                self.ctx
                    .events
                    .emit(ConsensusEvent::ForkDetected(Box::new(block.header.clone())));
                match self.synchronizer.run(&self.processor, &block, peer).await {
                    Ok(()) => Ok(()),
                    Err(crate::error::SyncError::Process(e)) => Err(e),
                    Err(crate::error::SyncError::Chain(e)) => Err(e.into()),
                    Err(other) => {
                        // Restart/abort taxonomy is resolved inside the
                        // supervisor; anything else ends the attempt.
                        error!(error = %other, "Synchronization failed");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Verify and apply a peer block that extends the tip.
    async fn apply_peer_block(&self, block: &Block, peer: PeerId) -> Result<(), ProcessError> {
        let opts = ExecuteOptions {
            received_at: Some(BlockProcessor::now_secs()),
            ..Default::default()
        };
        let applied = match self.processor.verify(block) {
            Ok(()) => self.processor.execute_validated(block, opts).await,
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => Ok(()),
            Err(e) if e.is_penalty() => {
                warn!(%peer, error = %e, "Peer block rejected");
                self.penalize(peer);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Tie-break swap: remove the late tip, try the incoming block, restore
    /// the original tip if the swap fails.
    async fn handle_tie_break(&self, block: &Block, peer: PeerId) -> Result<(), ProcessError> {
        let original_tip = self.ctx.chain.last_block();
        let original_received_at = self.ctx.chain.tip_received_at();

        self.processor.delete_last_block(false).await?;

        let opts = ExecuteOptions {
            received_at: Some(BlockProcessor::now_secs()),
            ..Default::default()
        };
        let swapped = match self.processor.verify(block) {
            Ok(()) => self.processor.execute_validated(block, opts).await,
            Err(e) => Err(e),
        };

        match swapped {
            Ok(()) => {
                metrics::record_tie_break();
                info!(height = block.height(), "Tie-break: tip replaced");
                Ok(())
            }
            Err(e) => {
                // No penalty beyond what verification itself imposes.
                if e.is_penalty() {
                    self.penalize(peer);
                }
                warn!(error = %e, "Tie-break failed, restoring original tip");
                let restore = ExecuteOptions {
                    skip_broadcast: true,
                    remove_from_temp: false,
                    received_at: Some(original_received_at),
                };
                self.processor
                    .execute_validated(&original_tip, restore)
                    .await?;
                if e.is_penalty() {
                    // The original error concerned the peer's block; with
                    // the tip restored the chain is healthy again.
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Ingest a gossiped single commit. Invalid signatures and inactive
    /// validators cost the relaying peer a penalty; stale commits are
    /// silently ignored.
    pub async fn receive_single_commit(&self, gossip: SingleCommitGossip, peer: PeerId) {
        let commit = SingleCommit {
            block_id: gossip.block_id,
            height: gossip.height,
            validator_address: gossip.validator_address,
            certificate_signature: gossip.certificate_signature,
        };
        match self.ctx.commit_pool.validate_commit(&commit) {
            Ok(true) => {
                if self.ctx.commit_pool.add_commit(commit) {
                    metrics::record_commit_added();
                }
            }
            Ok(false) => {
                trace!(height = gossip.height, "Ignoring uninteresting commit");
            }
            Err(CommitError::Chain(e)) => {
                error!(error = %e, "Commit validation failed on storage");
            }
            Err(e) => {
                warn!(%peer, error = %e, "Malicious commit");
                self.penalize(peer);
            }
        }
    }

    /// Pool maintenance, run once per applied block: gossip fresh commits
    /// and keep the aggregate selection warm for the forging layer.
    pub async fn run_commit_job(&self) -> Result<(), ProcessError> {
        let output = self.ctx.commit_pool.job()?;
        for commit in output.to_gossip {
            self.ctx
                .network
                .broadcast(BroadcastMessage::SingleCommit(SingleCommitGossip {
                    block_id: commit.block_id,
                    height: commit.height,
                    validator_address: commit.validator_address,
                    certificate_signature: commit.certificate_signature,
                }))
                .await;
        }
        if !output.aggregate.is_empty() {
            metrics::record_aggregate_selected();
        }
        Ok(())
    }

    /// Set the stop flag, then take the mutex once to drain in-flight work.
    pub async fn stop(&self) {
        self.ctx.stop.store(true, Ordering::SeqCst);
        let _guard = self.mutex.lock().await;
        info!("Consensus coordinator stopped");
    }

    fn penalize(&self, peer: PeerId) {
        self.ctx.network.apply_penalty(peer, MALFORMED_PEER_PENALTY);
        metrics::record_peer_penalty();
    }
}

#[async_trait]
impl ConsensusHandle for ConsensusCoordinator {
    async fn on_block_receive(&self, bytes: Vec<u8>, peer: PeerId) {
        if let Err(e) = self.receive_block(bytes, peer).await {
            error!(%peer, error = %e, "Block processing failed");
        }
    }

    async fn on_single_commit(&self, commit: SingleCommitGossip, peer: PeerId) {
        self.receive_single_commit(commit, peer).await;
    }
}
