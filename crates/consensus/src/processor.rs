//! The block processor.
//!
//! The only code path that moves the tip: verify → execute → persist →
//! broadcast → emit. Callers hold the coordinator mutex; nothing here locks.
//!
//! Failure semantics: any error before the save leaves no side effects (the
//! state overlay is discarded, nothing is indexed). Broadcast errors after
//! the save are logged, never rolled back.

use crate::context::ConsensusContext;
use crate::error::ProcessError;
use crate::events::ConsensusEvent;
use crate::metrics;
use meridian_chain::StateStore;
use meridian_messages::{BlockAnnouncement, NodeInfoAnnouncement};
use meridian_network::BroadcastMessage;
use meridian_types::{Block, CURRENT_BLOCK_VERSION};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

/// Options for [`BlockProcessor::execute_validated`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Do not relay the block or emit `BlockBroadcast` (sync and restore
    /// paths).
    pub skip_broadcast: bool,
    /// Drop the block's height from the temp table after a successful save
    /// (block-sync re-apply path).
    pub remove_from_temp: bool,
    /// Local receive time in seconds; defaults to the block timestamp
    /// (self-forged blocks arrive in their own slot).
    pub received_at: Option<u32>,
}

/// Verifies, executes and persists blocks that fork choice admitted.
pub struct BlockProcessor {
    ctx: Arc<ConsensusContext>,
}

impl BlockProcessor {
    pub fn new(ctx: Arc<ConsensusContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ConsensusContext> {
        &self.ctx
    }

    /// Seconds since the epoch, saturated into the header timestamp domain.
    pub fn now_secs() -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0)
    }

    /// Full verification of a block against the current tip: schema,
    /// linkage, slot authorization, signature, roots, aggregate commit and
    /// static transaction checks. Any failure is peer misbehavior.
    #[instrument(skip(self, block), fields(height = block.height()))]
    pub fn verify(&self, block: &Block) -> Result<(), ProcessError> {
        let header = &block.header;
        let chain = &self.ctx.chain;
        let tip = chain.last_header();

        if header.version != CURRENT_BLOCK_VERSION {
            return Err(ProcessError::Verification(format!(
                "unsupported block version {}",
                header.version
            )));
        }

        if header.height != tip.height + 1 || header.previous_block_id != tip.id() {
            return Err(ProcessError::Verification(format!(
                "block {} does not extend tip {}",
                header.height, tip.height
            )));
        }

        let slots = chain.slots();
        let slot = slots.slot_of(header.timestamp);
        if slot > slots.current_slot(Self::now_secs()) {
            return Err(ProcessError::Verification(
                "timestamp is in a future slot".to_string(),
            ));
        }
        if slot <= slots.slot_of(tip.timestamp) {
            return Err(ProcessError::Verification(
                "slot does not advance past the tip".to_string(),
            ));
        }

        let params = self.ctx.bft.params_at(header.height);
        let Some(generator) = params.generator_for_slot(slot) else {
            return Err(ProcessError::Verification(
                "no generator authorized for slot".to_string(),
            ));
        };
        if generator.address != header.generator_address {
            return Err(ProcessError::Verification(format!(
                "generator {} is not authorized for slot {}",
                header.generator_address, slot
            )));
        }
        if !header.verify_signature(&generator.generator_key, chain.chain_id()) {
            return Err(ProcessError::Verification(
                "invalid generator signature".to_string(),
            ));
        }

        if header.validators_hash != params.validators_hash() {
            return Err(ProcessError::Verification(
                "validators hash mismatch".to_string(),
            ));
        }

        if header.transaction_root != block.compute_transaction_root() {
            return Err(ProcessError::Verification(
                "transaction root does not match payload".to_string(),
            ));
        }

        if !self
            .ctx
            .commit_pool
            .verify_aggregate_commit(&header.aggregate_commit)?
        {
            return Err(ProcessError::Verification(
                "invalid aggregate commit".to_string(),
            ));
        }

        for tx in &block.transactions {
            self.ctx.machine.verify_transaction_static(tx)?;
        }

        Ok(())
    }

    /// Execute a verified block and persist it atomically as the new tip.
    #[instrument(skip(self, block, opts), fields(height = block.height()))]
    pub async fn execute_validated(
        &self,
        block: &Block,
        opts: ExecuteOptions,
    ) -> Result<(), ProcessError> {
        let started = Instant::now();
        let chain = &self.ctx.chain;

        let mut store = StateStore::new(chain.storage());
        let outcome = self.ctx.machine.execute_block(&mut store, block)?;
        if outcome.state_root != block.header.state_root {
            return Err(ProcessError::Verification(format!(
                "state root mismatch: computed {}, header claims {}",
                outcome.state_root, block.header.state_root
            )));
        }

        // Fold the header into the BFT vote ledger, then pin the finalized
        // height to the precommit quorum. The tracker is rebuilt from stored
        // headers if the save fails, so a storage error leaves no drift.
        self.ctx.bft.observe_header(&block.header);
        let heights = self.ctx.bft.heights();
        let finalized = chain.finalized_height().max(heights.max_height_precommitted);

        let (writes, diff) = store.into_changes();
        let received_at = opts.received_at.unwrap_or(block.header.timestamp);
        if let Err(e) = chain.save_block(block, &writes, &diff, finalized, received_at) {
            warn!(height = block.height(), error = %e, "Block save failed");
            self.rebuild_bft_state()?;
            return Err(e.into());
        }
        self.ctx.bft.prune_below(chain.finalized_height());

        if opts.remove_from_temp {
            chain.remove_temp_block(block.height())?;
        }

        metrics::record_block_executed(
            block.height(),
            chain.finalized_height(),
            started.elapsed().as_secs_f64(),
        );
        info!(
            height = block.height(),
            block_id = %block.id(),
            finalized = chain.finalized_height(),
            transactions = block.transactions.len(),
            "Block executed"
        );

        if !opts.skip_broadcast {
            self.ctx
                .network
                .broadcast(BroadcastMessage::Block(BlockAnnouncement {
                    block: block.to_bytes(),
                }))
                .await;
            self.ctx
                .events
                .emit(ConsensusEvent::BlockBroadcast(Box::new(block.clone())));
            self.broadcast_node_info().await;
        }

        self.ctx
            .events
            .emit(ConsensusEvent::BlockNew(Box::new(block.clone())));
        Ok(())
    }

    /// Remove the tip. Only allowed above the finalized height; writes the
    /// block to the temp table when requested.
    #[instrument(skip(self))]
    pub async fn delete_last_block(&self, save_temp: bool) -> Result<Block, ProcessError> {
        let removed = self.ctx.chain.remove_last_block(save_temp)?;
        self.rebuild_bft_state()?;
        metrics::record_block_deleted(removed.height());
        debug!(height = removed.height(), "Block deleted");
        self.ctx
            .events
            .emit(ConsensusEvent::BlockDelete(Box::new(removed.clone())));
        Ok(removed)
    }

    /// Advertise the local chain position to all peers.
    pub async fn broadcast_node_info(&self) {
        let tip = self.ctx.chain.last_header();
        let heights = self.ctx.bft.heights();
        self.ctx
            .network
            .broadcast(BroadcastMessage::NodeInfo(NodeInfoAnnouncement {
                height: tip.height,
                max_height_prevoted: heights.max_height_prevoted,
                last_block_id: tip.id(),
                block_version: CURRENT_BLOCK_VERSION as u8,
            }))
            .await;
    }

    /// Rebuild the BFT vote ledger from recent stored headers (after a
    /// revert or a failed save).
    fn rebuild_bft_state(&self) -> Result<(), ProcessError> {
        let chain = &self.ctx.chain;
        let params = self.ctx.bft.params_at(chain.last_block().height());
        let window = (3 * params.validator_count()).max(50);
        let headers = chain.recent_headers(window)?;
        self.ctx.bft.recompute_from(&headers);
        Ok(())
    }
}
