//! Fast chain switching.
//!
//! Handles short forks: when the divergent block is within two rounds of
//! the tip and signed by an active validator, walk back to the shared
//! ancestor, fetch the competing branch from the sender, and swap the
//! branches atomically. The removed branch is staged in the temp table and
//! restored if the swap fails.

use crate::error::SyncError;
use crate::metrics;
use crate::processor::{BlockProcessor, ExecuteOptions};
use crate::sync::SyncMechanism;
use async_trait::async_trait;
use meridian_messages::{
    GetBlocksFromIdRequest, GetHighestCommonBlockRequest, MAX_BLOCKS_PER_RESPONSE,
};
use meridian_network::{PeerId, RpcRequest, RpcResponse};
use meridian_types::{Block, Hash};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Configuration for the fast-chain-switch mechanism.
#[derive(Debug, Clone)]
pub struct FastChainSwitchConfig {
    /// Per-call timeout for peer RPCs.
    pub rpc_timeout: Duration,
}

impl Default for FastChainSwitchConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

/// The fast-chain-switch mechanism (short forks).
pub struct FastChainSwitchMechanism {
    config: FastChainSwitchConfig,
}

impl FastChainSwitchMechanism {
    pub fn new(config: FastChainSwitchConfig) -> Self {
        Self { config }
    }

    /// The switch window: two rounds of the active validator set at the tip.
    fn two_rounds(&self, processor: &BlockProcessor) -> u32 {
        let ctx = processor.context();
        let tip_height = ctx.chain.last_header().height;
        2 * ctx.bft.params_at(tip_height).validator_count() as u32
    }

    async fn request(
        &self,
        processor: &BlockProcessor,
        peer: PeerId,
        request: RpcRequest,
    ) -> Result<RpcResponse, SyncError> {
        let network = processor.context().network.as_ref();
        match timeout(self.config.rpc_timeout, network.request(peer, request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Restart(format!("request to {peer} timed out"))),
        }
    }

    /// Find the shared ancestor within the switch window.
    async fn find_common_block(
        &self,
        processor: &BlockProcessor,
        peer: PeerId,
        window: u32,
    ) -> Result<Option<Block>, SyncError> {
        let ctx = processor.context();
        let tip_height = ctx.chain.last_header().height;
        let lowest = tip_height.saturating_sub(window);

        let mut ids = Vec::with_capacity((tip_height - lowest + 1) as usize);
        for height in (lowest..=tip_height).rev() {
            if let Some(header) = ctx.chain.get_header_by_height(height)? {
                ids.push(header.id());
            }
        }

        let response = self
            .request(
                processor,
                peer,
                RpcRequest::GetHighestCommonBlock(GetHighestCommonBlockRequest { ids }),
            )
            .await?;
        let RpcResponse::HighestCommonBlock(response) = response else {
            return Err(SyncError::ApplyPenaltyAndRestart {
                peer,
                reason: "unexpected response to getHighestCommonBlock".to_string(),
            });
        };
        match response.id {
            Some(id) => Ok(ctx.chain.get_block_by_id(&id)?),
            None => Ok(None),
        }
    }

    /// Fetch the peer's branch following the common block. Bounded by the
    /// switch window; a peer pushing more than that is misbehaving.
    async fn fetch_branch(
        &self,
        processor: &BlockProcessor,
        peer: PeerId,
        common_id: Hash,
        window: u32,
    ) -> Result<Vec<Block>, SyncError> {
        let cap = (2 * window as usize).max(MAX_BLOCKS_PER_RESPONSE);
        let mut branch: Vec<Block> = Vec::new();
        let mut from = common_id;
        loop {
            let response = self
                .request(
                    processor,
                    peer,
                    RpcRequest::GetBlocksFromId(GetBlocksFromIdRequest { block_id: from }),
                )
                .await?;
            let RpcResponse::BlocksFromId(response) = response else {
                return Err(SyncError::ApplyPenaltyAndRestart {
                    peer,
                    reason: "unexpected response to getBlocksFromId".to_string(),
                });
            };
            if response.blocks.is_empty() {
                break;
            }
            let batch_len = response.blocks.len();
            for bytes in response.blocks {
                let block = Block::from_bytes(&bytes).map_err(|e| {
                    SyncError::ApplyPenaltyAndRestart {
                        peer,
                        reason: format!("undecodable block in branch: {e}"),
                    }
                })?;
                branch.push(block);
            }
            if branch.len() > cap {
                return Err(SyncError::ApplyPenaltyAndRestart {
                    peer,
                    reason: "peer branch exceeds the switch window".to_string(),
                });
            }
            from = branch.last().map(|b| b.id()).unwrap_or(common_id);
            if batch_len < MAX_BLOCKS_PER_RESPONSE {
                break;
            }
        }

        if branch.is_empty() {
            return Err(SyncError::ApplyPenaltyAndRestart {
                peer,
                reason: "peer claimed a better chain but sent no blocks".to_string(),
            });
        }

        // Linkage pre-check before the local branch is touched.
        let mut previous = common_id;
        for block in &branch {
            if block.header.previous_block_id != previous {
                return Err(SyncError::ApplyPenaltyAndRestart {
                    peer,
                    reason: "peer branch does not link".to_string(),
                });
            }
            previous = block.id();
        }
        Ok(branch)
    }

    /// Put the original branch back after a failed swap.
    async fn rollback(
        &self,
        processor: &BlockProcessor,
        common_height: u32,
    ) -> Result<(), SyncError> {
        let ctx = processor.context();
        while ctx.chain.last_header().height > common_height {
            processor.delete_last_block(false).await?;
        }
        for block in ctx.chain.temp_blocks()? {
            let opts = ExecuteOptions {
                skip_broadcast: true,
                remove_from_temp: false,
                received_at: None,
            };
            processor.execute_validated(&block, opts).await?;
        }
        ctx.chain.clear_temp_blocks()?;
        Ok(())
    }
}

#[async_trait]
impl SyncMechanism for FastChainSwitchMechanism {
    fn name(&self) -> &'static str {
        "fast-chain-switch"
    }

    /// Applies to short forks: the divergent block is within two rounds of
    /// the tip and signed by an active validator.
    fn is_valid_for(&self, processor: &BlockProcessor, block: &Block, _peer: PeerId) -> bool {
        let ctx = processor.context();
        let tip_height = ctx.chain.last_header().height;
        let diff = i64::from(block.height()) - i64::from(tip_height);
        if diff.abs() > i64::from(self.two_rounds(processor)) {
            return false;
        }
        ctx.bft
            .params_at(block.height())
            .contains(&block.header.generator_address)
    }

    #[instrument(skip(self, processor, block), fields(height = block.height()))]
    async fn run(
        &self,
        processor: &BlockProcessor,
        block: &Block,
        peer: PeerId,
    ) -> Result<(), SyncError> {
        let ctx = processor.context();
        let window = self.two_rounds(processor);

        // The divergent block must come from an active validator.
        let params = ctx.bft.params_at(block.height());
        if !params.contains(&block.header.generator_address) {
            return Err(SyncError::Declined);
        }

        let Some(common) = self.find_common_block(processor, peer, window).await? else {
            debug!("No common ancestor within the switch window");
            return Err(SyncError::Declined);
        };
        if common.height() < ctx.chain.finalized_height() {
            return Err(SyncError::Abort(format!(
                "common block {} is below finalized height {}",
                common.height(),
                ctx.chain.finalized_height()
            )));
        }
        if ctx.chain.last_header().height - common.height() > window {
            return Err(SyncError::Declined);
        }

        let branch = self
            .fetch_branch(processor, peer, common.id(), window)
            .await?;

        // Revert to the ancestor, staging our branch for restore.
        while ctx.chain.last_header().height > common.height() {
            processor.delete_last_block(true).await?;
        }

        // Apply the peer branch; on any failure put our branch back and
        // report the peer.
        let received_at = BlockProcessor::now_secs();
        for next in &branch {
            let applied = match processor.verify(next) {
                Ok(()) => {
                    let opts = ExecuteOptions {
                        skip_broadcast: true,
                        remove_from_temp: false,
                        received_at: Some(received_at),
                    };
                    processor.execute_validated(next, opts).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = applied {
                warn!(height = next.height(), error = %e, "Branch apply failed, restoring");
                self.rollback(processor, common.height()).await?;
                return Err(SyncError::from_peer_block(peer, e));
            }
            metrics::record_sync_block_applied();
        }

        ctx.chain.clear_temp_blocks()?;
        processor.broadcast_node_info().await;
        Ok(())
    }
}
