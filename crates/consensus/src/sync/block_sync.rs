//! Full block synchronization.
//!
//! Recovers from large divergence: choose the best-advertised peer, find the
//! last common ancestor through a geometric id probe, revert the local chain
//! down to it (staging removed blocks in the temp table), then fetch and
//! apply the peer's chain forward in batches.

use crate::error::SyncError;
use crate::metrics;
use crate::processor::{BlockProcessor, ExecuteOptions};
use crate::sync::{restore_temp_blocks, SyncMechanism};
use async_trait::async_trait;
use meridian_messages::{
    GetBlocksFromIdRequest, GetHighestCommonBlockRequest, GetLastBlockRequest,
};
use meridian_network::{NetworkAdapter, PeerId, RpcRequest, RpcResponse};
use meridian_types::{Block, Hash};
use rand::Rng;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

/// Configuration for the block-sync mechanism.
#[derive(Debug, Clone)]
pub struct BlockSyncConfig {
    /// Per-call timeout for peer RPCs.
    pub rpc_timeout: Duration,
    /// Sample size when picking among the equally-best peers.
    pub top_peer_sample: usize,
}

impl Default for BlockSyncConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            top_peer_sample: 3,
        }
    }
}

/// The full block-sync mechanism (large divergence).
pub struct BlockSyncMechanism {
    config: BlockSyncConfig,
}

impl BlockSyncMechanism {
    pub fn new(config: BlockSyncConfig) -> Self {
        Self { config }
    }

    async fn request(
        &self,
        network: &dyn NetworkAdapter,
        peer: PeerId,
        request: RpcRequest,
    ) -> Result<RpcResponse, SyncError> {
        match timeout(self.config.rpc_timeout, network.request(peer, request)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Restart(format!("request to {peer} timed out"))),
        }
    }

    /// The peer whose advertised (maxHeightPrevoted, height) beats ours the
    /// most, sampled randomly from the top few to spread load.
    fn choose_best_peer(&self, processor: &BlockProcessor) -> Result<PeerId, SyncError> {
        let ctx = processor.context();
        let our_prevoted = ctx.bft.heights().max_height_prevoted;
        let our_height = ctx.chain.last_header().height;

        let mut candidates: Vec<_> = ctx
            .peers
            .all()
            .into_iter()
            .filter(|(_, info)| {
                info.max_height_prevoted > our_prevoted
                    || (info.max_height_prevoted == our_prevoted && info.height > our_height)
            })
            .collect();
        if candidates.is_empty() {
            return Err(SyncError::Abort("no viable peers to sync from".to_string()));
        }
        candidates.sort_by(|a, b| {
            (b.1.max_height_prevoted, b.1.height).cmp(&(a.1.max_height_prevoted, a.1.height))
        });
        let top = candidates.len().min(self.config.top_peer_sample.max(1));
        let picked = candidates[rand::thread_rng().gen_range(0..top)].0;
        debug!(peer = %picked, candidates = candidates.len(), "Chose sync peer");
        Ok(picked)
    }

    async fn request_last_block(
        &self,
        processor: &BlockProcessor,
        peer: PeerId,
    ) -> Result<Block, SyncError> {
        let ctx = processor.context();
        let response = self
            .request(
                ctx.network.as_ref(),
                peer,
                RpcRequest::GetLastBlock(GetLastBlockRequest {}),
            )
            .await?;
        let RpcResponse::LastBlock(response) = response else {
            return Err(SyncError::ApplyPenaltyAndRestart {
                peer,
                reason: "unexpected response to getLastBlock".to_string(),
            });
        };
        let block = Block::from_bytes(&response.block).map_err(|e| {
            SyncError::ApplyPenaltyAndRestart {
                peer,
                reason: format!("undecodable last block: {e}"),
            }
        })?;

        // The tip must be consistent with what the peer advertised.
        if let Some(info) = ctx.peers.get(peer) {
            if block.height() < info.height {
                return Err(SyncError::ApplyPenaltyAndRestart {
                    peer,
                    reason: format!(
                        "tip height {} below advertised {}",
                        block.height(),
                        info.height
                    ),
                });
            }
        }
        Ok(block)
    }

    async fn request_common_block(
        &self,
        processor: &BlockProcessor,
        peer: PeerId,
        ids: Vec<Hash>,
    ) -> Result<Option<Hash>, SyncError> {
        let response = self
            .request(
                processor.context().network.as_ref(),
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
        Ok(response.id)
    }

    async fn request_blocks_from(
        &self,
        processor: &BlockProcessor,
        peer: PeerId,
        from: Hash,
    ) -> Result<Vec<Vec<u8>>, SyncError> {
        let response = self
            .request(
                processor.context().network.as_ref(),
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
        Ok(response.blocks)
    }
}

#[async_trait]
impl SyncMechanism for BlockSyncMechanism {
    fn name(&self) -> &'static str {
        "block-sync"
    }

    /// Registered last: accepts whatever the fast switch declined, so the
    /// predicate is a catch-all.
    fn is_valid_for(&self, _processor: &BlockProcessor, _block: &Block, _peer: PeerId) -> bool {
        true
    }

    #[instrument(skip(self, processor, block), fields(target = block.height()))]
    async fn run(
        &self,
        processor: &BlockProcessor,
        block: &Block,
        _peer: PeerId,
    ) -> Result<(), SyncError> {
        let ctx = processor.context();

        let best = self.choose_best_peer(processor)?;
        let peer_tip = self.request_last_block(processor, best).await?;
        let target_height = peer_tip.height().max(block.height());

        let probe_ids = ctx.chain.common_block_probe_ids()?;
        let common_id = self
            .request_common_block(processor, best, probe_ids)
            .await?
            .ok_or_else(|| SyncError::Abort("no common block with peer".to_string()))?;
        let Some(common) = ctx.chain.get_block_by_id(&common_id)? else {
            return Err(SyncError::ApplyPenaltyAndRestart {
                peer: best,
                reason: "peer answered the probe with an unknown id".to_string(),
            });
        };
        if common.height() < ctx.chain.finalized_height() {
            return Err(SyncError::Abort(format!(
                "common block {} is below finalized height {}",
                common.height(),
                ctx.chain.finalized_height()
            )));
        }
        debug!(
            common = common.height(),
            target = target_height,
            peer = %best,
            "Common ancestor located"
        );

        // Revert down to the common block, staging our branch.
        while ctx.chain.last_header().height > common.height() {
            processor.delete_last_block(true).await?;
        }

        // Fetch the better chain forward.
        let mut from = common_id;
        let received_at = BlockProcessor::now_secs();
        while ctx.chain.last_header().height < target_height {
            if ctx.stop.load(Ordering::SeqCst) {
                return Err(SyncError::Abort("node is stopping".to_string()));
            }
            let batch = self.request_blocks_from(processor, best, from).await?;
            if batch.is_empty() {
                return Err(SyncError::Restart(format!(
                    "{best} returned no blocks before target height"
                )));
            }
            for bytes in batch {
                let next = Block::from_bytes(&bytes).map_err(|e| {
                    SyncError::ApplyPenaltyAndRestart {
                        peer: best,
                        reason: format!("undecodable block in batch: {e}"),
                    }
                })?;
                processor
                    .verify(&next)
                    .map_err(|e| SyncError::from_peer_block(best, e))?;
                let opts = ExecuteOptions {
                    skip_broadcast: true,
                    remove_from_temp: true,
                    received_at: Some(received_at),
                };
                processor
                    .execute_validated(&next, opts)
                    .await
                    .map_err(|e| SyncError::from_peer_block(best, e))?;
                metrics::record_sync_block_applied();
                from = next.id();
            }
            trace!(height = ctx.chain.last_header().height, "Sync batch applied");
        }

        // Blocks we removed that still extend the new tip come back.
        restore_temp_blocks(processor).await?;
        processor.broadcast_node_info().await;
        Ok(())
    }
}
