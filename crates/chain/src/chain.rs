//! The chain handle.
//!
//! [`Chain`] is the single writer surface over [`ChainStorage`] that the
//! consensus coordinator owns. It caches the tip (and when it was received),
//! tracks the finalized height, and enforces the deletion floor: no block at
//! or below the finalized height is ever removed.

use crate::state::{StateDiff, StateWrite};
use crate::storage::{ChainStorage, StorageError};
use meridian_types::{Block, BlockHeader, ChainId, Hash, Slots};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Maximum number of ids offered in a common-ancestor probe: the tip, then
/// geometrically spaced heights back towards genesis, genesis always last.
const MAX_COMMON_BLOCK_PROBES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Chain is not initialized")]
    NotInitialized,

    #[error("Stored genesis block does not match the provided one")]
    GenesisMismatch,

    #[error("Cannot delete block at height {height}: finalized height is {finalized}")]
    BelowFinalized { height: u32, finalized: u32 },

    #[error("Cannot delete the genesis block")]
    GenesisUndeletable,
}

struct Tip {
    block: Block,
    /// Seconds timestamp at which the tip was received. Equal to the block
    /// timestamp for self-forged blocks; fork choice uses it for tie-breaks.
    received_at: u32,
}

/// Chain handle: tip cache, finalized height and storage access.
pub struct Chain {
    storage: Arc<ChainStorage>,
    chain_id: ChainId,
    slots: Slots,
    tip: RwLock<Option<Tip>>,
    finalized_height: AtomicU32,
}

impl Chain {
    pub fn new(storage: Arc<ChainStorage>, chain_id: ChainId, slots: Slots) -> Self {
        Self {
            storage,
            chain_id,
            slots,
            tip: RwLock::new(None),
            finalized_height: AtomicU32::new(0),
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn slots(&self) -> &Slots {
        &self.slots
    }

    pub fn storage(&self) -> &ChainStorage {
        &self.storage
    }

    /// Initialize from storage, persisting `genesis` on first start.
    ///
    /// Idempotent: a second start verifies the stored genesis id instead of
    /// writing again.
    pub fn init(&self, genesis: &Block) -> Result<(), ChainError> {
        match self.storage.block_id_at_height(0)? {
            None => {
                info!(genesis_id = %genesis.id(), "Persisting genesis block");
                self.storage
                    .commit_block(genesis, &[], &StateDiff::default(), 0)?;
            }
            Some(stored) if stored == genesis.id() => {
                debug!(genesis_id = %stored, "Genesis block already stored");
            }
            Some(_) => return Err(ChainError::GenesisMismatch),
        }

        let last_height = self
            .storage
            .last_height()?
            .ok_or(ChainError::NotInitialized)?;
        let block = self
            .storage
            .get_block_by_height(last_height)?
            .ok_or(StorageError::MissingBlock(last_height))?;
        let received_at = block.header.timestamp;
        *self.tip.write() = Some(Tip { block, received_at });
        self.finalized_height
            .store(self.storage.finalized_height()?, Ordering::SeqCst);
        Ok(())
    }

    /// The last saved block.
    pub fn last_block(&self) -> Block {
        self.tip
            .read()
            .as_ref()
            .expect("chain initialized before use")
            .block
            .clone()
    }

    pub fn last_header(&self) -> BlockHeader {
        self.last_block().header
    }

    /// When the current tip was received, in seconds.
    pub fn tip_received_at(&self) -> u32 {
        self.tip
            .read()
            .as_ref()
            .expect("chain initialized before use")
            .received_at
    }

    pub fn finalized_height(&self) -> u32 {
        self.finalized_height.load(Ordering::SeqCst)
    }

    /// Persist a block that extends the tip and advance the finalized height.
    ///
    /// The finalized height only moves forward: callers pass the candidate
    /// and the stored value is the max of both.
    pub fn save_block(
        &self,
        block: &Block,
        writes: &[StateWrite],
        diff: &StateDiff,
        finalized_height: u32,
        received_at: u32,
    ) -> Result<(), ChainError> {
        let finalized = self.finalized_height().max(finalized_height);
        self.storage.commit_block(block, writes, diff, finalized)?;
        self.finalized_height.store(finalized, Ordering::SeqCst);
        *self.tip.write() = Some(Tip {
            block: block.clone(),
            received_at,
        });
        Ok(())
    }

    /// Remove the tip, applying its reverse diff. Refused at or below the
    /// finalized height and for the genesis block.
    pub fn remove_last_block(&self, save_temp: bool) -> Result<Block, ChainError> {
        let block = self.last_block();
        let height = block.height();
        if height == 0 {
            return Err(ChainError::GenesisUndeletable);
        }
        let finalized = self.finalized_height();
        if height <= finalized {
            return Err(ChainError::BelowFinalized { height, finalized });
        }

        self.storage.remove_block(&block, save_temp)?;

        let previous = self
            .storage
            .get_block_by_height(height - 1)?
            .ok_or(StorageError::MissingBlock(height - 1))?;
        let received_at = previous.header.timestamp;
        *self.tip.write() = Some(Tip {
            block: previous,
            received_at,
        });
        debug!(height, save_temp, "Removed last block");
        Ok(block)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookups used by the endpoint and the synchronizer
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_block_by_id(&self, id: &Hash) -> Result<Option<Block>, ChainError> {
        Ok(self.storage.get_block_by_id(id)?)
    }

    pub fn get_block_by_height(&self, height: u32) -> Result<Option<Block>, ChainError> {
        Ok(self.storage.get_block_by_height(height)?)
    }

    pub fn get_header_by_height(&self, height: u32) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.storage.get_block_by_height(height)?.map(|b| b.header))
    }

    /// Up to `limit` blocks following the block with `id`, ascending.
    pub fn get_blocks_after_id(&self, id: &Hash, limit: usize) -> Result<Vec<Block>, ChainError> {
        match self.storage.get_height_by_id(id)? {
            Some(height) => Ok(self.storage.get_blocks_after(height, limit)?),
            None => Ok(Vec::new()),
        }
    }

    /// The id at the greatest height among `ids` that this chain also has.
    pub fn highest_common_block(&self, ids: &[Hash]) -> Result<Option<Hash>, ChainError> {
        let mut best: Option<(u32, Hash)> = None;
        for id in ids {
            if let Some(height) = self.storage.get_height_by_id(id)? {
                if best.is_none_or(|(h, _)| height > h) {
                    best = Some((height, *id));
                }
            }
        }
        Ok(best.map(|(_, id)| id))
    }

    /// The block ids offered to a peer when probing for a common ancestor:
    /// tip, tip−1, tip−2, tip−4, … (geometric spacing), genesis always
    /// included, at most [`MAX_COMMON_BLOCK_PROBES`] ids.
    pub fn common_block_probe_ids(&self) -> Result<Vec<Hash>, ChainError> {
        let tip_height = self.last_block().height();
        let mut heights = Vec::with_capacity(MAX_COMMON_BLOCK_PROBES);
        let mut offset: u32 = 0;
        loop {
            let height = tip_height.saturating_sub(offset);
            if heights.last() != Some(&height) {
                heights.push(height);
            }
            if height == 0 || heights.len() == MAX_COMMON_BLOCK_PROBES - 1 {
                break;
            }
            offset = if offset == 0 { 1 } else { offset * 2 };
        }
        if heights.last() != Some(&0) {
            heights.push(0);
        }

        let mut ids = Vec::with_capacity(heights.len());
        for height in heights {
            if let Some(id) = self.storage.block_id_at_height(height)? {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// The last `count` headers ending at the tip, ascending by height.
    pub fn recent_headers(&self, count: usize) -> Result<Vec<BlockHeader>, ChainError> {
        let tip_height = self.last_block().height();
        let start = (u64::from(tip_height) + 1).saturating_sub(count as u64) as u32;
        let mut headers = Vec::with_capacity(count);
        for height in start..=tip_height {
            if let Some(header) = self.get_header_by_height(height)? {
                headers.push(header);
            }
        }
        Ok(headers)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Temp blocks
    // ═══════════════════════════════════════════════════════════════════════

    pub fn temp_blocks(&self) -> Result<Vec<Block>, ChainError> {
        Ok(self.storage.temp_blocks()?)
    }

    pub fn remove_temp_block(&self, height: u32) -> Result<(), ChainError> {
        Ok(self.storage.remove_temp_block(height)?)
    }

    pub fn clear_temp_blocks(&self) -> Result<(), ChainError> {
        Ok(self.storage.clear_temp_blocks()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{
        AggregateCommit, Address, Signature, CURRENT_BLOCK_VERSION, EMPTY_HASH,
    };
    use tempfile::TempDir;

    fn test_block(height: u32, previous: Hash) -> Block {
        Block {
            header: BlockHeader {
                version: CURRENT_BLOCK_VERSION,
                timestamp: 1000 + height * 10,
                height,
                previous_block_id: previous,
                generator_address: Address([1; 20]),
                transaction_root: EMPTY_HASH,
                state_root: Hash::digest(&height.to_be_bytes()),
                validators_hash: Hash::digest(b"validators"),
                aggregate_commit: AggregateCommit::empty(0),
                max_height_generated: 0,
                max_height_prevoted: 0,
                signature: Signature::zero(),
            },
            assets: vec![],
            transactions: vec![],
        }
    }

    fn test_chain(dir: &TempDir) -> (Chain, Block) {
        let storage = Arc::new(ChainStorage::open(dir.path()).unwrap());
        let chain = Chain::new(storage, ChainId([0, 0, 0, 1]), Slots::new(1000, 10));
        let genesis = test_block(0, Hash::ZERO);
        chain.init(&genesis).unwrap();
        (chain, genesis)
    }

    fn extend(chain: &Chain, finalized: u32) -> Block {
        let tip = chain.last_block();
        let block = test_block(tip.height() + 1, tip.id());
        chain
            .save_block(&block, &[], &StateDiff::default(), finalized, block.header.timestamp)
            .unwrap();
        block
    }

    #[test]
    fn init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (chain, genesis) = test_chain(&dir);
        chain.init(&genesis).unwrap();
        assert_eq!(chain.last_block().id(), genesis.id());

        // A different genesis must be rejected.
        let other = test_block(0, Hash::digest(b"other"));
        assert!(matches!(chain.init(&other), Err(ChainError::GenesisMismatch)));
    }

    #[test]
    fn finalized_height_is_monotone() {
        let dir = TempDir::new().unwrap();
        let (chain, _) = test_chain(&dir);
        extend(&chain, 0);
        extend(&chain, 1);
        assert_eq!(chain.finalized_height(), 1);
        // A lower candidate never lowers the stored value.
        extend(&chain, 0);
        assert_eq!(chain.finalized_height(), 1);
    }

    #[test]
    fn delete_refused_at_finalized_height() {
        let dir = TempDir::new().unwrap();
        let (chain, _) = test_chain(&dir);
        extend(&chain, 0);
        extend(&chain, 2);
        assert!(matches!(
            chain.remove_last_block(false),
            Err(ChainError::BelowFinalized {
                height: 2,
                finalized: 2
            })
        ));
    }

    #[test]
    fn genesis_cannot_be_deleted() {
        let dir = TempDir::new().unwrap();
        let (chain, _) = test_chain(&dir);
        assert!(matches!(
            chain.remove_last_block(false),
            Err(ChainError::GenesisUndeletable)
        ));
    }

    #[test]
    fn remove_moves_tip_back() {
        let dir = TempDir::new().unwrap();
        let (chain, genesis) = test_chain(&dir);
        let block = extend(&chain, 0);
        let removed = chain.remove_last_block(false).unwrap();
        assert_eq!(removed.id(), block.id());
        assert_eq!(chain.last_block().id(), genesis.id());
    }

    #[test]
    fn probe_ids_are_geometric_and_end_at_genesis() {
        let dir = TempDir::new().unwrap();
        let (chain, genesis) = test_chain(&dir);
        for _ in 0..40 {
            extend(&chain, 0);
        }

        let ids = chain.common_block_probe_ids().unwrap();
        assert!(ids.len() <= 20);
        assert_eq!(*ids.first().unwrap(), chain.last_block().id());
        assert_eq!(*ids.last().unwrap(), genesis.id());
        // Heights covered: 40, 39, 38, 36, 32, 24, 8, 0.
        assert_eq!(ids.len(), 8);
    }

    #[test]
    fn highest_common_block_picks_greatest_height() {
        let dir = TempDir::new().unwrap();
        let (chain, genesis) = test_chain(&dir);
        let b1 = extend(&chain, 0);
        let b2 = extend(&chain, 0);

        let unknown = Hash::digest(b"unknown");
        let common = chain
            .highest_common_block(&[genesis.id(), b1.id(), unknown])
            .unwrap();
        assert_eq!(common, Some(b1.id()));

        let common = chain
            .highest_common_block(&[b2.id(), b1.id()])
            .unwrap();
        assert_eq!(common, Some(b2.id()));

        assert_eq!(chain.highest_common_block(&[]).unwrap(), None);
        assert_eq!(chain.highest_common_block(&[unknown]).unwrap(), None);
    }
}
