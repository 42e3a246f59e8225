//! # RocksDB chain storage
//!
//! Column families:
//!
//! - `blocks`: height (u32 big-endian) → SBOR-encoded block
//! - `block_ids`: block id → height (u32 big-endian)
//! - `transactions`: transaction id → SBOR-encoded transaction
//! - `state`: composite state key → value
//! - `diffs`: height → SBOR-encoded reverse diff
//! - `temp_blocks`: height → SBOR-encoded block (chain-switch staging)
//! - `consensus`: well-known metadata rows (finalized height, last height)
//!
//! Big-endian height keys give natural iteration order. The `WriteBatch` is
//! the unit of atomicity: a block is saved or deleted together with its
//! state changes, diff and index entries, or not at all.

use crate::state::{StateDiff, StateWrite};
use meridian_types::{Block, Hash, Transaction};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::path::Path;
use thiserror::Error;

const CF_BLOCKS: &str = "blocks";
const CF_BLOCK_IDS: &str = "block_ids";
const CF_TRANSACTIONS: &str = "transactions";
const CF_STATE: &str = "state";
const CF_DIFFS: &str = "diffs";
const CF_TEMP_BLOCKS: &str = "temp_blocks";
const CF_CONSENSUS: &str = "consensus";

const KEY_FINALIZED_HEIGHT: &[u8] = b"finalized_height";
const KEY_LAST_HEIGHT: &[u8] = b"last_height";

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupted value under {0}")]
    Corrupted(String),

    #[error("No block at height {0}")]
    MissingBlock(u32),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Configuration for RocksDB storage.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Maximum number of background jobs.
    pub max_background_jobs: i32,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Block cache size in bytes (None to disable).
    pub block_cache_size: Option<usize>,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 4,
            write_buffer_size: 64 * 1024 * 1024,
            block_cache_size: Some(256 * 1024 * 1024),
        }
    }
}

/// RocksDB-backed storage for blocks, transactions and state.
pub struct ChainStorage {
    db: DB,
}

impl ChainStorage {
    /// Open or create a database at the given path with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom configuration.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_write_buffer_size(config.write_buffer_size);

        if let Some(cache_size) = config.block_cache_size {
            let mut block_opts = rocksdb::BlockBasedOptions::default();
            let cache = rocksdb::Cache::new_lru_cache(cache_size);
            block_opts.set_block_cache(&cache);
            opts.set_block_based_table_factory(&block_opts);
        }

        let cf_descriptors: Vec<_> = [
            CF_BLOCKS,
            CF_BLOCK_IDS,
            CF_TRANSACTIONS,
            CF_STATE,
            CF_DIFFS,
            CF_TEMP_BLOCKS,
            CF_CONSENSUS,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> &ColumnFamily {
        self.db
            .cf_handle(name)
            .expect("column family created at open")
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Blocks
    // ═══════════════════════════════════════════════════════════════════════

    /// Atomically persist a block together with its payload, forward state
    /// writes, reverse diff and the new finalized height.
    pub fn commit_block(
        &self,
        block: &Block,
        writes: &[StateWrite],
        diff: &StateDiff,
        finalized_height: u32,
    ) -> Result<(), StorageError> {
        let height = block.height();
        let mut batch = WriteBatch::default();

        let block_bytes =
            sbor::basic_encode(block).expect("block encoding must succeed - this is a bug");
        batch.put_cf(self.cf(CF_BLOCKS), height.to_be_bytes(), block_bytes);
        batch.put_cf(
            self.cf(CF_BLOCK_IDS),
            block.id().as_bytes(),
            height.to_be_bytes(),
        );

        for tx in &block.transactions {
            let tx_bytes =
                sbor::basic_encode(tx).expect("transaction encoding must succeed - this is a bug");
            batch.put_cf(self.cf(CF_TRANSACTIONS), tx.id().as_bytes(), tx_bytes);
        }

        for write in writes {
            match &write.value {
                Some(value) => batch.put_cf(self.cf(CF_STATE), &write.key, value),
                None => batch.delete_cf(self.cf(CF_STATE), &write.key),
            }
        }

        let diff_bytes =
            sbor::basic_encode(diff).expect("diff encoding must succeed - this is a bug");
        batch.put_cf(self.cf(CF_DIFFS), height.to_be_bytes(), diff_bytes);

        batch.put_cf(
            self.cf(CF_CONSENSUS),
            KEY_FINALIZED_HEIGHT,
            finalized_height.to_be_bytes(),
        );
        batch.put_cf(self.cf(CF_CONSENSUS), KEY_LAST_HEIGHT, height.to_be_bytes());

        self.db.write(batch)?;
        Ok(())
    }

    /// Atomically remove the block at `height`: the stored reverse diff is
    /// applied to the state, the block and its index entries are dropped, and
    /// the block is optionally staged into the temp table.
    pub fn remove_block(&self, block: &Block, save_temp: bool) -> Result<(), StorageError> {
        let height = block.height();
        let diff = self
            .get_diff(height)?
            .ok_or_else(|| StorageError::Corrupted(format!("diff at height {height}")))?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_BLOCKS), height.to_be_bytes());
        batch.delete_cf(self.cf(CF_BLOCK_IDS), block.id().as_bytes());
        for tx in &block.transactions {
            batch.delete_cf(self.cf(CF_TRANSACTIONS), tx.id().as_bytes());
        }
        for entry in &diff.entries {
            match &entry.previous {
                Some(value) => batch.put_cf(self.cf(CF_STATE), &entry.key, value),
                None => batch.delete_cf(self.cf(CF_STATE), &entry.key),
            }
        }
        batch.delete_cf(self.cf(CF_DIFFS), height.to_be_bytes());

        if save_temp {
            let block_bytes =
                sbor::basic_encode(block).expect("block encoding must succeed - this is a bug");
            batch.put_cf(self.cf(CF_TEMP_BLOCKS), height.to_be_bytes(), block_bytes);
        }

        batch.put_cf(
            self.cf(CF_CONSENSUS),
            KEY_LAST_HEIGHT,
            (height - 1).to_be_bytes(),
        );

        self.db.write(batch)?;
        Ok(())
    }

    pub fn get_block_by_height(&self, height: u32) -> Result<Option<Block>, StorageError> {
        match self.db.get_cf(self.cf(CF_BLOCKS), height.to_be_bytes())? {
            Some(bytes) => sbor::basic_decode(&bytes)
                .map(Some)
                .map_err(|_| StorageError::Corrupted(format!("block at height {height}"))),
            None => Ok(None),
        }
    }

    pub fn get_height_by_id(&self, id: &Hash) -> Result<Option<u32>, StorageError> {
        match self.db.get_cf(self.cf(CF_BLOCK_IDS), id.as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted(format!("height index for {id}")))?;
                Ok(Some(u32::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn get_block_by_id(&self, id: &Hash) -> Result<Option<Block>, StorageError> {
        match self.get_height_by_id(id)? {
            Some(height) => self.get_block_by_height(height),
            None => Ok(None),
        }
    }

    /// The id a height maps to, if a block is stored there.
    pub fn block_id_at_height(&self, height: u32) -> Result<Option<Hash>, StorageError> {
        Ok(self.get_block_by_height(height)?.map(|b| b.id()))
    }

    /// Up to `limit` sequential blocks starting *after* `height`, ascending.
    pub fn get_blocks_after(&self, height: u32, limit: usize) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::with_capacity(limit);
        let mut h = height;
        while blocks.len() < limit {
            h += 1;
            match self.get_block_by_height(h)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    pub fn get_transaction(&self, id: &Hash) -> Result<Option<Transaction>, StorageError> {
        match self.db.get_cf(self.cf(CF_TRANSACTIONS), id.as_bytes())? {
            Some(bytes) => sbor::basic_decode(&bytes)
                .map(Some)
                .map_err(|_| StorageError::Corrupted(format!("transaction {id}"))),
            None => Ok(None),
        }
    }

    pub fn get_diff(&self, height: u32) -> Result<Option<StateDiff>, StorageError> {
        match self.db.get_cf(self.cf(CF_DIFFS), height.to_be_bytes())? {
            Some(bytes) => sbor::basic_decode(&bytes)
                .map(Some)
                .map_err(|_| StorageError::Corrupted(format!("diff at height {height}"))),
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chain metadata
    // ═══════════════════════════════════════════════════════════════════════

    pub fn finalized_height(&self) -> Result<u32, StorageError> {
        match self.db.get_cf(self.cf(CF_CONSENSUS), KEY_FINALIZED_HEIGHT)? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted("finalized_height".to_string()))?;
                Ok(u32::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    pub fn last_height(&self) -> Result<Option<u32>, StorageError> {
        match self.db.get_cf(self.cf(CF_CONSENSUS), KEY_LAST_HEIGHT)? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted("last_height".to_string()))?;
                Ok(Some(u32::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_state(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get_cf(self.cf(CF_STATE), key).ok().flatten()
    }

    /// All persisted state entries, ascending by key.
    pub fn iter_state(&self) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.db
            .iterator_cf(self.cf(CF_STATE), rocksdb::IteratorMode::Start)
            .filter_map(|item| item.ok().map(|(k, v)| (k.to_vec(), v.to_vec())))
    }

    #[cfg(test)]
    pub(crate) fn apply_state_writes_for_test(&self, writes: &[StateWrite]) {
        let mut batch = WriteBatch::default();
        for write in writes {
            match &write.value {
                Some(value) => batch.put_cf(self.cf(CF_STATE), &write.key, value),
                None => batch.delete_cf(self.cf(CF_STATE), &write.key),
            }
        }
        self.db.write(batch).unwrap();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Temp blocks
    // ═══════════════════════════════════════════════════════════════════════

    /// All staged temp blocks, ascending by height.
    pub fn temp_blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.db
            .iterator_cf(self.cf(CF_TEMP_BLOCKS), rocksdb::IteratorMode::Start)
            .map(|item| {
                let (_, bytes) = item?;
                sbor::basic_decode(&bytes)
                    .map_err(|_| StorageError::Corrupted("temp block".to_string()))
            })
            .collect()
    }

    pub fn remove_temp_block(&self, height: u32) -> Result<(), StorageError> {
        self.db
            .delete_cf(self.cf(CF_TEMP_BLOCKS), height.to_be_bytes())?;
        Ok(())
    }

    pub fn clear_temp_blocks(&self) -> Result<(), StorageError> {
        let heights: Vec<Vec<u8>> = self
            .db
            .iterator_cf(self.cf(CF_TEMP_BLOCKS), rocksdb::IteratorMode::Start)
            .filter_map(|item| item.ok().map(|(k, _)| k.to_vec()))
            .collect();
        let mut batch = WriteBatch::default();
        for key in heights {
            batch.delete_cf(self.cf(CF_TEMP_BLOCKS), key);
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DiffEntry;
    use meridian_types::{
        AggregateCommit, Address, BlockHeader, Hash, Signature, CURRENT_BLOCK_VERSION, EMPTY_HASH,
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

    #[test]
    fn commit_and_read_back() {
        let dir = TempDir::new().unwrap();
        let storage = ChainStorage::open(dir.path()).unwrap();

        let block = test_block(1, Hash::ZERO);
        let writes = vec![StateWrite {
            key: b"k".to_vec(),
            value: Some(vec![1]),
        }];
        let diff = StateDiff {
            entries: vec![DiffEntry {
                key: b"k".to_vec(),
                previous: None,
            }],
        };
        storage.commit_block(&block, &writes, &diff, 0).unwrap();

        assert_eq!(storage.last_height().unwrap(), Some(1));
        assert_eq!(storage.get_block_by_height(1).unwrap(), Some(block.clone()));
        assert_eq!(storage.get_height_by_id(&block.id()).unwrap(), Some(1));
        assert_eq!(storage.get_state(b"k"), Some(vec![1]));
        assert_eq!(storage.get_diff(1).unwrap(), Some(diff));
    }

    #[test]
    fn remove_block_reverts_state() {
        let dir = TempDir::new().unwrap();
        let storage = ChainStorage::open(dir.path()).unwrap();

        let genesis = test_block(0, Hash::ZERO);
        storage
            .commit_block(&genesis, &[], &StateDiff::default(), 0)
            .unwrap();

        let block = test_block(1, genesis.id());
        let writes = vec![StateWrite {
            key: b"k".to_vec(),
            value: Some(vec![2]),
        }];
        let diff = StateDiff {
            entries: vec![DiffEntry {
                key: b"k".to_vec(),
                previous: None,
            }],
        };
        storage.commit_block(&block, &writes, &diff, 0).unwrap();

        storage.remove_block(&block, true).unwrap();
        assert_eq!(storage.get_state(b"k"), None);
        assert_eq!(storage.last_height().unwrap(), Some(0));
        assert!(storage.get_block_by_height(1).unwrap().is_none());
        assert!(storage.get_diff(1).unwrap().is_none());

        // Staged into the temp table.
        let temp = storage.temp_blocks().unwrap();
        assert_eq!(temp.len(), 1);
        assert_eq!(temp[0], block);
    }

    #[test]
    fn blocks_after_stops_at_gap() {
        let dir = TempDir::new().unwrap();
        let storage = ChainStorage::open(dir.path()).unwrap();

        let mut previous = Hash::ZERO;
        for h in 0..5 {
            let block = test_block(h, previous);
            previous = block.id();
            storage
                .commit_block(&block, &[], &StateDiff::default(), 0)
                .unwrap();
        }

        let blocks = storage.get_blocks_after(1, 10).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].height(), 2);
        assert_eq!(blocks[2].height(), 4);

        let limited = storage.get_blocks_after(0, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn temp_blocks_clear() {
        let dir = TempDir::new().unwrap();
        let storage = ChainStorage::open(dir.path()).unwrap();

        let genesis = test_block(0, Hash::ZERO);
        storage
            .commit_block(&genesis, &[], &StateDiff::default(), 0)
            .unwrap();
        let block = test_block(1, genesis.id());
        storage
            .commit_block(&block, &[], &StateDiff::default(), 0)
            .unwrap();
        storage.remove_block(&block, true).unwrap();

        assert_eq!(storage.temp_blocks().unwrap().len(), 1);
        storage.clear_temp_blocks().unwrap();
        assert!(storage.temp_blocks().unwrap().is_empty());
    }
}
