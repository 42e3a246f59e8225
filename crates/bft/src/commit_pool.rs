//! The commit pool.
//!
//! Validators produce one [`SingleCommit`] per height; the pool collects
//! them, deduplicates, gossips the fresh ones once per block interval, and
//! aggregates the heaviest certifiable height into an [`AggregateCommit`]
//! that the next proposed block embeds.
//!
//! Commits live in two maps: `non_gossiped` (accepted but not yet relayed)
//! and `gossiped`. Both are keyed by height and evicted once the height
//! falls to or below `max_removal_height`, the aggregate-commit height
//! recorded in the header at the finalized height.

use crate::heights::BftModule;
use meridian_chain::{Chain, ChainError};
use meridian_types::{
    AggregateCommit, BlockHeader, BlsSecretKey, BlsSignature, ChainId, SignerBitfield,
    SingleCommit,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Validation errors that indicate a malicious commit, as opposed to one
/// that is merely no longer interesting (those return `Ok(false)`).
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Commit signature by {validator} for height {height} is invalid")]
    InvalidSignature {
        validator: meridian_types::Address,
        height: u32,
    },

    #[error("Validator {validator} is not active at height {height}")]
    InactiveValidator {
        validator: meridian_types::Address,
        height: u32,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Configuration for the commit pool.
#[derive(Debug, Clone)]
pub struct CommitPoolConfig {
    /// Width of the height window (ending at `max_height_precommitted`)
    /// within which incoming commits are accepted.
    pub range_stored: u32,
}

impl Default for CommitPoolConfig {
    fn default() -> Self {
        Self { range_stored: 50 }
    }
}

#[derive(Default)]
struct Pools {
    non_gossiped: BTreeMap<u32, Vec<SingleCommit>>,
    gossiped: BTreeMap<u32, Vec<SingleCommit>>,
}

impl Pools {
    fn contains(&self, commit: &SingleCommit) -> bool {
        let check = |map: &BTreeMap<u32, Vec<SingleCommit>>| {
            map.get(&commit.height).is_some_and(|list| {
                list.iter().any(|c| {
                    c.validator_address == commit.validator_address
                        && c.certificate_signature == commit.certificate_signature
                })
            })
        };
        check(&self.non_gossiped) || check(&self.gossiped)
    }

    fn at_height(&self, height: u32) -> Vec<SingleCommit> {
        let mut commits = Vec::new();
        if let Some(list) = self.non_gossiped.get(&height) {
            commits.extend(list.iter().cloned());
        }
        if let Some(list) = self.gossiped.get(&height) {
            commits.extend(list.iter().cloned());
        }
        commits
    }

    fn evict_at_or_below(&mut self, height: u32) {
        self.non_gossiped = self.non_gossiped.split_off(&(height + 1));
        self.gossiped = self.gossiped.split_off(&(height + 1));
    }
}

/// Output of one pool maintenance round.
#[derive(Debug)]
pub struct CommitJobOutput {
    /// Commits to relay to peers (moved from non-gossiped to gossiped).
    pub to_gossip: Vec<SingleCommit>,
    /// The aggregate to embed in the next proposed block.
    pub aggregate: AggregateCommit,
}

/// Collects single commits and selects the aggregate to certify.
pub struct CommitPool {
    config: CommitPoolConfig,
    chain: Arc<Chain>,
    bft: Arc<BftModule>,
    pools: Mutex<Pools>,
}

impl CommitPool {
    pub fn new(config: CommitPoolConfig, chain: Arc<Chain>, bft: Arc<BftModule>) -> Self {
        Self {
            config,
            chain,
            bft,
            pools: Mutex::new(Pools::default()),
        }
    }

    /// BLS-sign the certificate derived from `header`.
    pub fn create_single_commit(
        header: &BlockHeader,
        validator_address: meridian_types::Address,
        bls_key: &BlsSecretKey,
        chain_id: &ChainId,
    ) -> SingleCommit {
        let certificate = header.certificate();
        SingleCommit {
            block_id: certificate.block_id,
            height: header.height,
            validator_address,
            certificate_signature: bls_key.sign(&certificate.signing_bytes(chain_id)),
        }
    }

    /// The eviction floor: the aggregate-commit height recorded in the
    /// header at the finalized height.
    pub fn max_removal_height(&self) -> Result<u32, CommitError> {
        let finalized = self.chain.finalized_height();
        let header = self
            .chain
            .get_header_by_height(finalized)?
            .ok_or(ChainError::NotInitialized)?;
        Ok(header.aggregate_commit.height)
    }

    /// Add a commit to the non-gossiped pool. Returns false for duplicates.
    pub fn add_commit(&self, commit: SingleCommit) -> bool {
        let mut pools = self.pools.lock();
        if pools.contains(&commit) {
            return false;
        }
        trace!(
            height = commit.height,
            validator = %commit.validator_address,
            "Commit added to pool"
        );
        pools
            .non_gossiped
            .entry(commit.height)
            .or_default()
            .push(commit);
        true
    }

    /// Full admission check for a commit received from the network.
    ///
    /// `Ok(false)` means the commit is not interesting (stale, unknown
    /// block, duplicate, out of range); an error means it is malformed in a
    /// way only a faulty or malicious validator produces.
    pub fn validate_commit(&self, commit: &SingleCommit) -> Result<bool, CommitError> {
        if commit.height <= self.max_removal_height()? {
            return Ok(false);
        }

        let Some(header) = self.chain.get_header_by_height(commit.height)? else {
            return Ok(false);
        };
        if header.id() != commit.block_id {
            return Ok(false);
        }

        if self.pools.lock().contains(commit) {
            return Ok(false);
        }

        let heights = self.bft.heights();
        let window_start = heights
            .max_height_precommitted
            .saturating_sub(self.config.range_stored.saturating_sub(1));
        let in_window = commit.height >= window_start
            && commit.height <= heights.max_height_precommitted;
        let still_interesting =
            in_window || self.bft.param_store().is_change_height(commit.height + 1);
        if !still_interesting {
            return Ok(false);
        }

        let params = self.bft.params_at(commit.height);
        let Some(index) = params.index_of(&commit.validator_address) else {
            return Err(CommitError::InactiveValidator {
                validator: commit.validator_address,
                height: commit.height,
            });
        };
        let public_key = params.validators[index].bls_public_key;
        let message = header.certificate().signing_bytes(self.chain.chain_id());
        if !commit.certificate_signature.verify(&public_key, &message) {
            return Err(CommitError::InvalidSignature {
                validator: commit.validator_address,
                height: commit.height,
            });
        }

        Ok(true)
    }

    /// All commits known at `height`, from both pools.
    pub fn get_commits_by_height(&self, height: u32) -> Vec<SingleCommit> {
        self.pools.lock().at_height(height)
    }

    /// Verify an aggregate commit carried in a block header.
    pub fn verify_aggregate_commit(&self, aggregate: &AggregateCommit) -> Result<bool, CommitError> {
        let heights = self.bft.heights();

        // The "nothing new to certify" aggregate: empty, pinned to the last
        // certified height.
        if aggregate.is_empty() && aggregate.height == heights.max_height_certified {
            return Ok(true);
        }
        if aggregate.aggregation_bits.is_empty() || aggregate.certificate_signature.is_zero() {
            return Ok(false);
        }

        if aggregate.height <= heights.max_height_certified
            || aggregate.height > heights.max_height_precommitted
        {
            return Ok(false);
        }

        // An aggregate cannot cross a parameter change: all signatures must
        // be under one validator set.
        if let Some(change) = self
            .bft
            .param_store()
            .next_change_at_or_after(heights.max_height_certified + 1)
        {
            if aggregate.height >= change {
                return Ok(false);
            }
        }

        let Some(header) = self.chain.get_header_by_height(aggregate.height)? else {
            return Ok(false);
        };
        let params = self.bft.params_at(aggregate.height);
        if !aggregate
            .aggregation_bits
            .is_well_formed(params.validator_count())
        {
            return Ok(false);
        }

        let mut weight = 0u64;
        let mut public_keys = Vec::new();
        for index in aggregate.aggregation_bits.iter_set() {
            let validator = &params.validators[index];
            weight += validator.bft_weight;
            public_keys.push(validator.bls_public_key);
        }
        if weight < params.certificate_threshold {
            return Ok(false);
        }

        let message = header.certificate().signing_bytes(self.chain.chain_id());
        Ok(aggregate
            .certificate_signature
            .verify_aggregate(&public_keys, &message))
    }

    /// Aggregate the pool's commits at `height` if they reach threshold.
    fn aggregate_at(&self, height: u32) -> Result<Option<AggregateCommit>, CommitError> {
        let commits = self.get_commits_by_height(height);
        if commits.is_empty() {
            return Ok(None);
        }
        let params = self.bft.params_at(height);

        // One signature per validator, ordered strictly by validator index.
        let mut by_index: BTreeMap<usize, BlsSignature> = BTreeMap::new();
        let mut weight = 0u64;
        for commit in &commits {
            let Some(index) = params.index_of(&commit.validator_address) else {
                continue;
            };
            if by_index
                .insert(index, commit.certificate_signature)
                .is_none()
            {
                weight += params.validators[index].bft_weight;
            }
        }
        if weight < params.certificate_threshold {
            return Ok(None);
        }

        let mut bits = SignerBitfield::new(params.validator_count());
        for index in by_index.keys() {
            bits.set(*index);
        }
        let signatures: Vec<BlsSignature> = by_index.into_values().collect();
        let signature = match BlsSignature::aggregate(&signatures) {
            Ok(sig) => sig,
            Err(e) => {
                warn!(height, error = %e, "Commit aggregation failed");
                return Ok(None);
            }
        };

        Ok(Some(AggregateCommit {
            height,
            aggregation_bits: bits,
            certificate_signature: signature,
        }))
    }

    /// Scan for the greatest certifiable height.
    ///
    /// Starts at `min(next parameter change − 1, max_height_precommitted)`
    /// and walks down to just above `max_height_certified`; the first height
    /// whose pooled weight reaches threshold wins. With no winner the empty
    /// aggregate pinned at `max_height_certified` is returned.
    pub fn select_aggregate_commit(&self) -> Result<AggregateCommit, CommitError> {
        let heights = self.bft.heights();
        let mut upper = heights.max_height_precommitted;
        if let Some(change) = self
            .bft
            .param_store()
            .next_change_at_or_after(heights.max_height_certified + 1)
        {
            upper = upper.min(change.saturating_sub(1));
        }

        let mut height = upper;
        while height > heights.max_height_certified {
            if let Some(aggregate) = self.aggregate_at(height)? {
                debug!(
                    height,
                    signers = aggregate.aggregation_bits.count_set(),
                    "Selected aggregate commit"
                );
                return Ok(aggregate);
            }
            height -= 1;
        }
        Ok(AggregateCommit::empty(heights.max_height_certified))
    }

    /// Periodic maintenance, run once per applied block: evict stale
    /// commits, hand back the fresh ones for gossip, and select the
    /// aggregate for the next proposal.
    pub fn job(&self) -> Result<CommitJobOutput, CommitError> {
        let floor = self.max_removal_height()?;
        let to_gossip = {
            let mut pools = self.pools.lock();
            pools.evict_at_or_below(floor);
            let fresh = std::mem::take(&mut pools.non_gossiped);
            let mut to_gossip = Vec::new();
            for (height, commits) in fresh {
                to_gossip.extend(commits.iter().cloned());
                pools.gossiped.entry(height).or_default().extend(commits);
            }
            to_gossip
        };
        let aggregate = self.select_aggregate_commit()?;
        Ok(CommitJobOutput {
            to_gossip,
            aggregate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_chain::{ChainStorage, StateDiff};
    use meridian_types::{
        Address, BftParameters, Block, Hash, Signature, Slots, Validator, CURRENT_BLOCK_VERSION,
        EMPTY_HASH,
    };
    use tempfile::TempDir;

    struct Fixture {
        chain: Arc<Chain>,
        bft: Arc<BftModule>,
        keys: Vec<BlsSecretKey>,
        _dir: TempDir,
    }

    fn validator_keys(n: u8) -> Vec<BlsSecretKey> {
        (0..n)
            .map(|i| BlsSecretKey::from_seed(&[i + 1; 32]).unwrap())
            .collect()
    }

    fn params_from_keys(keys: &[BlsSecretKey], threshold: u64) -> BftParameters {
        BftParameters {
            certificate_threshold: threshold,
            validators: keys
                .iter()
                .enumerate()
                .map(|(i, k)| Validator {
                    address: Address([i as u8; 20]),
                    generator_key: meridian_types::GeneratorKeys::from_seed(&[i as u8 + 1; 32])
                        .public_key(),
                    bls_public_key: k.public_key(),
                    bft_weight: 1,
                })
                .collect(),
        }
    }

    fn test_block(height: u32, previous: Hash) -> Block {
        Block {
            header: BlockHeader {
                version: CURRENT_BLOCK_VERSION,
                timestamp: 1000 + height * 10,
                height,
                previous_block_id: previous,
                generator_address: Address([(height % 10) as u8; 20]),
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

    /// Chain with blocks 0..=tip, validators v0..v9 weight 1, threshold 7,
    /// and max_height_precommitted forced to `precommitted`.
    fn fixture(tip: u32, precommitted: u32, threshold: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(ChainStorage::open(dir.path()).unwrap());
        let chain = Arc::new(Chain::new(
            storage,
            ChainId([0, 0, 0, 1]),
            Slots::new(1000, 10),
        ));
        let genesis = test_block(0, Hash::ZERO);
        chain.init(&genesis).unwrap();
        let mut previous = genesis.id();
        for h in 1..=tip {
            let block = test_block(h, previous);
            previous = block.id();
            chain
                .save_block(&block, &[], &StateDiff::default(), 0, block.header.timestamp)
                .unwrap();
        }

        let keys = validator_keys(10);
        let bft = Arc::new(BftModule::new(params_from_keys(&keys, threshold)));
        force_precommitted(&bft, precommitted);
        Fixture {
            chain,
            bft,
            keys,
            _dir: dir,
        }
    }

    /// Push max_height_prevoted/precommitted to `height` through synthetic
    /// headers from every validator.
    fn force_precommitted(bft: &BftModule, height: u32) {
        if height == 0 {
            return;
        }
        // Every validator vouches for 1..=height twice: the first pass
        // builds prevote quorum, the second converts it into precommits.
        for pass in 0..2u32 {
            for v in 0u8..10 {
                let mut header = test_block(height + pass, Hash::ZERO).header;
                header.generator_address = Address([v; 20]);
                header.max_height_generated = 0;
                header.height = height + pass;
                bft.observe_header(&header);
            }
        }
        assert!(bft.heights().max_height_precommitted >= height);
    }

    fn commit_for(fixture: &Fixture, height: u32, validator: usize) -> SingleCommit {
        let header = fixture
            .chain
            .get_header_by_height(height)
            .unwrap()
            .unwrap();
        CommitPool::create_single_commit(
            &header,
            Address([validator as u8; 20]),
            &fixture.keys[validator],
            fixture.chain.chain_id(),
        )
    }

    fn pool(fixture: &Fixture) -> CommitPool {
        CommitPool::new(
            CommitPoolConfig::default(),
            Arc::clone(&fixture.chain),
            Arc::clone(&fixture.bft),
        )
    }

    #[test]
    fn add_commit_deduplicates() {
        let fixture = fixture(5, 5, 7);
        let pool = pool(&fixture);
        let commit = commit_for(&fixture, 3, 0);
        assert!(pool.add_commit(commit.clone()));
        assert!(!pool.add_commit(commit.clone()));
        assert_eq!(pool.get_commits_by_height(3).len(), 1);
    }

    #[test]
    fn validate_accepts_a_fresh_commit() {
        let fixture = fixture(5, 5, 7);
        let pool = pool(&fixture);
        let commit = commit_for(&fixture, 3, 0);
        assert!(pool.validate_commit(&commit).unwrap());
    }

    #[test]
    fn validate_rejects_wrong_block_id() {
        let fixture = fixture(5, 5, 7);
        let pool = pool(&fixture);
        let mut commit = commit_for(&fixture, 3, 0);
        commit.block_id = Hash::digest(b"different");
        assert!(!pool.validate_commit(&commit).unwrap());
    }

    #[test]
    fn validate_distinguishes_malicious_from_stale() {
        let fixture = fixture(5, 5, 7);
        let pool = pool(&fixture);

        // Unknown validator address: an error, not a boolean false.
        let mut unknown = commit_for(&fixture, 3, 0);
        unknown.validator_address = Address([99; 20]);
        assert!(matches!(
            pool.validate_commit(&unknown),
            Err(CommitError::InactiveValidator { .. })
        ));

        // Wrong signature: also an error.
        let mut forged = commit_for(&fixture, 3, 0);
        forged.certificate_signature = commit_for(&fixture, 2, 0).certificate_signature;
        assert!(matches!(
            pool.validate_commit(&forged),
            Err(CommitError::InvalidSignature { .. })
        ));

        // A height outside the interesting window: boolean false.
        let out_of_range = commit_for(&fixture, 5, 0);
        let narrow = CommitPool::new(
            CommitPoolConfig { range_stored: 1 },
            Arc::clone(&fixture.chain),
            Arc::clone(&fixture.bft),
        );
        // max_height_precommitted is >= 5; window of width 1 only accepts
        // that exact height, so height 5 passes only if it is the maximum.
        let precommitted = fixture.bft.heights().max_height_precommitted;
        let verdict = narrow.validate_commit(&out_of_range).unwrap();
        assert_eq!(verdict, precommitted == 5);
    }

    #[test]
    fn commit_at_removal_height_fails_above_passes() {
        let fixture = fixture(5, 5, 7);
        // max_removal_height comes from the aggregate commit recorded at the
        // finalized height; the fixture's headers carry empty aggregates at
        // height 0, so the floor is 0.
        let pool = pool(&fixture);
        assert_eq!(pool.max_removal_height().unwrap(), 0);

        let mut at_floor = commit_for(&fixture, 1, 0);
        at_floor.height = 0;
        assert!(!pool.validate_commit(&at_floor).unwrap());

        let above = commit_for(&fixture, 1, 0);
        assert!(pool.validate_commit(&above).unwrap());
    }

    #[test]
    fn selects_greatest_height_reaching_threshold() {
        let fixture = fixture(5, 3, 7);
        let pool = pool(&fixture);

        // Validators v0..v7 commit at heights 1..=3 (threshold is 7).
        for height in 1..=3 {
            for v in 0..8 {
                pool.add_commit(commit_for(&fixture, height, v));
            }
        }

        let aggregate = pool.select_aggregate_commit().unwrap();
        assert_eq!(aggregate.height, 3);
        assert_eq!(aggregate.aggregation_bits.count_set(), 8);
        assert!(pool.verify_aggregate_commit(&aggregate).unwrap());
    }

    #[test]
    fn below_threshold_selects_empty_aggregate() {
        let fixture = fixture(5, 3, 7);
        let pool = pool(&fixture);
        for v in 0..5 {
            pool.add_commit(commit_for(&fixture, 2, v));
        }
        let aggregate = pool.select_aggregate_commit().unwrap();
        assert!(aggregate.is_empty());
        assert_eq!(aggregate.height, 0);
    }

    #[test]
    fn verify_aggregate_rejects_thin_signer_sets() {
        let fixture = fixture(5, 3, 7);
        let pool = pool(&fixture);
        for v in 0..8 {
            pool.add_commit(commit_for(&fixture, 2, v));
        }
        let mut aggregate = pool.select_aggregate_commit().unwrap();
        assert_eq!(aggregate.height, 2);

        // Claiming fewer signers than the threshold must fail, even with the
        // same signature bytes.
        aggregate.aggregation_bits = {
            let mut bits = SignerBitfield::new(10);
            bits.set(0);
            bits
        };
        assert!(!pool.verify_aggregate_commit(&aggregate).unwrap());
    }

    #[test]
    fn empty_aggregate_only_valid_at_certified_height() {
        let fixture = fixture(5, 3, 7);
        let pool = pool(&fixture);
        assert!(pool
            .verify_aggregate_commit(&AggregateCommit::empty(0))
            .unwrap());
        assert!(!pool
            .verify_aggregate_commit(&AggregateCommit::empty(2))
            .unwrap());
    }

    #[test]
    fn job_evicts_commits_at_or_below_removal_height() {
        let fixture = fixture(5, 3, 7);
        // Advance finality: the header at the finalized height records an
        // aggregate pinned at height 2, which becomes the eviction floor.
        let tip = fixture.chain.last_block();
        let mut sealed = test_block(6, tip.id());
        sealed.header.aggregate_commit = AggregateCommit::empty(2);
        fixture
            .chain
            .save_block(&sealed, &[], &StateDiff::default(), 6, sealed.header.timestamp)
            .unwrap();

        let pool = pool(&fixture);
        assert_eq!(pool.max_removal_height().unwrap(), 2);
        for height in 1..=3 {
            for v in 0..2 {
                pool.add_commit(commit_for(&fixture, height, v));
            }
        }

        let output = pool.job().unwrap();
        // Only commits above the floor survive and get gossiped.
        assert_eq!(output.to_gossip.len(), 2);
        assert!(output.to_gossip.iter().all(|c| c.height == 3));
        assert!(pool.get_commits_by_height(1).is_empty());
        assert!(pool.get_commits_by_height(2).is_empty());
        assert_eq!(pool.get_commits_by_height(3).len(), 2);
    }

    #[test]
    fn job_moves_commits_to_gossiped_once() {
        let fixture = fixture(5, 3, 7);
        let pool = pool(&fixture);
        for v in 0..8 {
            pool.add_commit(commit_for(&fixture, 3, v));
        }

        let first = pool.job().unwrap();
        assert_eq!(first.to_gossip.len(), 8);
        assert_eq!(first.aggregate.height, 3);

        // Second round: nothing new to gossip, commits still aggregatable.
        let second = pool.job().unwrap();
        assert!(second.to_gossip.is_empty());
        assert_eq!(second.aggregate.height, 3);
        assert_eq!(pool.get_commits_by_height(3).len(), 8);
    }
}
