//! Vote-derived BFT heights.
//!
//! Every applied header is an implicit prevote by its generator for the
//! height range `(max_height_generated, height]`, and an implicit precommit
//! for every height the generator has prevoted once that height has reached
//! the prevote quorum. The tracker folds applied headers into per-height
//! weight sums and exposes the monotone `max_height_prevoted` /
//! `max_height_precommitted`; `max_height_certified` follows the aggregate
//! commits embedded in applied headers.

use crate::params::BftParamStore;
use meridian_types::{Address, BftHeights, BftParameters, BlockHeader};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

#[derive(Debug, Default, Clone, Copy)]
struct GeneratorVotes {
    largest_prevote: u32,
    largest_precommit: u32,
}

/// Accumulates implicit prevotes and precommits from applied headers.
#[derive(Debug, Default)]
pub struct HeightTracker {
    prevote_weight: BTreeMap<u32, u64>,
    precommit_weight: BTreeMap<u32, u64>,
    generators: HashMap<Address, GeneratorVotes>,
    heights: BftHeights,
}

impl HeightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heights(&self) -> BftHeights {
        self.heights
    }

    /// Fold one applied header into the vote ledger.
    pub fn observe_header(&mut self, header: &BlockHeader, params: &BftParameters) {
        let Some(index) = params.index_of(&header.generator_address) else {
            return;
        };
        let weight = params.validators[index].bft_weight;
        let threshold = params.prevote_threshold();
        let votes = self
            .generators
            .entry(header.generator_address)
            .or_default();

        // Precommits: every prevoted height that has since reached quorum.
        for h in votes.largest_precommit + 1..=votes.largest_prevote.min(header.height) {
            if self.prevote_weight.get(&h).copied().unwrap_or(0) >= threshold {
                *self.precommit_weight.entry(h).or_insert(0) += weight;
                votes.largest_precommit = h;
            }
        }

        // Prevotes: the range this header vouches for, skipping heights the
        // generator already prevoted.
        let start = header
            .max_height_generated
            .saturating_add(1)
            .max(votes.largest_prevote + 1);
        for h in start..=header.height {
            *self.prevote_weight.entry(h).or_insert(0) += weight;
        }
        if header.height > votes.largest_prevote {
            votes.largest_prevote = header.height;
        }

        // Recompute the monotone quorum heights.
        let prevoted = self
            .prevote_weight
            .iter()
            .rev()
            .find(|(_, w)| **w >= threshold)
            .map(|(h, _)| *h)
            .unwrap_or(0);
        let precommitted = self
            .precommit_weight
            .iter()
            .rev()
            .find(|(_, w)| **w >= threshold)
            .map(|(h, _)| *h)
            .unwrap_or(0);
        self.heights.max_height_prevoted = self.heights.max_height_prevoted.max(prevoted);
        self.heights.max_height_precommitted =
            self.heights.max_height_precommitted.max(precommitted);

        trace!(
            height = header.height,
            max_height_prevoted = self.heights.max_height_prevoted,
            max_height_precommitted = self.heights.max_height_precommitted,
            "Observed header"
        );

        if !header.aggregate_commit.is_empty() {
            self.observe_certified(header.aggregate_commit.height);
        }
    }

    /// Record a stored aggregate commit.
    pub fn observe_certified(&mut self, height: u32) {
        self.heights.max_height_certified = self.heights.max_height_certified.max(height);
    }

    /// Drop vote bookkeeping below `height` (heights at or below the
    /// finalized height can no longer change).
    pub fn prune_below(&mut self, height: u32) {
        self.prevote_weight = self.prevote_weight.split_off(&height);
        self.precommit_weight = self.precommit_weight.split_off(&height);
    }
}

/// The BFT module: parameter store plus height tracker.
pub struct BftModule {
    params: BftParamStore,
    tracker: Mutex<HeightTracker>,
}

impl BftModule {
    pub fn new(genesis_params: BftParameters) -> Self {
        Self {
            params: BftParamStore::new(genesis_params),
            tracker: Mutex::new(HeightTracker::new()),
        }
    }

    pub fn param_store(&self) -> &BftParamStore {
        &self.params
    }

    pub fn params_at(&self, height: u32) -> BftParameters {
        self.params.params_at(height)
    }

    pub fn heights(&self) -> BftHeights {
        self.tracker.lock().heights()
    }

    /// Fold an applied header into the vote ledger.
    pub fn observe_header(&self, header: &BlockHeader) {
        let params = self.params.params_at(header.height);
        self.tracker.lock().observe_header(header, &params);
    }

    pub fn observe_certified(&self, height: u32) {
        self.tracker.lock().observe_certified(height);
    }

    pub fn prune_below(&self, height: u32) {
        self.tracker.lock().prune_below(height);
    }

    /// Rebuild the vote ledger from a window of headers after a chain
    /// revert. Certified and quorum heights stay monotone: a revert never
    /// lowers them below what was already observed.
    pub fn recompute_from(&self, headers: &[BlockHeader]) {
        let mut tracker = self.tracker.lock();
        let prior = tracker.heights();
        let mut fresh = HeightTracker::new();
        fresh.heights.max_height_certified = prior.max_height_certified;
        for header in headers {
            let params = self.params.params_at(header.height);
            fresh.observe_header(header, &params);
        }
        fresh.heights.max_height_prevoted =
            fresh.heights.max_height_prevoted.max(prior.max_height_prevoted);
        fresh.heights.max_height_precommitted = fresh
            .heights
            .max_height_precommitted
            .max(prior.max_height_precommitted);
        *tracker = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{
        AggregateCommit, BlsSecretKey, Hash, Signature, Validator, CURRENT_BLOCK_VERSION,
        EMPTY_HASH,
    };

    fn params(n: u8) -> BftParameters {
        BftParameters {
            certificate_threshold: u64::from(n) * 2 / 3 + 1,
            validators: (0..n)
                .map(|i| Validator {
                    address: Address([i; 20]),
                    generator_key: meridian_types::GeneratorKeys::from_seed(&[i + 1; 32])
                        .public_key(),
                    bls_public_key: BlsSecretKey::from_seed(&[i + 1; 32]).unwrap().public_key(),
                    bft_weight: 1,
                })
                .collect(),
        }
    }

    fn header(height: u32, generator: u8, max_height_generated: u32) -> BlockHeader {
        BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            timestamp: height * 10,
            height,
            previous_block_id: Hash::ZERO,
            generator_address: Address([generator; 20]),
            transaction_root: EMPTY_HASH,
            state_root: Hash::ZERO,
            validators_hash: Hash::ZERO,
            aggregate_commit: AggregateCommit::empty(0),
            max_height_generated,
            max_height_prevoted: 0,
            signature: Signature::zero(),
        }
    }

    #[test]
    fn prevote_quorum_advances_max_height_prevoted() {
        let module = BftModule::new(params(4)); // threshold 3
        // Three different generators each vouch for height 1.
        module.observe_header(&header(1, 0, 0));
        assert_eq!(module.heights().max_height_prevoted, 0);
        module.observe_header(&header(2, 1, 0));
        assert_eq!(module.heights().max_height_prevoted, 0);
        module.observe_header(&header(3, 2, 0));
        // Generators 0,1,2 all prevoted height 1 → quorum there.
        assert_eq!(module.heights().max_height_prevoted, 1);
    }

    #[test]
    fn precommits_follow_prevote_quorum() {
        let module = BftModule::new(params(4));
        // Rounds of blocks by rotating generators. max_height_generated is
        // each generator's own previous height; each new block lets its
        // generator precommit the heights that reached prevote quorum.
        let mut last_generated = [0u32; 4];
        for round in 0u32..4 {
            for g in 0u8..4 {
                let height = round * 4 + u32::from(g) + 1;
                module.observe_header(&header(height, g, last_generated[g as usize]));
                last_generated[g as usize] = height;
            }
        }
        let heights = module.heights();
        assert!(heights.max_height_prevoted >= heights.max_height_precommitted);
        assert!(heights.max_height_precommitted > 0);
    }

    #[test]
    fn unknown_generator_is_ignored() {
        let module = BftModule::new(params(4));
        module.observe_header(&header(1, 99, 0));
        assert_eq!(module.heights().max_height_prevoted, 0);
    }

    #[test]
    fn aggregate_commit_advances_certified() {
        let module = BftModule::new(params(4));
        let mut h = header(5, 0, 0);
        h.aggregate_commit = AggregateCommit {
            height: 3,
            aggregation_bits: meridian_types::SignerBitfield::new(4),
            certificate_signature: meridian_types::BlsSignature([1u8; 96]),
        };
        module.observe_header(&h);
        assert_eq!(module.heights().max_height_certified, 3);
        // Never decreases.
        module.observe_certified(1);
        assert_eq!(module.heights().max_height_certified, 3);
    }

    #[test]
    fn recompute_preserves_monotone_heights() {
        let module = BftModule::new(params(4));
        module.observe_header(&header(1, 0, 0));
        module.observe_header(&header(2, 1, 0));
        module.observe_header(&header(3, 2, 0));
        let before = module.heights();
        assert_eq!(before.max_height_prevoted, 1);

        // Revert to a window that alone would not reach quorum.
        module.recompute_from(&[header(1, 0, 0)]);
        let after = module.heights();
        assert_eq!(after.max_height_prevoted, before.max_height_prevoted);
    }

    #[test]
    fn double_prevote_is_not_counted() {
        let module = BftModule::new(params(4));
        // The same generator proposing twice cannot push height 1 to quorum
        // by itself.
        module.observe_header(&header(1, 0, 0));
        module.observe_header(&header(2, 0, 0));
        module.observe_header(&header(3, 0, 0));
        assert_eq!(module.heights().max_height_prevoted, 0);
    }
}
