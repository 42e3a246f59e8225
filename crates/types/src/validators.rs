//! Validator sets and BFT parameters.

use crate::codec::CanonicalWriter;
use crate::crypto::{BlsPublicKey, GeneratorPublicKey};
use crate::hash::{Address, Hash};
use crate::slots::Slots;

/// An active validator at some height window.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Validator {
    /// Account address of the validator's generator key.
    pub address: Address,
    /// Ed25519 key that signs block headers.
    pub generator_key: GeneratorPublicKey,
    /// BLS key used for certificate signatures.
    pub bls_public_key: BlsPublicKey,
    /// Weight contributed towards prevote/precommit/certificate thresholds.
    pub bft_weight: u64,
}

/// The BFT parameters in force over a window of heights.
///
/// Parameters are piecewise-constant: they change only at explicitly stored
/// parameter-change heights, and lookups resolve to the closest change at or
/// below the queried height.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BftParameters {
    /// Aggregate weight an aggregate commit must reach.
    pub certificate_threshold: u64,
    /// Active validators, ordered by validator index. Aggregation bits and
    /// slot authorization both follow this order.
    pub validators: Vec<Validator>,
}

impl BftParameters {
    pub fn total_weight(&self) -> u64 {
        self.validators.iter().map(|v| v.bft_weight).sum()
    }

    /// Prevote quorum: strictly more than two thirds of the total weight.
    pub fn prevote_threshold(&self) -> u64 {
        self.total_weight() * 2 / 3 + 1
    }

    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }

    pub fn validator_at(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators.iter().position(|v| v.address == *address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    /// The generator authorized for a slot: round-robin over the validator
    /// list by slot index.
    pub fn generator_for_slot(&self, slot: i64) -> Option<&Validator> {
        if self.validators.is_empty() || slot < 0 {
            return None;
        }
        let index = (slot as u64 % self.validators.len() as u64) as usize;
        self.validators.get(index)
    }

    /// Convenience: the authorized generator for a timestamp.
    pub fn generator_for_timestamp(&self, slots: &Slots, timestamp: u32) -> Option<&Validator> {
        self.generator_for_slot(slots.slot_of(timestamp))
    }

    /// Hash committing to the set: canonical encoding of threshold and each
    /// validator's (address, keys, weight), in index order.
    pub fn validators_hash(&self) -> Hash {
        let mut w = CanonicalWriter::with_capacity(8 + self.validators.len() * 108);
        w.put_u64(self.certificate_threshold);
        w.put_u32(self.validators.len() as u32);
        for validator in &self.validators {
            w.put_address(&validator.address);
            w.put_fixed(&validator.generator_key.0);
            w.put_fixed(&validator.bls_public_key.0);
            w.put_u64(validator.bft_weight);
        }
        Hash::digest(&w.into_bytes())
    }
}

/// The three monotone heights the BFT layer maintains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BftHeights {
    /// Greatest height with a prevote quorum observed locally.
    pub max_height_prevoted: u32,
    /// Greatest height with a precommit quorum observed locally.
    pub max_height_precommitted: u32,
    /// Greatest height with a stored aggregate commit.
    pub max_height_certified: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BlsSecretKey, GeneratorKeys};

    fn test_params(n: u8) -> BftParameters {
        BftParameters {
            certificate_threshold: u64::from(n) * 2 / 3 + 1,
            validators: (0..n)
                .map(|i| Validator {
                    address: Address([i; 20]),
                    generator_key: GeneratorKeys::from_seed(&[i + 1; 32]).public_key(),
                    bls_public_key: BlsSecretKey::from_seed(&[i + 1; 32]).unwrap().public_key(),
                    bft_weight: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn round_robin_generator() {
        let params = test_params(5);
        assert_eq!(params.generator_for_slot(0).unwrap().address, Address([0; 20]));
        assert_eq!(params.generator_for_slot(4).unwrap().address, Address([4; 20]));
        assert_eq!(params.generator_for_slot(5).unwrap().address, Address([0; 20]));
        assert!(params.generator_for_slot(-1).is_none());
    }

    #[test]
    fn thresholds() {
        let params = test_params(10);
        assert_eq!(params.total_weight(), 10);
        assert_eq!(params.prevote_threshold(), 7);
    }

    #[test]
    fn validators_hash_changes_with_membership() {
        let a = test_params(4);
        let b = test_params(5);
        assert_ne!(a.validators_hash(), b.validators_hash());
        assert_eq!(a.validators_hash(), test_params(4).validators_hash());
    }
}
