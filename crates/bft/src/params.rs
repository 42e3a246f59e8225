//! Piecewise-constant BFT parameters.

use meridian_types::BftParameters;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// BFT parameters keyed by the height they take effect at.
///
/// Parameters change only at explicitly stored change heights; a lookup for
/// height `h` resolves to the entry with the greatest change height ≤ `h`.
pub struct BftParamStore {
    inner: RwLock<BTreeMap<u32, BftParameters>>,
}

impl BftParamStore {
    /// Create a store with the parameters in force from genesis.
    pub fn new(genesis_params: BftParameters) -> Self {
        let mut map = BTreeMap::new();
        map.insert(0, genesis_params);
        Self {
            inner: RwLock::new(map),
        }
    }

    /// Install new parameters taking effect at `height`.
    pub fn insert(&self, height: u32, params: BftParameters) {
        self.inner.write().insert(height, params);
    }

    /// The parameters in force at `height`.
    pub fn params_at(&self, height: u32) -> BftParameters {
        self.inner
            .read()
            .range(..=height)
            .next_back()
            .map(|(_, p)| p.clone())
            .expect("genesis parameters installed at construction")
    }

    /// The first parameter-change height at or after `height`, if any.
    pub fn next_change_at_or_after(&self, height: u32) -> Option<u32> {
        self.inner.read().range(height..).next().map(|(h, _)| *h)
    }

    /// True if `height` is exactly a stored parameter-change height.
    pub fn is_change_height(&self, height: u32) -> bool {
        self.inner.read().contains_key(&height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{Address, BlsSecretKey, GeneratorKeys, Validator};

    fn params(n: u8) -> BftParameters {
        BftParameters {
            certificate_threshold: u64::from(n),
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
    fn lookup_is_piecewise_constant() {
        let store = BftParamStore::new(params(4));
        store.insert(100, params(5));

        assert_eq!(store.params_at(0).validator_count(), 4);
        assert_eq!(store.params_at(99).validator_count(), 4);
        assert_eq!(store.params_at(100).validator_count(), 5);
        assert_eq!(store.params_at(5000).validator_count(), 5);
    }

    #[test]
    fn next_change_lookup() {
        let store = BftParamStore::new(params(4));
        store.insert(100, params(5));

        assert_eq!(store.next_change_at_or_after(1), Some(100));
        assert_eq!(store.next_change_at_or_after(100), Some(100));
        assert_eq!(store.next_change_at_or_after(101), None);
        assert!(store.is_change_height(100));
        assert!(!store.is_change_height(99));
    }
}
