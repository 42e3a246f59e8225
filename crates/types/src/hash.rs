//! Hashes, addresses and the chain identifier.

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, sbor::prelude::BasicSbor)]
pub struct Hash(pub [u8; 32]);

/// The hash of the empty byte string. Used as the transaction root of an
/// empty payload and as the root of an empty merkle tree.
pub const EMPTY_HASH: Hash = Hash([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9,
    0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52,
    0xb8, 0x55,
]);

impl Hash {
    /// The zero hash (all bytes 0x00).
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Hash arbitrary bytes with SHA-256.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Wrap raw digest bytes without hashing.
    pub fn from_digest_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A 20-byte account address, derived from the first 20 bytes of the
/// SHA-256 digest of a generator public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, sbor::prelude::BasicSbor)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// The 4-byte network identifier, mixed into every tagged signing message to
/// prevent cross-network replay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, sbor::prelude::BasicSbor)]
pub struct ChainId(pub [u8; 4]);

impl std::fmt::Debug for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Compute the binary merkle root of a list of leaf hashes.
///
/// Pairs are combined with SHA-256 over the concatenated digests; an odd
/// node at the end of a level is promoted unchanged. The root of an empty
/// list is [`EMPTY_HASH`].
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return EMPTY_HASH;
    }
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(pair[0].as_bytes());
                buf[32..].copy_from_slice(pair[1].as_bytes());
                next.push(Hash::digest(&buf));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_hash_matches_sha256_of_nothing() {
        assert_eq!(Hash::digest(&[]), EMPTY_HASH);
    }

    #[test]
    fn merkle_root_of_empty_is_empty_hash() {
        assert_eq!(merkle_root(&[]), EMPTY_HASH);
    }

    #[test]
    fn merkle_root_of_single_leaf_is_the_leaf() {
        let leaf = Hash::digest(b"leaf");
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn merkle_root_combines_pairs() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(a.as_bytes());
        buf[32..].copy_from_slice(b.as_bytes());
        assert_eq!(merkle_root(&[a, b]), Hash::digest(&buf));
    }

    #[test]
    fn merkle_root_promotes_odd_leaf() {
        let a = Hash::digest(b"a");
        let b = Hash::digest(b"b");
        let c = Hash::digest(b"c");
        // Level 1: [H(a||b), c], level 2: H(H(a||b)||c)
        let ab = merkle_root(&[a, b]);
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(ab.as_bytes());
        buf[32..].copy_from_slice(c.as_bytes());
        assert_eq!(merkle_root(&[a, b, c]), Hash::digest(&buf));
    }
}
