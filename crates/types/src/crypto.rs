//! Cryptographic keys and signatures.
//!
//! Two signature schemes are in play:
//!
//! - **Ed25519** generator keys sign block headers. One signature per block,
//!   verified against the generator authorized for the slot.
//! - **BLS12-381** validator keys sign finality certificates. Signatures over
//!   the same certificate message aggregate into a single group element that
//!   is verified against the public keys selected by the aggregation bits.

use crate::hash::{Address, Hash};
use ed25519_dalek::{Signer, Verifier};
use thiserror::Error;

pub const BLS_PUBLIC_KEY_LENGTH: usize = 48;
pub const BLS_SIGNATURE_LENGTH: usize = 96;

/// Domain separation tag for BLS certificate signatures (proof-of-possession
/// scheme: all signers sign the identical message).
const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid Ed25519 public key")]
    InvalidGeneratorKey,

    #[error("Invalid BLS public key")]
    InvalidBlsKey,

    #[error("Invalid BLS signature encoding")]
    InvalidBlsSignature,

    #[error("Cannot aggregate an empty signature set")]
    EmptyAggregation,

    #[error("BLS key generation rejected the provided seed")]
    KeyGen,
}

// ═══════════════════════════════════════════════════════════════════════════
// Ed25519 (block generators)
// ═══════════════════════════════════════════════════════════════════════════

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// All-zero placeholder, used before a header is signed and in tests.
    pub fn zero() -> Self {
        Signature([0u8; 64])
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

/// A generator's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, sbor::prelude::BasicSbor)]
pub struct GeneratorPublicKey(pub [u8; 32]);

impl GeneratorPublicKey {
    /// The account address: the first 20 bytes of the SHA-256 digest of the
    /// public key.
    pub fn address(&self) -> Address {
        let digest = Hash::digest(&self.0);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest.as_bytes()[..20]);
        Address(address)
    }

    /// Verify an Ed25519 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(message, &sig).is_ok()
    }
}

impl std::fmt::Debug for GeneratorPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A generator's Ed25519 signing key pair.
pub struct GeneratorKeys {
    signing: ed25519_dalek::SigningKey,
}

impl GeneratorKeys {
    /// Derive a key pair deterministically from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> GeneratorPublicKey {
        GeneratorPublicKey(self.signing.verifying_key().to_bytes())
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message).to_bytes())
    }
}

impl std::fmt::Debug for GeneratorKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorKeys")
            .field("public_key", &self.public_key())
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BLS12-381 (finality certificates)
// ═══════════════════════════════════════════════════════════════════════════

/// A compressed BLS12-381 G1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, sbor::prelude::BasicSbor)]
pub struct BlsPublicKey(pub [u8; BLS_PUBLIC_KEY_LENGTH]);

impl BlsPublicKey {
    fn decode(&self) -> Result<blst::min_pk::PublicKey, CryptoError> {
        blst::min_pk::PublicKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidBlsKey)
    }
}

impl std::fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

/// A compressed BLS12-381 G2 signature, single or aggregated.
#[derive(Clone, Copy, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlsSignature(pub [u8; BLS_SIGNATURE_LENGTH]);

impl BlsSignature {
    /// All-zero placeholder: the "no signature" value of an empty aggregate
    /// commit. Never a valid group element.
    pub fn zero() -> Self {
        BlsSignature([0u8; BLS_SIGNATURE_LENGTH])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; BLS_SIGNATURE_LENGTH]
    }

    fn decode(&self) -> Result<blst::min_pk::Signature, CryptoError> {
        blst::min_pk::Signature::from_bytes(&self.0).map_err(|_| CryptoError::InvalidBlsSignature)
    }

    /// Verify this as a single signature by `public_key` over `message`.
    pub fn verify(&self, public_key: &BlsPublicKey, message: &[u8]) -> bool {
        let (Ok(sig), Ok(pk)) = (self.decode(), public_key.decode()) else {
            return false;
        };
        sig.verify(true, message, BLS_DST, &[], &pk, true) == blst::BLST_ERROR::BLST_SUCCESS
    }

    /// Aggregate single signatures over the same message.
    pub fn aggregate(signatures: &[BlsSignature]) -> Result<BlsSignature, CryptoError> {
        if signatures.is_empty() {
            return Err(CryptoError::EmptyAggregation);
        }
        let decoded: Vec<blst::min_pk::Signature> = signatures
            .iter()
            .map(|s| s.decode())
            .collect::<Result<_, _>>()?;
        let refs: Vec<&blst::min_pk::Signature> = decoded.iter().collect();
        let agg = blst::min_pk::AggregateSignature::aggregate(&refs, true)
            .map_err(|_| CryptoError::InvalidBlsSignature)?;
        Ok(BlsSignature(agg.to_signature().to_bytes()))
    }

    /// Verify an aggregated signature over one shared `message` against the
    /// selected signer public keys.
    pub fn verify_aggregate(&self, public_keys: &[BlsPublicKey], message: &[u8]) -> bool {
        if public_keys.is_empty() || self.is_zero() {
            return false;
        }
        let Ok(sig) = self.decode() else {
            return false;
        };
        let Ok(decoded) = public_keys
            .iter()
            .map(|pk| pk.decode())
            .collect::<Result<Vec<_>, _>>()
        else {
            return false;
        };
        let refs: Vec<&blst::min_pk::PublicKey> = decoded.iter().collect();
        sig.fast_aggregate_verify(true, message, BLS_DST, &refs)
            == blst::BLST_ERROR::BLST_SUCCESS
    }
}

impl std::fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

/// A validator's BLS signing key.
pub struct BlsSecretKey {
    secret: blst::min_pk::SecretKey,
}

impl BlsSecretKey {
    /// Derive a key deterministically from seed material (at least 32 bytes).
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let secret =
            blst::min_pk::SecretKey::key_gen(seed, &[]).map_err(|_| CryptoError::KeyGen)?;
        Ok(Self { secret })
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey(self.secret.sk_to_pk().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        BlsSignature(self.secret.sign(message, BLS_DST, &[]).to_bytes())
    }
}

impl std::fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsSecretKey")
            .field("public_key", &self.public_key())
            .finish()
    }
}
