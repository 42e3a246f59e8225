//! Finality certificates and commits.
//!
//! Validators attest to finality by BLS-signing the *certificate* derived
//! from a block header. Single commits circulate through the commit pool and
//! are aggregated into an [`AggregateCommit`] once the weighted signer set
//! reaches the certificate threshold; the chosen aggregate is then embedded
//! in a later block header and becomes permanent.

use crate::codec::{CanonicalReader, CanonicalWriter, CodecError};
use crate::crypto::BlsSignature;
use crate::hash::{Address, ChainId, Hash};
use crate::signer_bitfield::SignerBitfield;

/// Domain separator preceding certificate bytes under the BLS signature.
/// Concatenated with the chain identifier; byte-exact on the wire.
pub const MESSAGE_TAG_CERTIFICATE: &[u8] = b"LSK_CE_";

/// The tuple validators sign to attest finality of a block.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Certificate {
    pub block_id: Hash,
    pub height: u32,
    pub timestamp: u32,
    pub state_root: Hash,
    pub validators_hash: Hash,
}

impl Certificate {
    /// The tagged message a validator BLS-signs:
    /// `MESSAGE_TAG_CERTIFICATE ∥ chain_id ∥ canonical certificate`.
    pub fn signing_bytes(&self, chain_id: &ChainId) -> Vec<u8> {
        let mut w = CanonicalWriter::with_capacity(MESSAGE_TAG_CERTIFICATE.len() + 4 + 104);
        w.put_fixed(MESSAGE_TAG_CERTIFICATE);
        w.put_fixed(&chain_id.0);
        w.put_hash(&self.block_id);
        w.put_u32(self.height);
        w.put_u32(self.timestamp);
        w.put_hash(&self.state_root);
        w.put_hash(&self.validators_hash);
        w.into_bytes()
    }
}

/// One validator's certificate signature for one height.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct SingleCommit {
    pub block_id: Hash,
    pub height: u32,
    pub validator_address: Address,
    pub certificate_signature: BlsSignature,
}

/// A threshold subset's aggregated certificate signature.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct AggregateCommit {
    pub height: u32,
    /// Signers, as bits over the active validator set at `height` ordered by
    /// validator index.
    pub aggregation_bits: SignerBitfield,
    pub certificate_signature: BlsSignature,
}

impl AggregateCommit {
    /// The "no new certificate" aggregate carried while no height reaches
    /// threshold: empty bits, zero signature, height pinned to the last
    /// certified height.
    pub fn empty(height: u32) -> Self {
        Self {
            height,
            aggregation_bits: SignerBitfield::empty(),
            certificate_signature: BlsSignature::zero(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aggregation_bits.is_empty() && self.certificate_signature.is_zero()
    }

    /// Canonical encoding, embedded in the block header's canonical form.
    pub fn encode_canonical(&self, w: &mut CanonicalWriter) {
        w.put_u32(self.height);
        w.put_bytes(self.aggregation_bits.as_bytes());
        w.put_fixed(&self.certificate_signature.0);
    }

    pub fn decode_canonical(r: &mut CanonicalReader<'_>) -> Result<Self, CodecError> {
        let height = r.get_u32()?;
        let bits = r.get_bytes()?;
        let signature: [u8; 96] = r.get_fixed()?;
        Ok(Self {
            height,
            aggregation_bits: SignerBitfield::from_bytes(bits),
            certificate_signature: BlsSignature(signature),
        })
    }
}
