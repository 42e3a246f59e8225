//! Blocks and block headers.

use crate::codec::{CanonicalReader, CanonicalWriter, CodecError};
use crate::commit::{AggregateCommit, Certificate};
use crate::crypto::{GeneratorKeys, GeneratorPublicKey, Signature};
use crate::hash::{merkle_root, Address, ChainId, Hash};
use crate::transaction::Transaction;

/// Current block version. Headers with any other version are rejected with a
/// peer penalty.
pub const CURRENT_BLOCK_VERSION: u32 = 2;

/// Domain separator for header signatures.
const MESSAGE_TAG_BLOCK_HEADER: &[u8] = b"LSK_BH_";

/// The consensus-relevant part of a block.
///
/// The canonical form (fixed field order, big-endian fixed-width integers,
/// length-prefixed variable fields) is wire-normative: the id is the SHA-256
/// digest of the canonical encoding, and the generator signature covers the
/// tagged canonical encoding without the signature field.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlockHeader {
    pub version: u32,
    /// Seconds; must fall into the generator's authorized slot.
    pub timestamp: u32,
    pub height: u32,
    pub previous_block_id: Hash,
    pub generator_address: Address,
    /// Merkle root over the payload transaction ids.
    pub transaction_root: Hash,
    pub state_root: Hash,
    /// Commitment to the active validator set at this height.
    pub validators_hash: Hash,
    /// The aggregate commit this generator selected; empty when no height
    /// reached threshold since the last certified one.
    pub aggregate_commit: AggregateCommit,
    /// Highest height this generator has previously proposed on any chain.
    pub max_height_generated: u32,
    /// Highest height with a prevote quorum observed by the generator.
    pub max_height_prevoted: u32,
    pub signature: Signature,
}

impl BlockHeader {
    fn encode_unsigned(&self, w: &mut CanonicalWriter) {
        w.put_u32(self.version);
        w.put_u32(self.timestamp);
        w.put_u32(self.height);
        w.put_hash(&self.previous_block_id);
        w.put_address(&self.generator_address);
        w.put_hash(&self.transaction_root);
        w.put_hash(&self.state_root);
        w.put_hash(&self.validators_hash);
        self.aggregate_commit.encode_canonical(w);
        w.put_u32(self.max_height_generated);
        w.put_u32(self.max_height_prevoted);
    }

    /// Canonical encoding including the signature.
    pub fn encode_canonical(&self, w: &mut CanonicalWriter) {
        self.encode_unsigned(w);
        w.put_fixed(&self.signature.0);
    }

    pub fn decode_canonical(r: &mut CanonicalReader<'_>) -> Result<Self, CodecError> {
        let version = r.get_u32()?;
        let timestamp = r.get_u32()?;
        let height = r.get_u32()?;
        let previous_block_id = r.get_hash()?;
        let generator_address = r.get_address()?;
        let transaction_root = r.get_hash()?;
        let state_root = r.get_hash()?;
        let validators_hash = r.get_hash()?;
        let aggregate_commit = AggregateCommit::decode_canonical(r)?;
        let max_height_generated = r.get_u32()?;
        let max_height_prevoted = r.get_u32()?;
        let signature: [u8; 64] = r.get_fixed()?;
        Ok(Self {
            version,
            timestamp,
            height,
            previous_block_id,
            generator_address,
            transaction_root,
            state_root,
            validators_hash,
            aggregate_commit,
            max_height_generated,
            max_height_prevoted,
            signature: Signature(signature),
        })
    }

    /// The block id: SHA-256 of the canonical header.
    pub fn id(&self) -> Hash {
        let mut w = CanonicalWriter::with_capacity(256);
        self.encode_canonical(&mut w);
        Hash::digest(&w.into_bytes())
    }

    /// The tagged message the generator signs.
    pub fn signing_bytes(&self, chain_id: &ChainId) -> Vec<u8> {
        let mut w = CanonicalWriter::with_capacity(256);
        w.put_fixed(MESSAGE_TAG_BLOCK_HEADER);
        w.put_fixed(&chain_id.0);
        self.encode_unsigned(&mut w);
        w.into_bytes()
    }

    /// Sign with the generator key, filling in the signature field.
    pub fn sign(&mut self, keys: &GeneratorKeys, chain_id: &ChainId) {
        self.signature = keys.sign(&self.signing_bytes(chain_id));
    }

    /// Verify the generator signature against the given public key.
    pub fn verify_signature(&self, public_key: &GeneratorPublicKey, chain_id: &ChainId) -> bool {
        public_key.verify(&self.signing_bytes(chain_id), &self.signature)
    }

    /// The certificate validators sign to finalize this header.
    pub fn certificate(&self) -> Certificate {
        Certificate {
            block_id: self.id(),
            height: self.height,
            timestamp: self.timestamp,
            state_root: self.state_root,
            validators_hash: self.validators_hash,
        }
    }
}

/// A named asset entry contributed by a module to the block.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlockAssetEntry {
    pub module: String,
    pub data: Vec<u8>,
}

/// A full block: header, module assets and transaction payload.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Block {
    pub header: BlockHeader,
    pub assets: Vec<BlockAssetEntry>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn id(&self) -> Hash {
        self.header.id()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    /// Merkle root of the payload's transaction ids.
    pub fn compute_transaction_root(&self) -> Hash {
        let ids: Vec<Hash> = self.transactions.iter().map(|tx| tx.id()).collect();
        merkle_root(&ids)
    }

    /// Wire form: canonical header ∥ payload-length ∥ payload.
    ///
    /// The payload is the SBOR encoding of (assets, transactions); only the
    /// header is canonical, the payload is committed to through the
    /// transaction root.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = sbor::basic_encode(&(&self.assets, &self.transactions))
            .expect("block payload encoding cannot fail");
        let mut w = CanonicalWriter::with_capacity(256 + payload.len());
        self.header.encode_canonical(&mut w);
        w.put_bytes(&payload);
        w.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = CanonicalReader::new(bytes);
        let header = BlockHeader::decode_canonical(&mut r)?;
        let payload = r.get_bytes()?;
        r.finish()?;
        let (assets, transactions): (Vec<BlockAssetEntry>, Vec<Transaction>) =
            sbor::basic_decode(&payload).map_err(|_| CodecError::InvalidPayload)?;
        Ok(Self {
            header,
            assets,
            transactions,
        })
    }
}
