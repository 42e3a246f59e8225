//! Transactions.
//!
//! The consensus core only performs static checks (signature, nonce,
//! structural validity); the semantics of each (module, command) pair are
//! dispatched to registered module handlers.

use crate::codec::{CanonicalReader, CanonicalWriter, CodecError};
use crate::crypto::{GeneratorPublicKey, Signature};
use crate::hash::{Address, ChainId, Hash};

/// Domain separator for transaction signatures.
pub const MESSAGE_TAG_TRANSACTION: &[u8] = b"LSK_TX_";

/// A user transaction carried in a block payload.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct Transaction {
    /// Module the command belongs to (e.g. "token").
    pub module: String,
    /// Command name within the module (e.g. "transfer").
    pub command: String,
    /// Sender nonce; must equal the sender's stored nonce at execution time.
    pub nonce: u64,
    pub fee: u64,
    pub sender_public_key: GeneratorPublicKey,
    /// Module-specific parameters, opaque to the core.
    pub params: Vec<u8>,
    pub signature: Signature,
}

impl Transaction {
    pub fn sender_address(&self) -> Address {
        self.sender_public_key.address()
    }

    /// Canonical encoding without the signature.
    fn encode_unsigned(&self, w: &mut CanonicalWriter) {
        w.put_bytes(self.module.as_bytes());
        w.put_bytes(self.command.as_bytes());
        w.put_u64(self.nonce);
        w.put_u64(self.fee);
        w.put_fixed(&self.sender_public_key.0);
        w.put_bytes(&self.params);
    }

    /// The tagged message the sender signs.
    pub fn signing_bytes(&self, chain_id: &ChainId) -> Vec<u8> {
        let mut w = CanonicalWriter::with_capacity(64 + self.params.len());
        w.put_fixed(MESSAGE_TAG_TRANSACTION);
        w.put_fixed(&chain_id.0);
        self.encode_unsigned(&mut w);
        w.into_bytes()
    }

    /// Full canonical encoding including the signature.
    pub fn encode_canonical(&self, w: &mut CanonicalWriter) {
        self.encode_unsigned(w);
        w.put_fixed(&self.signature.0);
    }

    pub fn decode_canonical(r: &mut CanonicalReader<'_>) -> Result<Self, CodecError> {
        let module = String::from_utf8(r.get_bytes()?).map_err(|_| CodecError::InvalidUtf8)?;
        let command = String::from_utf8(r.get_bytes()?).map_err(|_| CodecError::InvalidUtf8)?;
        let nonce = r.get_u64()?;
        let fee = r.get_u64()?;
        let sender: [u8; 32] = r.get_fixed()?;
        let params = r.get_bytes()?;
        let signature: [u8; 64] = r.get_fixed()?;
        Ok(Self {
            module,
            command,
            nonce,
            fee,
            sender_public_key: GeneratorPublicKey(sender),
            params,
            signature: Signature(signature),
        })
    }

    /// Transaction id: SHA-256 of the full canonical encoding.
    pub fn id(&self) -> Hash {
        let mut w = CanonicalWriter::with_capacity(128 + self.params.len());
        self.encode_canonical(&mut w);
        Hash::digest(&w.into_bytes())
    }

    /// Verify the sender's signature over the tagged signing bytes.
    pub fn verify_signature(&self, chain_id: &ChainId) -> bool {
        self.sender_public_key
            .verify(&self.signing_bytes(chain_id), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::GeneratorKeys;

    fn signed_transaction(keys: &GeneratorKeys, chain_id: &ChainId, nonce: u64) -> Transaction {
        let mut tx = Transaction {
            module: "token".to_string(),
            command: "transfer".to_string(),
            nonce,
            fee: 100,
            sender_public_key: keys.public_key(),
            params: vec![1, 2, 3],
            signature: Signature::zero(),
        };
        tx.signature = keys.sign(&tx.signing_bytes(chain_id));
        tx
    }

    #[test]
    fn signature_verifies_on_matching_chain_only() {
        let keys = GeneratorKeys::from_seed(&[4u8; 32]);
        let chain = ChainId([0, 0, 0, 1]);
        let tx = signed_transaction(&keys, &chain, 0);
        assert!(tx.verify_signature(&chain));
        assert!(!tx.verify_signature(&ChainId([0, 0, 0, 2])));
    }

    #[test]
    fn canonical_roundtrip_preserves_id() {
        let keys = GeneratorKeys::from_seed(&[5u8; 32]);
        let tx = signed_transaction(&keys, &ChainId::default(), 3);
        let mut w = CanonicalWriter::new();
        tx.encode_canonical(&mut w);
        let bytes = w.into_bytes();
        let mut r = CanonicalReader::new(&bytes);
        let decoded = Transaction::decode_canonical(&mut r).unwrap();
        r.finish().unwrap();
        assert_eq!(decoded.id(), tx.id());
        assert_eq!(decoded, tx);
    }
}
