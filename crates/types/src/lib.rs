//! Core types for Meridian consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, addresses, cryptographic keys and signatures
//! - **Consensus types**: Block, BlockHeader, SingleCommit, AggregateCommit
//! - **Validator sets**: BFT parameters, weights, slot-based authorization
//! - **Canonical codec**: the byte-exact header/certificate encoding that
//!   ids, signatures and certificates are derived from
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod codec;
mod crypto;
mod hash;
mod signer_bitfield;
mod slots;

// Consensus types
mod block;
mod commit;
mod transaction;
mod validators;

pub use codec::{CanonicalReader, CanonicalWriter, CodecError};
pub use crypto::{
    BlsPublicKey, BlsSecretKey, BlsSignature, CryptoError, GeneratorKeys, GeneratorPublicKey,
    Signature, BLS_PUBLIC_KEY_LENGTH, BLS_SIGNATURE_LENGTH,
};
pub use hash::{merkle_root, Address, ChainId, Hash, EMPTY_HASH};
pub use signer_bitfield::SignerBitfield;
pub use slots::Slots;

pub use block::{Block, BlockAssetEntry, BlockHeader, CURRENT_BLOCK_VERSION};
pub use commit::{AggregateCommit, Certificate, SingleCommit, MESSAGE_TAG_CERTIFICATE};
pub use transaction::{Transaction, MESSAGE_TAG_TRANSACTION};
pub use validators::{BftHeights, BftParameters, Validator};
