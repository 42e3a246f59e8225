//! Push messages relayed between peers.

use meridian_types::{Address, BlsSignature, Hash};

/// A freshly forged or relayed block, as wire bytes
/// (canonical header ∥ payload-length ∥ payload).
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct BlockAnnouncement {
    pub block: Vec<u8>,
}

/// A peer's advertised chain position. Sent after every block the peer
/// applies; drives sync-mechanism selection and best-peer choice.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct NodeInfoAnnouncement {
    pub height: u32,
    pub max_height_prevoted: u32,
    pub last_block_id: Hash,
    pub block_version: u8,
}

/// A gossiped single commit.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct SingleCommitGossip {
    pub block_id: Hash,
    pub height: u32,
    pub validator_address: Address,
    pub certificate_signature: BlsSignature,
}
