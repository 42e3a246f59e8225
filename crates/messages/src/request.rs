//! Request messages for the peer-to-peer RPC surface.

use meridian_types::Hash;

/// Ask a peer for its chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Default, sbor::prelude::BasicSbor)]
pub struct GetLastBlockRequest {}

/// Ask a peer for up to a batch of sequential blocks following `block_id`.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetBlocksFromIdRequest {
    pub block_id: Hash,
}

/// Ask a peer which of the given block ids it also has; the peer answers
/// with the one at the greatest height.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetHighestCommonBlockRequest {
    pub ids: Vec<Hash>,
}
