//! Response messages for the peer-to-peer RPC surface.

use meridian_types::Hash;

/// The peer's tip, as wire block bytes.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetLastBlockResponse {
    pub block: Vec<u8>,
}

/// Up to `MAX_BLOCKS_PER_RESPONSE` sequential blocks, ascending by height.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetBlocksFromIdResponse {
    pub blocks: Vec<Vec<u8>>,
}

/// The highest block id shared with the requester, if any.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub struct GetHighestCommonBlockResponse {
    pub id: Option<Hash>,
}

/// Cap on the number of blocks returned by a single
/// [`GetBlocksFromIdResponse`].
pub const MAX_BLOCKS_PER_RESPONSE: usize = 100;
