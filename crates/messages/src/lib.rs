//! Network messages for the consensus protocol.

pub mod gossip;
pub mod request;
pub mod response;

// Re-export commonly used types
pub use gossip::{BlockAnnouncement, NodeInfoAnnouncement, SingleCommitGossip};
pub use request::{GetBlocksFromIdRequest, GetHighestCommonBlockRequest, GetLastBlockRequest};
pub use response::{
    GetBlocksFromIdResponse, GetHighestCommonBlockResponse, GetLastBlockResponse,
    MAX_BLOCKS_PER_RESPONSE,
};
