//! The transport boundary.

use async_trait::async_trait;
use meridian_messages::{
    BlockAnnouncement, GetBlocksFromIdRequest, GetBlocksFromIdResponse,
    GetHighestCommonBlockRequest, GetHighestCommonBlockResponse, GetLastBlockRequest,
    GetLastBlockResponse, NodeInfoAnnouncement, SingleCommitGossip,
};
use meridian_types::Hash;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// Penalty applied for a malformed envelope, an undecodable block or a block
/// that fails verification while being processed.
pub const MALFORMED_PEER_PENALTY: u32 = 100;

/// Peers accumulating this many points are banned by the transport.
pub const BAN_THRESHOLD: u32 = 100;

/// Opaque peer identifier assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A peer's advertised chain position, updated on every `postNodeInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub height: u32,
    pub max_height_prevoted: u32,
    pub last_block_id: Hash,
    pub block_version: u8,
}

/// Shared table of advertised peer positions.
///
/// Written by the endpoint on `postNodeInfo`, read by the synchronizer for
/// mechanism selection and best-peer choice.
#[derive(Default)]
pub struct PeerTable {
    inner: RwLock<HashMap<PeerId, PeerInfo>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, peer: PeerId, info: PeerInfo) {
        self.inner.write().insert(peer, info);
    }

    pub fn remove(&self, peer: PeerId) {
        self.inner.write().remove(&peer);
    }

    pub fn get(&self, peer: PeerId) -> Option<PeerInfo> {
        self.inner.read().get(&peer).copied()
    }

    pub fn all(&self) -> Vec<(PeerId, PeerInfo)> {
        self.inner.read().iter().map(|(p, i)| (*p, *i)).collect()
    }
}

/// Requests of the peer-to-peer RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub enum RpcRequest {
    GetLastBlock(GetLastBlockRequest),
    GetBlocksFromId(GetBlocksFromIdRequest),
    GetHighestCommonBlock(GetHighestCommonBlockRequest),
}

/// Responses of the peer-to-peer RPC surface.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub enum RpcResponse {
    LastBlock(GetLastBlockResponse),
    BlocksFromId(GetBlocksFromIdResponse),
    HighestCommonBlock(GetHighestCommonBlockResponse),
}

/// Push messages relayed to all peers.
#[derive(Debug, Clone, PartialEq, Eq, sbor::prelude::BasicSbor)]
pub enum BroadcastMessage {
    Block(BlockAnnouncement),
    NodeInfo(NodeInfoAnnouncement),
    SingleCommit(SingleCommitGossip),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Request to {0} timed out")]
    Timeout(PeerId),

    #[error("Peer {0} is not connected")]
    PeerUnavailable(PeerId),

    #[error("Peer {0} rejected the request: {1}")]
    Rejected(PeerId, String),

    #[error(transparent)]
    Codec(#[from] crate::codec::CodecError),
}

/// The async surface the consensus core sends through. Implemented by the
/// production transport and by [`crate::MemoryNetwork`] for tests.
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    /// Send a request to one peer and await its response.
    async fn request(&self, peer: PeerId, request: RpcRequest) -> Result<RpcResponse, NetworkError>;

    /// Relay a push message to every connected peer.
    async fn broadcast(&self, message: BroadcastMessage);

    /// Apply misbehavior points to a peer. Additive, clamped at the ban
    /// threshold by the transport; idempotent once the peer is banned.
    fn apply_penalty(&self, peer: PeerId, points: u32);
}

/// The intake side of the consensus core, implemented by the coordinator.
/// The endpoint forwards decoded pushes through this seam.
#[async_trait]
pub trait ConsensusHandle: Send + Sync {
    /// A block announced by a peer.
    async fn on_block_receive(&self, bytes: Vec<u8>, peer: PeerId);

    /// A gossiped single commit.
    async fn on_single_commit(&self, commit: SingleCommitGossip, peer: PeerId);
}
