//! The consensus network endpoint.
//!
//! Handler side of the peer-to-peer surface: answers the three sync RPCs
//! (`getLastBlock`, `getBlocksFromId`, `getHighestCommonBlock`) from chain
//! storage, and forwards the two pushes (`postBlock`, `postNodeInfo`, plus
//! gossiped single commits) into the consensus core. Malformed payloads cost
//! the sender 100 points; each peer is rate limited independently.

use crate::adapter::{
    BroadcastMessage, ConsensusHandle, NetworkAdapter, PeerId, PeerInfo, PeerTable, RpcRequest,
    RpcResponse, MALFORMED_PEER_PENALTY,
};
use crate::codec;
use meridian_chain::{Chain, ChainError};
use meridian_messages::{
    GetBlocksFromIdResponse, GetHighestCommonBlockResponse, GetLastBlockResponse,
    MAX_BLOCKS_PER_RESPONSE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Rate limit exceeded for {0}")]
    RateLimited(PeerId),

    #[error("Malformed payload from {0}")]
    Malformed(PeerId),

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Configuration for the endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum RPC requests per peer within one window.
    pub rate_limit: u32,
    /// Length of the rate-limit window.
    pub rate_window: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rate_limit: 100,
            rate_window: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u32,
}

/// Per-peer fixed-window rate limiter.
struct RateLimiter {
    config: EndpointConfig,
    windows: Mutex<HashMap<PeerId, RateWindow>>,
}

impl RateLimiter {
    fn new(config: EndpointConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, peer: PeerId) -> bool {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let window = windows.entry(peer).or_insert(RateWindow {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.config.rate_window {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.config.rate_limit
    }
}

/// Registers and answers the consensus RPCs; relays pushes into the core.
pub struct ConsensusEndpoint {
    chain: Arc<Chain>,
    peers: Arc<PeerTable>,
    consensus: Arc<dyn ConsensusHandle>,
    adapter: Arc<dyn NetworkAdapter>,
    limiter: RateLimiter,
}

impl ConsensusEndpoint {
    pub fn new(
        config: EndpointConfig,
        chain: Arc<Chain>,
        peers: Arc<PeerTable>,
        consensus: Arc<dyn ConsensusHandle>,
        adapter: Arc<dyn NetworkAdapter>,
    ) -> Self {
        Self {
            chain,
            peers,
            consensus,
            adapter,
            limiter: RateLimiter::new(config),
        }
    }

    /// The shared peer table this endpoint writes node-info updates into.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Handle one RPC envelope from a peer, returning the response envelope.
    pub fn handle_rpc(&self, peer: PeerId, data: &[u8]) -> Result<Vec<u8>, EndpointError> {
        if !self.limiter.allow(peer) {
            warn!(%peer, "RPC rate limit exceeded");
            return Err(EndpointError::RateLimited(peer));
        }

        let request = match codec::decode_request(data) {
            Ok(request) => request,
            Err(e) => {
                warn!(%peer, error = %e, "Malformed RPC payload");
                self.adapter.apply_penalty(peer, MALFORMED_PEER_PENALTY);
                return Err(EndpointError::Malformed(peer));
            }
        };

        let response = self.dispatch_rpc(peer, request)?;
        codec::encode_response(&response).map_err(|_| EndpointError::Malformed(peer))
    }

    fn dispatch_rpc(&self, peer: PeerId, request: RpcRequest) -> Result<RpcResponse, EndpointError> {
        match request {
            RpcRequest::GetLastBlock(_) => {
                trace!(%peer, "getLastBlock");
                let block = self.chain.last_block();
                Ok(RpcResponse::LastBlock(GetLastBlockResponse {
                    block: block.to_bytes(),
                }))
            }
            RpcRequest::GetBlocksFromId(request) => {
                trace!(%peer, block_id = %request.block_id, "getBlocksFromId");
                let blocks = self
                    .chain
                    .get_blocks_after_id(&request.block_id, MAX_BLOCKS_PER_RESPONSE)?;
                Ok(RpcResponse::BlocksFromId(GetBlocksFromIdResponse {
                    blocks: blocks.iter().map(|b| b.to_bytes()).collect(),
                }))
            }
            RpcRequest::GetHighestCommonBlock(request) => {
                trace!(%peer, ids = request.ids.len(), "getHighestCommonBlock");
                let id = self.chain.highest_common_block(&request.ids)?;
                Ok(RpcResponse::HighestCommonBlock(
                    GetHighestCommonBlockResponse { id },
                ))
            }
        }
    }

    /// Handle one push envelope from a peer.
    pub async fn handle_message(&self, peer: PeerId, data: &[u8]) {
        let message = match codec::decode_broadcast(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "Malformed push payload");
                self.adapter.apply_penalty(peer, MALFORMED_PEER_PENALTY);
                return;
            }
        };

        match message {
            BroadcastMessage::Block(announcement) => {
                self.consensus
                    .on_block_receive(announcement.block, peer)
                    .await;
            }
            BroadcastMessage::NodeInfo(info) => {
                debug!(%peer, height = info.height, "postNodeInfo");
                self.peers.update(
                    peer,
                    PeerInfo {
                        height: info.height,
                        max_height_prevoted: info.max_height_prevoted,
                        last_block_id: info.last_block_id,
                        block_version: info.block_version,
                    },
                );
            }
            BroadcastMessage::SingleCommit(commit) => {
                self.consensus.on_single_commit(commit, peer).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meridian_chain::{ChainStorage, StateDiff};
    use meridian_messages::{
        GetBlocksFromIdRequest, GetHighestCommonBlockRequest, GetLastBlockRequest,
        NodeInfoAnnouncement, SingleCommitGossip,
    };
    use meridian_types::{
        AggregateCommit, Address, Block, BlockHeader, ChainId, Hash, Signature, Slots,
        CURRENT_BLOCK_VERSION, EMPTY_HASH,
    };
    use parking_lot::Mutex as PlMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingConsensus {
        blocks: PlMutex<Vec<(Vec<u8>, PeerId)>>,
        commits: PlMutex<Vec<PeerId>>,
    }

    #[async_trait]
    impl ConsensusHandle for RecordingConsensus {
        async fn on_block_receive(&self, bytes: Vec<u8>, peer: PeerId) {
            self.blocks.lock().push((bytes, peer));
        }
        async fn on_single_commit(&self, _commit: SingleCommitGossip, peer: PeerId) {
            self.commits.lock().push(peer);
        }
    }

    #[derive(Default)]
    struct RecordingAdapter {
        penalties: PlMutex<Vec<(PeerId, u32)>>,
    }

    #[async_trait]
    impl NetworkAdapter for RecordingAdapter {
        async fn request(
            &self,
            peer: PeerId,
            _request: RpcRequest,
        ) -> Result<RpcResponse, crate::NetworkError> {
            Err(crate::NetworkError::PeerUnavailable(peer))
        }
        async fn broadcast(&self, _message: BroadcastMessage) {}
        fn apply_penalty(&self, peer: PeerId, points: u32) {
            self.penalties.lock().push((peer, points));
        }
    }

    fn test_block(height: u32, previous: Hash) -> Block {
        Block {
            header: BlockHeader {
                version: CURRENT_BLOCK_VERSION,
                timestamp: 1000 + height * 10,
                height,
                previous_block_id: previous,
                generator_address: Address([1; 20]),
                transaction_root: EMPTY_HASH,
                state_root: Hash::ZERO,
                validators_hash: Hash::ZERO,
                aggregate_commit: AggregateCommit::empty(0),
                max_height_generated: 0,
                max_height_prevoted: 0,
                signature: Signature::zero(),
            },
            assets: vec![],
            transactions: vec![],
        }
    }

    struct Fixture {
        endpoint: ConsensusEndpoint,
        consensus: Arc<RecordingConsensus>,
        adapter: Arc<RecordingAdapter>,
        chain: Arc<Chain>,
        _dir: TempDir,
    }

    fn fixture_with(config: EndpointConfig, blocks: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(ChainStorage::open(dir.path()).unwrap());
        let chain = Arc::new(Chain::new(
            storage,
            ChainId([0, 0, 0, 1]),
            Slots::new(1000, 10),
        ));
        let genesis = test_block(0, Hash::ZERO);
        chain.init(&genesis).unwrap();
        let mut previous = genesis.id();
        for h in 1..=blocks {
            let block = test_block(h, previous);
            previous = block.id();
            chain
                .save_block(&block, &[], &StateDiff::default(), 0, block.header.timestamp)
                .unwrap();
        }

        let consensus = Arc::new(RecordingConsensus::default());
        let adapter = Arc::new(RecordingAdapter::default());
        let endpoint = ConsensusEndpoint::new(
            config,
            Arc::clone(&chain),
            Arc::new(PeerTable::new()),
            Arc::clone(&consensus) as Arc<dyn ConsensusHandle>,
            Arc::clone(&adapter) as Arc<dyn NetworkAdapter>,
        );
        Fixture {
            endpoint,
            consensus,
            adapter,
            chain,
            _dir: dir,
        }
    }

    fn fixture(blocks: u32) -> Fixture {
        fixture_with(EndpointConfig::default(), blocks)
    }

    fn rpc(fixture: &Fixture, peer: PeerId, request: RpcRequest) -> RpcResponse {
        let bytes = codec::encode_request(&request).unwrap();
        let response = fixture.endpoint.handle_rpc(peer, &bytes).unwrap();
        codec::decode_response(&response).unwrap()
    }

    #[test]
    fn get_last_block_returns_tip() {
        let fixture = fixture(3);
        let response = rpc(
            &fixture,
            PeerId(1),
            RpcRequest::GetLastBlock(GetLastBlockRequest {}),
        );
        let RpcResponse::LastBlock(response) = response else {
            panic!("wrong response variant");
        };
        let block = Block::from_bytes(&response.block).unwrap();
        assert_eq!(block.height(), 3);
    }

    #[test]
    fn get_blocks_from_id_returns_successors() {
        let fixture = fixture(5);
        let from = fixture.chain.get_block_by_height(2).unwrap().unwrap();
        let response = rpc(
            &fixture,
            PeerId(1),
            RpcRequest::GetBlocksFromId(GetBlocksFromIdRequest {
                block_id: from.id(),
            }),
        );
        let RpcResponse::BlocksFromId(response) = response else {
            panic!("wrong response variant");
        };
        assert_eq!(response.blocks.len(), 3);
        let first = Block::from_bytes(&response.blocks[0]).unwrap();
        assert_eq!(first.height(), 3);
    }

    #[test]
    fn highest_common_block_with_empty_ids_is_none() {
        let fixture = fixture(2);
        let response = rpc(
            &fixture,
            PeerId(1),
            RpcRequest::GetHighestCommonBlock(GetHighestCommonBlockRequest { ids: vec![] }),
        );
        assert_eq!(
            response,
            RpcResponse::HighestCommonBlock(GetHighestCommonBlockResponse { id: None })
        );
    }

    #[test]
    fn malformed_rpc_costs_a_penalty() {
        let fixture = fixture(1);
        let result = fixture.endpoint.handle_rpc(PeerId(7), &[1, 2, 3]);
        assert!(matches!(result, Err(EndpointError::Malformed(PeerId(7)))));
        assert_eq!(
            fixture.adapter.penalties.lock().as_slice(),
            &[(PeerId(7), MALFORMED_PEER_PENALTY)]
        );
    }

    #[test]
    fn rate_limit_is_per_peer() {
        let fixture = fixture_with(
            EndpointConfig {
                rate_limit: 2,
                rate_window: Duration::from_secs(60),
            },
            1,
        );
        let bytes = codec::encode_request(&RpcRequest::GetLastBlock(GetLastBlockRequest {}))
            .unwrap();
        assert!(fixture.endpoint.handle_rpc(PeerId(1), &bytes).is_ok());
        assert!(fixture.endpoint.handle_rpc(PeerId(1), &bytes).is_ok());
        assert!(matches!(
            fixture.endpoint.handle_rpc(PeerId(1), &bytes),
            Err(EndpointError::RateLimited(PeerId(1)))
        ));
        // A different peer has its own window.
        assert!(fixture.endpoint.handle_rpc(PeerId(2), &bytes).is_ok());
    }

    #[tokio::test]
    async fn node_info_updates_peer_table() {
        let fixture = fixture(1);
        let message = BroadcastMessage::NodeInfo(NodeInfoAnnouncement {
            height: 9,
            max_height_prevoted: 4,
            last_block_id: Hash::digest(b"tip"),
            block_version: 2,
        });
        let bytes = codec::encode_broadcast(&message).unwrap();
        fixture.endpoint.handle_message(PeerId(3), &bytes).await;
        let info = fixture.endpoint.peers().get(PeerId(3)).unwrap();
        assert_eq!(info.height, 9);
        assert_eq!(info.max_height_prevoted, 4);
    }

    #[tokio::test]
    async fn block_push_reaches_consensus() {
        let fixture = fixture(1);
        let block = test_block(2, Hash::digest(b"x"));
        let message = BroadcastMessage::Block(meridian_messages::BlockAnnouncement {
            block: block.to_bytes(),
        });
        let bytes = codec::encode_broadcast(&message).unwrap();
        fixture.endpoint.handle_message(PeerId(5), &bytes).await;
        let received = fixture.consensus.blocks.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, PeerId(5));
        assert_eq!(received[0].0, block.to_bytes());
    }

    #[tokio::test]
    async fn malformed_push_costs_a_penalty() {
        let fixture = fixture(1);
        fixture.endpoint.handle_message(PeerId(9), &[0xFF]).await;
        assert_eq!(
            fixture.adapter.penalties.lock().as_slice(),
            &[(PeerId(9), MALFORMED_PEER_PENALTY)]
        );
    }
}
