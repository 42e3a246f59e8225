//! In-process network for integration tests.
//!
//! Routes requests and broadcasts between registered endpoints through the
//! real wire codec, so tests exercise the same envelopes production
//! transports carry. Penalties are recorded per peer and inspectable.

use crate::adapter::{BroadcastMessage, NetworkAdapter, PeerId, RpcRequest, RpcResponse};
use crate::codec;
use crate::endpoint::ConsensusEndpoint;
use crate::NetworkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct Hub {
    endpoints: HashMap<PeerId, Arc<ConsensusEndpoint>>,
    penalties: HashMap<PeerId, u32>,
    /// Peers whose inbound delivery is cut (simulated partition/timeouts).
    unreachable: Vec<PeerId>,
}

/// The shared in-memory transport.
#[derive(Default)]
pub struct MemoryNetwork {
    hub: Mutex<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node's endpoint under its peer id.
    pub fn register(&self, peer: PeerId, endpoint: Arc<ConsensusEndpoint>) {
        self.hub.lock().endpoints.insert(peer, endpoint);
    }

    /// The adapter a node at `local` sends through.
    pub fn adapter(self: &Arc<Self>, local: PeerId) -> Arc<MemoryAdapter> {
        Arc::new(MemoryAdapter {
            network: Arc::clone(self),
            local,
        })
    }

    /// Total penalty points recorded against a peer.
    pub fn penalty_of(&self, peer: PeerId) -> u32 {
        self.hub.lock().penalties.get(&peer).copied().unwrap_or(0)
    }

    /// Make a peer stop answering requests (requests to it time out).
    pub fn set_unreachable(&self, peer: PeerId, unreachable: bool) {
        let mut hub = self.hub.lock();
        hub.unreachable.retain(|p| *p != peer);
        if unreachable {
            hub.unreachable.push(peer);
        }
    }

    fn endpoint_of(&self, peer: PeerId) -> Option<Arc<ConsensusEndpoint>> {
        let hub = self.hub.lock();
        if hub.unreachable.contains(&peer) {
            return None;
        }
        hub.endpoints.get(&peer).cloned()
    }
}

/// One node's view of the [`MemoryNetwork`].
pub struct MemoryAdapter {
    network: Arc<MemoryNetwork>,
    local: PeerId,
}

impl MemoryAdapter {
    pub fn local_peer(&self) -> PeerId {
        self.local
    }
}

#[async_trait]
impl NetworkAdapter for MemoryAdapter {
    async fn request(&self, peer: PeerId, request: RpcRequest) -> Result<RpcResponse, NetworkError> {
        let endpoint = self
            .network
            .endpoint_of(peer)
            .ok_or(NetworkError::Timeout(peer))?;
        let bytes = codec::encode_request(&request)?;
        let response = endpoint
            .handle_rpc(self.local, &bytes)
            .map_err(|e| NetworkError::Rejected(peer, e.to_string()))?;
        codec::decode_response(&response).map_err(NetworkError::from)
    }

    async fn broadcast(&self, message: BroadcastMessage) {
        let bytes = match codec::encode_broadcast(&message) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let targets: Vec<(PeerId, Arc<ConsensusEndpoint>)> = {
            let hub = self.network.hub.lock();
            hub.endpoints
                .iter()
                .filter(|(peer, _)| **peer != self.local && !hub.unreachable.contains(peer))
                .map(|(peer, endpoint)| (*peer, Arc::clone(endpoint)))
                .collect()
        };
        // Deliveries are detached, like a real transport: a node
        // broadcasting from inside its own mutex must not re-enter itself
        // through a peer's synchronous reaction.
        let local = self.local;
        for (peer, endpoint) in targets {
            let bytes = bytes.clone();
            tokio::spawn(async move {
                debug!(from = %local, to = %peer, "Delivering broadcast");
                endpoint.handle_message(local, &bytes).await;
            });
        }
    }

    fn apply_penalty(&self, peer: PeerId, points: u32) {
        let mut hub = self.network.hub.lock();
        let total = hub.penalties.entry(peer).or_insert(0);
        *total = total.saturating_add(points).min(crate::adapter::BAN_THRESHOLD);
    }
}
