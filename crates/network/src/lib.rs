//! Consensus network surface.
//!
//! Transport (peer discovery, connection management, the socket itself) is
//! an external collaborator; this crate defines the boundary:
//!
//! - [`NetworkAdapter`]: the async trait the core sends through
//! - [`codec`]: the versioned wire envelope for requests, responses and
//!   broadcasts
//! - [`ConsensusEndpoint`]: the handler side - answers the three sync RPCs
//!   from chain storage and forwards pushes into the consensus core, with
//!   per-peer rate limiting and penalties for malformed payloads
//! - [`MemoryNetwork`]: an in-process transport wiring several endpoints
//!   together for integration tests

mod adapter;
pub mod codec;
mod endpoint;
mod memory;

pub use adapter::{
    BroadcastMessage, ConsensusHandle, NetworkAdapter, NetworkError, PeerId, PeerInfo, PeerTable,
    RpcRequest, RpcResponse, BAN_THRESHOLD, MALFORMED_PEER_PENALTY,
};
pub use endpoint::{ConsensusEndpoint, EndpointConfig, EndpointError};
pub use memory::{MemoryAdapter, MemoryNetwork};
