//! Node composition root.
//!
//! Wires storage, engine, BFT, commit pool, coordinator and endpoint into a
//! runnable node. Transport, forging and the RPC API remain external; the
//! node exposes the coordinator for them to drive.

mod telemetry;

pub use telemetry::{export_metrics, init_telemetry, TelemetryConfig};

use meridian_bft::{BftModule, CommitPool, CommitPoolConfig};
use meridian_chain::{Chain, ChainError, ChainStorage, StorageError};
use meridian_consensus::{ConsensusCoordinator, ConsensusEvent, CoordinatorConfig, ProcessError};
use meridian_engine::{ModuleHandler, StateMachine};
use meridian_network::{ConsensusEndpoint, ConsensusHandle, EndpointConfig, NetworkAdapter, PeerTable};
use meridian_types::{BftParameters, Block, ChainId, Slots};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Builder is missing {0}")]
    Missing(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Node-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub coordinator: CoordinatorConfig,
    pub endpoint: EndpointConfig,
    pub commit_pool: CommitPoolConfig,
}

/// Builder for a [`Node`].
pub struct NodeBuilder {
    config: NodeConfig,
    chain_id: ChainId,
    slots: Slots,
    storage_path: Option<PathBuf>,
    genesis: Option<Block>,
    genesis_params: Option<BftParameters>,
    network: Option<Arc<dyn NetworkAdapter>>,
    modules: Vec<(String, Arc<dyn ModuleHandler>)>,
}

impl NodeBuilder {
    pub fn new(chain_id: ChainId, slots: Slots) -> Self {
        Self {
            config: NodeConfig::default(),
            chain_id,
            slots,
            storage_path: None,
            genesis: None,
            genesis_params: None,
            network: None,
            modules: Vec::new(),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    pub fn genesis(mut self, block: Block, params: BftParameters) -> Self {
        self.genesis = Some(block);
        self.genesis_params = Some(params);
        self
    }

    pub fn network(mut self, adapter: Arc<dyn NetworkAdapter>) -> Self {
        self.network = Some(adapter);
        self
    }

    pub fn module(mut self, name: impl Into<String>, handler: Arc<dyn ModuleHandler>) -> Self {
        self.modules.push((name.into(), handler));
        self
    }

    /// Open storage, initialize the chain and compose the consensus core.
    pub fn build(self) -> Result<Node, NodeError> {
        let path = self.storage_path.ok_or(NodeError::Missing("storage path"))?;
        let genesis = self.genesis.ok_or(NodeError::Missing("genesis block"))?;
        let params = self
            .genesis_params
            .ok_or(NodeError::Missing("genesis BFT parameters"))?;
        let network = self.network.ok_or(NodeError::Missing("network adapter"))?;

        let storage = Arc::new(ChainStorage::open(&path)?);
        let chain = Arc::new(Chain::new(storage, self.chain_id, self.slots));

        let mut machine = StateMachine::new(self.chain_id);
        for (name, handler) in self.modules {
            machine.register(name, handler);
        }
        let machine = Arc::new(machine);

        let bft = Arc::new(BftModule::new(params));
        let commit_pool = Arc::new(CommitPool::new(
            self.config.commit_pool,
            Arc::clone(&chain),
            Arc::clone(&bft),
        ));
        let peers = Arc::new(PeerTable::new());

        let coordinator = ConsensusCoordinator::new(
            self.config.coordinator,
            Arc::clone(&chain),
            Arc::clone(&machine),
            Arc::clone(&bft),
            Arc::clone(&commit_pool),
            Arc::clone(&network),
            Arc::clone(&peers),
        );
        coordinator.init(&genesis)?;

        let endpoint = Arc::new(ConsensusEndpoint::new(
            self.config.endpoint,
            Arc::clone(&chain),
            peers,
            Arc::clone(&coordinator) as Arc<dyn ConsensusHandle>,
            network,
        ));

        Ok(Node {
            chain,
            machine,
            bft,
            coordinator,
            endpoint,
            job: std::sync::Mutex::new(None),
        })
    }
}

/// A composed consensus node.
pub struct Node {
    chain: Arc<Chain>,
    machine: Arc<StateMachine>,
    bft: Arc<BftModule>,
    coordinator: Arc<ConsensusCoordinator>,
    endpoint: Arc<ConsensusEndpoint>,
    job: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn bft(&self) -> &Arc<BftModule> {
        &self.bft
    }

    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        &self.coordinator
    }

    /// The endpoint the transport routes inbound RPCs and pushes to.
    pub fn endpoint(&self) -> &Arc<ConsensusEndpoint> {
        &self.endpoint
    }

    /// Spawn the commit-pool maintenance loop: once per applied block the
    /// pool evicts stale commits, gossips fresh ones and refreshes the
    /// aggregate selection.
    pub fn start(&self) {
        let coordinator = Arc::clone(&self.coordinator);
        let mut events = coordinator.events().subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConsensusEvent::BlockNew(_)) => {
                        if let Err(e) = coordinator.run_commit_job().await {
                            error!(error = %e, "Commit pool job failed");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Commit job loop lagged behind events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.job.lock().expect("job slot poisoned") = Some(handle);
        info!(tip = self.chain.last_header().height, "Node started");
    }

    /// Stop the coordinator (draining in-flight work) and the job loop.
    pub async fn stop(&self) {
        self.coordinator.stop().await;
        if let Some(handle) = self.job.lock().expect("job slot poisoned").take() {
            handle.abort();
        }
        info!("Node stopped");
    }
}
