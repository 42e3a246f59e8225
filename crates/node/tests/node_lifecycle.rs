//! Two-node lifecycle tests: build, start, propagate, commit gossip, stop.

use meridian_consensus::testing::{forge_next_block, KvModule, TestNet};
use meridian_network::{MemoryNetwork, NetworkAdapter, PeerId};
use meridian_node::{Node, NodeBuilder};
use meridian_types::Block;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn build_node(net: &TestNet, network: &Arc<MemoryNetwork>, peer: PeerId, dir: &TempDir) -> Node {
    let node = NodeBuilder::new(net.chain_id, net.slots)
        .storage_path(dir.path())
        .genesis(net.genesis(), net.params.clone())
        .network(network.adapter(peer) as Arc<dyn NetworkAdapter>)
        .module("kv", Arc::new(KvModule))
        .build()
        .unwrap();
    network.register(peer, Arc::clone(node.endpoint()));
    node
}

fn forge(net: &TestNet, node: &Node) -> Block {
    forge_next_block(net, node.chain(), node.machine(), node.bft(), 1, vec![])
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timeout waiting for {what}");
}

#[tokio::test]
async fn blocks_flow_from_forger_to_follower() {
    let net = TestNet::new(4);
    let network = MemoryNetwork::new();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = build_node(&net, &network, PeerId(1), &dir_a);
    let b = build_node(&net, &network, PeerId(2), &dir_b);
    a.start();
    b.start();

    for height in 1..=3u32 {
        let block = forge(&net, &a);
        a.coordinator().execute(block).await.unwrap();
        wait_for("follower to apply", || {
            b.chain().last_header().height == height
        })
        .await;
    }
    assert_eq!(a.chain().last_block().id(), b.chain().last_block().id());

    a.stop().await;
    b.stop().await;
    assert!(matches!(
        a.coordinator().execute(forge(&net, &b)).await,
        Err(meridian_consensus::ProcessError::Stopped)
    ));
}

#[tokio::test]
async fn restart_reuses_the_stored_chain() {
    let net = TestNet::new(4);
    let dir = TempDir::new().unwrap();

    // First run. The network (and with it every handle onto storage) is
    // dropped at the end of the scope so the database lock is released.
    let tip_id = {
        let network = MemoryNetwork::new();
        let node = build_node(&net, &network, PeerId(1), &dir);
        let block = forge(&net, &node);
        node.coordinator().execute(block).await.unwrap();
        let id = node.chain().last_block().id();
        node.stop().await;
        id
    };

    // Same storage path: genesis detection is idempotent and the tip is
    // recovered.
    let network = MemoryNetwork::new();
    let node = build_node(&net, &network, PeerId(3), &dir);
    assert_eq!(node.chain().last_header().height, 1);
    assert_eq!(node.chain().last_block().id(), tip_id);
}

#[tokio::test]
async fn builder_requires_its_inputs() {
    let net = TestNet::new(4);
    let result = NodeBuilder::new(net.chain_id, net.slots).build();
    assert!(matches!(result, Err(meridian_node::NodeError::Missing(_))));
}
