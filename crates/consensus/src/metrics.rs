//! Consensus metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.

use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for the consensus core.
pub struct Metrics {
    // === Chain ===
    pub blocks_executed: Counter,
    pub blocks_deleted: Counter,
    pub block_height: Gauge,
    pub finalized_height: Gauge,
    pub block_execution_latency: Histogram,

    // === Fork handling ===
    pub forks_detected: Counter,
    pub tie_breaks: Counter,

    // === Synchronization ===
    pub sync_runs: Counter,
    pub sync_blocks_applied: Counter,
    pub peer_penalties: Counter,

    // === Commit pool ===
    pub commits_added: Counter,
    pub aggregates_selected: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            blocks_executed: register_counter!(
                "meridian_blocks_executed_total",
                "Blocks verified, executed and persisted"
            )
            .unwrap(),
            blocks_deleted: register_counter!(
                "meridian_blocks_deleted_total",
                "Blocks removed from the tip"
            )
            .unwrap(),
            block_height: register_gauge!("meridian_block_height", "Current tip height").unwrap(),
            finalized_height: register_gauge!(
                "meridian_finalized_height",
                "Current finalized height"
            )
            .unwrap(),
            block_execution_latency: register_histogram!(
                "meridian_block_execution_seconds",
                "Wall time of verify+execute+persist"
            )
            .unwrap(),
            forks_detected: register_counter!(
                "meridian_forks_detected_total",
                "Fork events observed"
            )
            .unwrap(),
            tie_breaks: register_counter!(
                "meridian_tie_breaks_total",
                "Tip swaps through the tie-break rule"
            )
            .unwrap(),
            sync_runs: register_counter!(
                "meridian_sync_runs_total",
                "Synchronizations started"
            )
            .unwrap(),
            sync_blocks_applied: register_counter!(
                "meridian_sync_blocks_applied_total",
                "Blocks applied during synchronization"
            )
            .unwrap(),
            peer_penalties: register_counter!(
                "meridian_peer_penalties_total",
                "Penalty applications against peers"
            )
            .unwrap(),
            commits_added: register_counter!(
                "meridian_commits_added_total",
                "Single commits accepted into the pool"
            )
            .unwrap(),
            aggregates_selected: register_counter!(
                "meridian_aggregates_selected_total",
                "Non-empty aggregate commits selected"
            )
            .unwrap(),
        }
    }
}

/// The process-wide metrics registry.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub fn record_block_executed(height: u32, finalized: u32, seconds: f64) {
    let m = metrics();
    m.blocks_executed.inc();
    m.block_height.set(f64::from(height));
    m.finalized_height.set(f64::from(finalized));
    m.block_execution_latency.observe(seconds);
}

pub fn record_block_deleted(height: u32) {
    let m = metrics();
    m.blocks_deleted.inc();
    m.block_height.set(f64::from(height.saturating_sub(1)));
}

pub fn record_fork_detected() {
    metrics().forks_detected.inc();
}

pub fn record_tie_break() {
    metrics().tie_breaks.inc();
}

pub fn record_sync_run() {
    metrics().sync_runs.inc();
}

pub fn record_sync_block_applied() {
    metrics().sync_blocks_applied.inc();
}

pub fn record_peer_penalty() {
    metrics().peer_penalties.inc();
}

pub fn record_commit_added() {
    metrics().commits_added.inc();
}

pub fn record_aggregate_selected() {
    metrics().aggregates_selected.inc();
}
