//! Synchronization.
//!
//! Two mechanisms recover from divergence:
//!
//! - [`FastChainSwitchMechanism`]: short forks within a two-round window -
//!   walk back to the shared ancestor and swap branches atomically
//! - [`BlockSyncMechanism`]: large divergence - pick the best peer, find the
//!   last common ancestor, revert, and fetch the better chain forward
//!
//! The [`Synchronizer`] supervisor picks the first applicable mechanism and
//! translates its errors: penalize-and-restart, plain restart, abort to
//! idle, or decline to the next mechanism.

mod block_sync;
mod fast_switch;

pub use block_sync::{BlockSyncConfig, BlockSyncMechanism};
pub use fast_switch::{FastChainSwitchConfig, FastChainSwitchMechanism};

use crate::error::SyncError;
use crate::metrics;
use crate::processor::{BlockProcessor, ExecuteOptions};
use async_trait::async_trait;
use meridian_network::{PeerId, MALFORMED_PEER_PENALTY};
use meridian_types::Block;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Cap on penalize/restart cycles within one `run` before giving up and
/// returning to idle. The next divergent block starts a fresh run.
const MAX_SYNC_ATTEMPTS: usize = 12;

/// One way of catching up with a better chain.
#[async_trait]
pub trait SyncMechanism: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this mechanism applies to the observed divergence.
    fn is_valid_for(&self, processor: &BlockProcessor, block: &Block, peer: PeerId) -> bool;

    /// Drive the sync to completion. The caller holds the coordinator
    /// mutex.
    async fn run(
        &self,
        processor: &BlockProcessor,
        block: &Block,
        peer: PeerId,
    ) -> Result<(), SyncError>;
}

/// Supervisor: owns the mechanisms, drives the applicable one, translates
/// its errors into peer penalties, restarts and aborts.
pub struct Synchronizer {
    mechanisms: Vec<Box<dyn SyncMechanism>>,
    active: AtomicBool,
}

impl Synchronizer {
    pub fn new(mechanisms: Vec<Box<dyn SyncMechanism>>) -> Self {
        Self {
            mechanisms,
            active: AtomicBool::new(false),
        }
    }

    /// True between entry and exit of [`run`](Self::run).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Select and drive the applicable mechanism for the observed
    /// divergence. Local-fatal errors propagate; everything else resolves
    /// to idle.
    pub async fn run(
        &self,
        processor: &BlockProcessor,
        block: &Block,
        peer: PeerId,
    ) -> Result<(), SyncError> {
        self.active.store(true, Ordering::SeqCst);
        let result = self.run_inner(processor, block, peer).await;
        self.active.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        &self,
        processor: &BlockProcessor,
        block: &Block,
        peer: PeerId,
    ) -> Result<(), SyncError> {
        let ctx = processor.context();
        metrics::record_sync_run();

        'mechanisms: for mechanism in &self.mechanisms {
            if !mechanism.is_valid_for(processor, block, peer) {
                continue;
            }
            info!(
                mechanism = mechanism.name(),
                height = block.height(),
                %peer,
                "Starting synchronization"
            );

            let mut attempts = 0;
            loop {
                if ctx.stop.load(Ordering::SeqCst) {
                    debug!("Synchronization interrupted by shutdown");
                    return Ok(());
                }
                attempts += 1;
                if attempts > MAX_SYNC_ATTEMPTS {
                    warn!(
                        mechanism = mechanism.name(),
                        attempts, "Giving up synchronization after repeated restarts"
                    );
                    return Ok(());
                }

                match mechanism.run(processor, block, peer).await {
                    Ok(()) => {
                        info!(mechanism = mechanism.name(), "Synchronization finished");
                        return Ok(());
                    }
                    Err(SyncError::Restart(reason)) => {
                        warn!(reason, "Restarting synchronization");
                    }
                    Err(SyncError::ApplyPenaltyAndRestart { peer: bad, reason }) => {
                        warn!(%bad, reason, "Penalizing peer and restarting synchronization");
                        ctx.network.apply_penalty(bad, MALFORMED_PEER_PENALTY);
                        metrics::record_peer_penalty();
                    }
                    Err(SyncError::Abort(reason)) => {
                        info!(reason, "Synchronization aborted");
                        return Ok(());
                    }
                    Err(SyncError::Declined) => {
                        debug!(
                            mechanism = mechanism.name(),
                            "Mechanism declined, trying the next one"
                        );
                        continue 'mechanisms;
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        debug!("No synchronization mechanism applicable");
        Ok(())
    }
}

/// Re-apply staged temp blocks that still extend the tip, then clear the
/// table. Used after a successful block-sync.
pub(crate) async fn restore_temp_blocks(processor: &BlockProcessor) -> Result<(), SyncError> {
    let ctx = processor.context();
    for block in ctx.chain.temp_blocks()? {
        let tip = ctx.chain.last_header();
        let extends = block.header.previous_block_id == tip.id() && block.height() == tip.height + 1;
        if !extends {
            continue;
        }
        if processor.verify(&block).is_err() {
            break;
        }
        let opts = ExecuteOptions {
            skip_broadcast: true,
            remove_from_temp: true,
            received_at: None,
        };
        if processor.execute_validated(&block, opts).await.is_err() {
            break;
        }
    }
    ctx.chain.clear_temp_blocks()?;
    Ok(())
}
