//! The consensus core.
//!
//! Advances a single agreed-upon chain across untrusted peers:
//!
//! - [`fork_choice`]: classify an incoming header against the tip
//! - [`BlockProcessor`]: verify → execute → persist → broadcast → emit, the
//!   only code path that moves the tip
//! - [`sync`]: recover from divergence - full block-sync for large gaps,
//!   fast chain-switch for short forks, a supervisor translating their
//!   errors into peer penalties and restarts
//! - [`ConsensusCoordinator`]: owns the mutex and composes everything;
//!   `execute`, `on_block_receive` and `delete_last_block` are the public
//!   entry points
//!
//! The core is logically single-writer: exactly one tip-modifying operation
//! proceeds at any moment, under the coordinator mutex. Readers (RPC
//! handlers, commit-pool validation) go straight to storage.

mod context;
mod coordinator;
mod error;
mod events;
pub mod fork_choice;
pub mod metrics;
mod processor;
pub mod sync;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use context::ConsensusContext;
pub use coordinator::{ConsensusCoordinator, CoordinatorConfig};
pub use error::{ProcessError, SyncError};
pub use events::{ConsensusEvent, EventBus};
pub use fork_choice::ForkChoice;
pub use processor::{BlockProcessor, ExecuteOptions};
pub use sync::Synchronizer;
