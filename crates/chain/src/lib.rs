//! # Chain storage
//!
//! Persistence layer for the consensus core:
//!
//! - [`ChainStorage`]: RocksDB-backed block, transaction and state store
//! - [`StateStore`]: snapshot-capable read-through overlay used during block
//!   execution; produces the forward writes and the reverse diff
//! - [`Chain`]: the chain handle owned by the consensus coordinator — tip
//!   cache, finalized height, temp-block table, common-ancestor probes
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking` if needed to avoid blocking the runtime.

mod chain;
mod state;
mod storage;

pub use chain::{Chain, ChainError};
pub use state::{state_key, DiffEntry, StateDiff, StateStore, StateWrite};
pub use storage::{ChainStorage, RocksDbConfig, StorageError};
