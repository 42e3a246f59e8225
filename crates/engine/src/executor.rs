//! Block execution.

use meridian_chain::{state_key, StateStore};
use meridian_types::{Block, ChainId, Hash, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Namespace holding account nonces.
const AUTH_MODULE: &str = "auth";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid signature on transaction {id}")]
    InvalidSignature { id: Hash },

    #[error("Nonce mismatch for transaction {id}: expected {expected}, got {actual}")]
    NonceMismatch { id: Hash, expected: u64, actual: u64 },

    #[error("No handler registered for module {0}")]
    UnknownModule(String),

    #[error("Module {module} rejected transaction: {reason}")]
    Rejected { module: String, reason: String },

    #[error("Module {module} hook failed: {reason}")]
    Hook { module: String, reason: String },
}

/// An event emitted by a module while applying a transaction or hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub module: String,
    pub name: String,
    pub data: Vec<u8>,
}

/// The result of successfully executing a block.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Deterministic root over the post-block state.
    pub state_root: Hash,
    pub events: Vec<EngineEvent>,
}

/// Asset semantics for one module.
///
/// Handlers mutate state only through the provided overlay, which keeps them
/// transactional: if any transaction in a block fails, the whole overlay is
/// discarded by the caller.
pub trait ModuleHandler: Send + Sync {
    /// Static checks that need no state. Used during block verification.
    fn verify_transaction(&self, _tx: &Transaction) -> Result<(), EngineError> {
        Ok(())
    }

    /// Pre-block hook.
    fn before_block(&self, _store: &mut StateStore<'_>, _block: &Block) -> Result<(), EngineError> {
        Ok(())
    }

    /// Apply one transaction's asset to the state.
    fn apply(
        &self,
        store: &mut StateStore<'_>,
        tx: &Transaction,
    ) -> Result<Vec<EngineEvent>, EngineError>;

    /// Post-block hook.
    fn after_block(&self, _store: &mut StateStore<'_>, _block: &Block) -> Result<(), EngineError> {
        Ok(())
    }
}

/// The deterministic executor: generic transaction checks plus dispatch into
/// the registered module handlers.
pub struct StateMachine {
    chain_id: ChainId,
    modules: BTreeMap<String, Arc<dyn ModuleHandler>>,
}

impl StateMachine {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            modules: BTreeMap::new(),
        }
    }

    /// Register the handler for a module name. Later registrations replace
    /// earlier ones.
    pub fn register(&mut self, module: impl Into<String>, handler: Arc<dyn ModuleHandler>) {
        self.modules.insert(module.into(), handler);
    }

    /// Static per-transaction checks used by block verification: signature
    /// and module-level structural validity. No state access.
    pub fn verify_transaction_static(&self, tx: &Transaction) -> Result<(), EngineError> {
        if !tx.verify_signature(&self.chain_id) {
            return Err(EngineError::InvalidSignature { id: tx.id() });
        }
        let handler = self
            .modules
            .get(&tx.module)
            .ok_or_else(|| EngineError::UnknownModule(tx.module.clone()))?;
        handler.verify_transaction(tx)
    }

    /// Execute a block against the overlay.
    ///
    /// On error the overlay is in an unspecified intermediate state and must
    /// be discarded by the caller; nothing has been persisted.
    #[instrument(skip(self, store, block), fields(
        height = block.height(),
        tx_count = block.transactions.len()
    ))]
    pub fn execute_block(
        &self,
        store: &mut StateStore<'_>,
        block: &Block,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut events = Vec::new();

        for (name, handler) in &self.modules {
            handler.before_block(store, block).map_err(|e| match e {
                EngineError::Hook { .. } => e,
                other => EngineError::Hook {
                    module: name.clone(),
                    reason: other.to_string(),
                },
            })?;
        }

        for tx in &block.transactions {
            events.extend(self.apply_transaction(store, tx)?);
        }

        for (name, handler) in &self.modules {
            handler.after_block(store, block).map_err(|e| match e {
                EngineError::Hook { .. } => e,
                other => EngineError::Hook {
                    module: name.clone(),
                    reason: other.to_string(),
                },
            })?;
        }

        let state_root = store.state_root();
        debug!(height = block.height(), state_root = %state_root, "Executed block");
        Ok(ExecutionOutcome { state_root, events })
    }

    fn apply_transaction(
        &self,
        store: &mut StateStore<'_>,
        tx: &Transaction,
    ) -> Result<Vec<EngineEvent>, EngineError> {
        if !tx.verify_signature(&self.chain_id) {
            return Err(EngineError::InvalidSignature { id: tx.id() });
        }

        // Nonce check against the sender's stored nonce, then advance it.
        let sender = tx.sender_address();
        let nonce_key = state_key(AUTH_MODULE, sender.as_bytes());
        let stored_nonce = store
            .get(&nonce_key)
            .and_then(|v| v.try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0);
        if tx.nonce != stored_nonce {
            return Err(EngineError::NonceMismatch {
                id: tx.id(),
                expected: stored_nonce,
                actual: tx.nonce,
            });
        }
        store.set(nonce_key, (stored_nonce + 1).to_be_bytes().to_vec());

        let handler = self
            .modules
            .get(&tx.module)
            .ok_or_else(|| EngineError::UnknownModule(tx.module.clone()))?;
        handler.apply(store, tx)
    }
}
