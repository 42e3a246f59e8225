//! Deterministic state-machine executor.
//!
//! This crate applies verified blocks to the state store. The executor does
//! NOT own storage - the caller opens a [`meridian_chain::StateStore`]
//! overlay and passes it in; on failure the caller discards the overlay and
//! nothing has happened.
//!
//! # Design Principle
//!
//! Execution is synchronous and deterministic: given the same block and the
//! same pre-state, every node produces a byte-identical state root and diff.
//! Module semantics (token transfers, votes, ...) are external collaborators
//! registered as [`ModuleHandler`]s; the executor owns only the generic
//! transaction checks (signature, nonce) and the hook ordering.

mod executor;

pub use executor::{
    EngineError, EngineEvent, ExecutionOutcome, ModuleHandler, StateMachine,
};
