//! Metadata State Module
//!
//! An eventually consistent, namespaced key-value store gossiped alongside
//! cluster membership. Every entry carries a version vector so that merges
//! can tell causal dominance from genuine concurrency; concurrent writes are
//! resolved by a deterministic tie-break so all replicas converge.
//!
//! ## Reconciliation Paths
//! - **Incremental gossip**: each local mutation is broadcast as a
//!   `StateUpdate` and applied remotely through [`StateManager::merge_update`].
//! - **Anti-entropy**: a periodic full [`StateSnapshot`] exchange repairs
//!   drift from dropped incremental updates.

pub mod manager;
pub mod types;

pub use manager::StateManager;
pub use types::{StateOp, StateSnapshot, StateUpdate, VersionVector};

#[cfg(test)]
mod tests;
