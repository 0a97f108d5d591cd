//! Chain acceptance
//!
//! This module decides when out-of-order blocks and transactions become part of
//! the canonical chain:
//! - Orphan tracking and recursive promotion once a dependency arrives
//! - Two-source commit of consensual headers and received block bodies
//! - The chain view the committed items are applied to

pub mod chain_tip;
pub mod commit_gate;
pub mod orphan_pool;
pub mod view;


pub use chain_tip::ChainTip;
pub use commit_gate::ChainCommitGate;
pub use orphan_pool::{OrphanEntry, OrphanPool, OrphanPoolStats, Promotion};
pub use view::{AcceptAllVerifier, ChainView, MemoryChainView, TransactionVerifier};
