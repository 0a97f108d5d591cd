//! Facades the network and consensus layers hand inbound items to.
//!
//! Each processor wires an orphan pool to the place items are committed:
//! transactions go to the [`ChainView`](crate::chain::ChainView), blocks go
//! through the [`ChainCommitGate`](crate::chain::ChainCommitGate).

pub mod blocks;
pub mod inventory;
pub mod transactions;

pub use blocks::{BlockProcessor, BlockStatus};
pub use inventory::InventoryProcessor;
pub use transactions::{TransactionProcessor, TransactionStatus};
