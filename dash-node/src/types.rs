//! Common type definitions for the Dash node.

use std::fmt;

use dashcore::{BlockHash, Txid};
use serde::{Deserialize, Serialize};

/// An item announced by a peer in an `inv` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryItem {
    Transaction(Txid),
    Block(BlockHash),
}

impl fmt::Display for InventoryItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryItem::Transaction(txid) => write!(f, "tx {}", txid),
            InventoryItem::Block(hash) => write!(f, "block {}", hash),
        }
    }
}

/// Snapshot of the node's chain-acceptance state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Hash of the last committed block.
    pub tip_hash: String,

    /// Height of the last committed block.
    pub tip_height: u32,

    /// Consensual headers waiting for their bodies.
    pub pending_headers: usize,

    /// Block bodies waiting at the commit gate.
    pub pending_bodies: usize,

    /// Blocks waiting for an unknown parent.
    pub orphan_blocks: usize,

    /// Transactions waiting for an unknown input.
    pub orphan_transactions: usize,

    /// Number of block record files.
    pub block_files: u32,

    /// Size in bytes of the block record file being appended to.
    pub last_block_file_size: u64,

    /// Number of pending journal files.
    pub journal_files: u32,
}

/// Summary of a `--import` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    /// Blocks read from the import file.
    pub blocks_read: u64,

    /// Blocks that became canonical during the import. Includes blocks that
    /// were already pending and completed by a block from the file.
    pub blocks_committed: u64,

    /// Blocks that were already committed before the import.
    pub duplicates: u64,

    /// Blocks read from the file that were still not committed when it ended.
    pub left_pending: u64,
}
