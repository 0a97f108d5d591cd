//! Inventory announcements.

use std::sync::Arc;

use super::blocks::BlockProcessor;
use super::transactions::TransactionProcessor;
use crate::error::ChainResult;
use crate::types::InventoryItem;

/// Answers what to request from a peer that announced inventory.
pub struct InventoryProcessor {
    transactions: Arc<TransactionProcessor>,
    blocks: Arc<BlockProcessor>,
}

impl InventoryProcessor {
    pub fn new(transactions: Arc<TransactionProcessor>, blocks: Arc<BlockProcessor>) -> Self {
        Self {
            transactions,
            blocks,
        }
    }

    /// Whether the item is committed, buffered or orphaned, so fetching it again
    /// would be wasted.
    pub fn already_has(&self, item: &InventoryItem) -> ChainResult<bool> {
        match item {
            InventoryItem::Transaction(txid) => {
                Ok(self.transactions.is_orphan(txid) || self.transactions.exists(txid)?)
            }
            InventoryItem::Block(hash) => self.blocks.is_known(hash),
        }
    }

    /// For an orphaned item, the topmost ancestor nobody has delivered yet.
    pub fn missing_ancestor(&self, item: &InventoryItem) -> Option<InventoryItem> {
        match item {
            InventoryItem::Transaction(txid) => {
                self.transactions.missing_ancestor(txid).map(InventoryItem::Transaction)
            }
            InventoryItem::Block(hash) => self.blocks.missing_ancestor(hash).map(InventoryItem::Block),
        }
    }

    /// The announced items worth requesting, in announcement order.
    pub fn filter_unknown(&self, items: &[InventoryItem]) -> ChainResult<Vec<InventoryItem>> {
        let mut wanted = Vec::new();
        for item in items {
            if !self.already_has(item)? {
                wanted.push(*item);
            }
        }
        Ok(wanted)
    }
}
