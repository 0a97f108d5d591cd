//! Fully wired processors over a temporary data directory.

use std::sync::Arc;

use dashcore::{Block, Txid};
use tempfile::TempDir;

use super::fixtures::genesis_block;
use crate::chain::{ChainCommitGate, MemoryChainView, OrphanPool};
use crate::processor::{BlockProcessor, InventoryProcessor, TransactionProcessor};
use crate::storage::{BlockStore, PendingJournal, BLOCKS_DIR_NAME, PENDING_DIR_NAME};

const MAX_FILE_SIZE: u64 = 1024 * 1024;

pub struct Harness {
    pub dir: TempDir,
    pub genesis: Block,
    pub view: Arc<MemoryChainView>,
    pub gate: Arc<ChainCommitGate>,
    pub journal: Arc<PendingJournal>,
    pub transactions: Arc<TransactionProcessor>,
    pub blocks: Arc<BlockProcessor>,
    pub inventory: InventoryProcessor,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let genesis = genesis_block();

        let store =
            Arc::new(BlockStore::open(dir.path().join(BLOCKS_DIR_NAME), MAX_FILE_SIZE).unwrap());
        let journal =
            Arc::new(PendingJournal::open(dir.path().join(PENDING_DIR_NAME), MAX_FILE_SIZE).unwrap());
        let view = Arc::new(MemoryChainView::new());
        let gate =
            Arc::new(ChainCommitGate::open(store.clone(), view.clone(), &genesis).unwrap());

        let transactions = Arc::new(TransactionProcessor::new(
            view.clone(),
            Arc::new(OrphanPool::new("transaction")),
            Some(journal.clone()),
        ));
        let blocks = Arc::new(BlockProcessor::new(
            gate.clone(),
            store,
            Arc::new(OrphanPool::new("block")),
            transactions.clone(),
            Some(journal.clone()),
        ));
        let inventory = InventoryProcessor::new(transactions.clone(), blocks.clone());

        Self {
            dir,
            genesis,
            view,
            gate,
            journal,
            transactions,
            blocks,
            inventory,
        }
    }

    /// The genesis coinbase, spendable by test transactions.
    pub fn coinbase_txid(&self) -> Txid {
        self.genesis.txdata[0].txid()
    }
}
