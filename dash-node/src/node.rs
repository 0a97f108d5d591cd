//! The node context: every shared component, built once at startup.

use std::collections::HashSet;
use std::sync::Arc;

use dashcore::blockdata::constants::genesis_block;
use dashcore::Block;
use tracing::{info, warn};

use crate::chain::{ChainCommitGate, ChainTip, ChainView, MemoryChainView, OrphanPool};
use crate::config::Config;
use crate::error::{NodeError, Result};
use crate::processor::{BlockProcessor, InventoryProcessor, TransactionProcessor};
use crate::storage::{BlockStore, DataDirLock, JournalEntry, PendingJournal};
use crate::types::NodeStats;

/// A running chain-acceptance engine over one data directory.
///
/// Holds the data directory lock for its whole lifetime. Processors are
/// handed out as `Arc`s so network and consensus handlers can share them.
pub struct Node {
    config: Config,
    store: Arc<BlockStore>,
    journal: Option<Arc<PendingJournal>>,
    view: Arc<MemoryChainView>,
    gate: Arc<ChainCommitGate>,
    transactions: Arc<TransactionProcessor>,
    blocks: Arc<BlockProcessor>,
    inventory: Arc<InventoryProcessor>,
    // Declared last so it is released after the stores are closed.
    _lock: DataDirLock,
}

impl Node {
    /// Open the node with the network's genesis block.
    pub fn open(config: Config) -> Result<Self> {
        let genesis = genesis_block(config.network);
        Self::open_with_genesis(config, &genesis)
    }

    /// Open the node on top of a custom genesis block.
    ///
    /// Locks the data directory, rebuilds the chain from the block files,
    /// replays the pending journal and compacts it down to what is still pending.
    pub fn open_with_genesis(config: Config, genesis: &Block) -> Result<Self> {
        config.validate().map_err(NodeError::Config)?;
        let lock = DataDirLock::acquire(&config.data_dir)?;

        let store = Arc::new(BlockStore::open(config.blocks_dir(), config.max_record_file_size)?);
        let journal = if config.journal_pending {
            Some(Arc::new(PendingJournal::open(config.pending_dir(), config.max_record_file_size)?))
        } else {
            None
        };

        let view = Arc::new(MemoryChainView::new());
        let chain_view: Arc<dyn ChainView> = view.clone();
        let gate = Arc::new(ChainCommitGate::open(store.clone(), chain_view.clone(), genesis)?);

        let transactions = Arc::new(TransactionProcessor::new(
            chain_view,
            Arc::new(OrphanPool::with_config(
                "transaction",
                config.max_orphan_transactions,
                config.orphan_timeout,
            )),
            journal.clone(),
        ));
        let blocks = Arc::new(BlockProcessor::new(
            gate.clone(),
            store.clone(),
            Arc::new(OrphanPool::with_config(
                "block",
                config.max_orphan_blocks,
                config.orphan_timeout,
            )),
            transactions.clone(),
            journal.clone(),
        ));
        let inventory = Arc::new(InventoryProcessor::new(transactions.clone(), blocks.clone()));

        let node = Self {
            config,
            store,
            journal,
            view,
            gate,
            transactions,
            blocks,
            inventory,
            _lock: lock,
        };
        node.replay_journal()?;
        node.compact_journal()?;

        info!("Node opened at {} with tip {}", node.config.data_dir.display(), node.tip()?);
        Ok(node)
    }

    /// Feed journaled items back through the processors. Committed items are
    /// no-ops; an item that no longer fits the chain is skipped.
    fn replay_journal(&self) -> Result<()> {
        let journal = match &self.journal {
            Some(journal) => journal,
            None => return Ok(()),
        };

        journal.replay(|entry| {
            let applied = match entry {
                JournalEntry::ConsensualHeader(header) => {
                    self.blocks.put_consensual_header(header).map(|_| ())
                }
                JournalEntry::ReceivedBlock(block) => {
                    self.blocks.accept_block(&block.block_hash(), block).map(|_| ())
                }
                JournalEntry::OrphanTransaction(tx) => {
                    self.transactions.put_transaction(&tx.txid(), tx).map(|_| ())
                }
            };
            match applied {
                Err(e) if e.is_retryable() => {
                    warn!("Skipping journaled item that no longer applies: {}", e);
                    Ok(())
                }
                other => other.map_err(NodeError::from),
            }
        })?;
        Ok(())
    }

    /// Drop journal entries whose items were committed, went stale or expired
    /// during replay. Repeated entries keep their first occurrence.
    ///
    /// Runs before any processor is handed out.
    fn compact_journal(&self) -> Result<()> {
        let journal = match &self.journal {
            Some(journal) => journal,
            None => return Ok(()),
        };

        let mut headers = HashSet::new();
        let mut bodies = HashSet::new();
        let mut transactions = HashSet::new();
        journal.compact(|entry| {
            // A lookup failure keeps the entry; replay sorts it out next time.
            match entry {
                JournalEntry::ConsensualHeader(header) => {
                    let hash = header.block_hash();
                    headers.insert(hash) && self.gate.has_pending_header(&hash).unwrap_or(true)
                }
                JournalEntry::ReceivedBlock(block) => {
                    let hash = block.block_hash();
                    bodies.insert(hash)
                        && (self.blocks.is_orphan(&hash)
                            || self.gate.has_pending_body(&hash).unwrap_or(true))
                }
                JournalEntry::OrphanTransaction(tx) => {
                    let txid = tx.txid();
                    transactions.insert(txid) && self.transactions.is_orphan(&txid)
                }
            }
        })?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tip(&self) -> Result<ChainTip> {
        Ok(self.gate.tip()?)
    }

    pub fn transactions(&self) -> Arc<TransactionProcessor> {
        self.transactions.clone()
    }

    pub fn blocks(&self) -> Arc<BlockProcessor> {
        self.blocks.clone()
    }

    pub fn inventory(&self) -> Arc<InventoryProcessor> {
        self.inventory.clone()
    }

    pub fn chain_view(&self) -> Arc<MemoryChainView> {
        self.view.clone()
    }

    pub fn block_store(&self) -> Arc<BlockStore> {
        self.store.clone()
    }

    /// Drop orphans that waited longer than the configured timeout.
    pub fn expire_orphans(&self) -> usize {
        let expired = self.blocks.orphans().remove_expired().len()
            + self.transactions.orphans().remove_expired().len();
        if expired > 0 {
            info!("Expired {} orphans", expired);
        }
        expired
    }

    /// Sync the block files and the journal to disk.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()?;
        if let Some(journal) = &self.journal {
            journal.flush()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<NodeStats> {
        let tip = self.gate.tip()?;
        let storage = self.store.stats()?;
        let journal_files = match &self.journal {
            Some(journal) => journal.file_count()?,
            None => 0,
        };

        Ok(NodeStats {
            tip_hash: tip.hash.to_string(),
            tip_height: tip.height,
            pending_headers: self.gate.pending_headers()?.len(),
            pending_bodies: self.gate.pending_bodies()?.len(),
            orphan_blocks: self.blocks.orphans().len(),
            orphan_transactions: self.transactions.orphans().len(),
            block_files: storage.file_count,
            last_block_file_size: storage.last_file_size,
            journal_files,
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush node storage on shutdown: {}", e);
        }
    }
}
