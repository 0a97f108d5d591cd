//! Block acceptance.

use std::sync::Arc;

use dashcore::block::Header as BlockHeader;
use dashcore::{Block, BlockHash};

use super::transactions::TransactionProcessor;
use crate::chain::{ChainCommitGate, OrphanPool, Promotion};
use crate::error::{ChainError, ChainResult, StorageError};
use crate::storage::{BlockStore, JournalEntry, PendingJournal};

/// What happened to a submitted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    /// The submission committed these blocks, lowest height first.
    Committed(Vec<BlockHash>),
    /// Buffered at the commit gate, waiting for its consensual header or for
    /// the bodies below it.
    Pending,
    /// Already committed earlier.
    Duplicate,
    /// Dropped: its parent is committed but a different block follows it.
    Stale,
    /// Stored as an orphan; `missing` is the ancestor to request from peers.
    Orphaned {
        missing: BlockHash,
    },
}

/// Accepts block bodies from peers and consensual headers from the ordering service.
pub struct BlockProcessor {
    gate: Arc<ChainCommitGate>,
    store: Arc<BlockStore>,
    orphans: Arc<OrphanPool<BlockHash, Block>>,
    transactions: Arc<TransactionProcessor>,
    journal: Option<Arc<PendingJournal>>,
}

impl BlockProcessor {
    pub fn new(
        gate: Arc<ChainCommitGate>,
        store: Arc<BlockStore>,
        orphans: Arc<OrphanPool<BlockHash, Block>>,
        transactions: Arc<TransactionProcessor>,
        journal: Option<Arc<PendingJournal>>,
    ) -> Self {
        Self {
            gate,
            store,
            orphans,
            transactions,
            journal,
        }
    }

    /// Whether the block is committed.
    pub fn exists(&self, hash: &BlockHash) -> ChainResult<bool> {
        self.gate.is_committed(hash)
    }

    /// Whether the block is committed, buffered at the gate or orphaned.
    pub fn is_known(&self, hash: &BlockHash) -> ChainResult<bool> {
        Ok(self.orphans.has_orphan(hash) || self.gate.is_known(hash)?)
    }

    pub fn is_orphan(&self, hash: &BlockHash) -> bool {
        self.orphans.has_orphan(hash)
    }

    /// A committed block, or a body still waiting at the gate.
    pub fn get_block(&self, hash: &BlockHash) -> ChainResult<Option<Block>> {
        if let Some(block) = self.store.get_block(hash)? {
            return Ok(Some(block));
        }
        self.gate.get_pending_body(hash)
    }

    /// Accepts a block received from a peer.
    ///
    /// If the parent is committed or buffered the body goes to the commit gate
    /// and any orphans waiting on it follow. Otherwise it becomes an orphan.
    pub fn accept_block(&self, hash: &BlockHash, block: Block) -> ChainResult<BlockStatus> {
        check_block_hash(hash, &block)?;
        if self.gate.is_committed(hash)? {
            self.orphans.del_orphan(hash);
            return Ok(BlockStatus::Duplicate);
        }

        self.journal(JournalEntry::ReceivedBlock(block.clone()))?;

        let parent = block.header.prev_blockhash;
        if !self.gate.is_known(&parent)? {
            return self.park(*hash, block, parent);
        }

        self.orphans.del_orphan(hash);
        let header = block.header;
        let mut committed = self.submit_body(hash, block)?;
        if committed.is_empty() && self.gate.is_stale_block(&header)? {
            tracing::debug!("Block {} is on a fork below the tip", hash);
            return Ok(BlockStatus::Stale);
        }
        committed.extend(self.promote(hash)?.committed);
        self.promote_committed(&mut committed)?;

        if committed.is_empty() {
            Ok(BlockStatus::Pending)
        } else {
            Ok(BlockStatus::Committed(committed))
        }
    }

    /// Records a header from the ordering service. Returns the blocks it committed.
    pub fn put_consensual_header(&self, header: BlockHeader) -> ChainResult<Vec<BlockHash>> {
        if self.gate.is_committed(&header.block_hash())? {
            return Ok(Vec::new());
        }
        self.journal(JournalEntry::ConsensualHeader(header))?;

        let mut committed = self.gate.put_consensual_header(header)?;
        self.block_committed(&committed)?;
        self.promote_committed(&mut committed)?;
        Ok(committed)
    }

    /// Hands a body straight to the commit gate, bypassing the orphan pool.
    /// Returns the blocks it committed.
    pub fn put_received_block(&self, hash: &BlockHash, block: Block) -> ChainResult<Vec<BlockHash>> {
        check_block_hash(hash, &block)?;
        if self.gate.is_committed(hash)? {
            return Ok(Vec::new());
        }
        self.journal(JournalEntry::ReceivedBlock(block.clone()))?;
        let mut committed = self.submit_body(hash, block)?;
        committed.extend(self.promote(hash)?.committed);
        self.promote_committed(&mut committed)?;
        Ok(committed)
    }

    /// Promotes every orphan block descending from `parent` to the commit gate.
    /// Returns the promoted hashes.
    pub fn accept_children(&self, parent: &BlockHash) -> ChainResult<Vec<BlockHash>> {
        Ok(self.promote(parent)?.accepted)
    }

    /// The ancestor to fetch from peers for orphan `hash`.
    pub fn missing_ancestor(&self, hash: &BlockHash) -> Option<BlockHash> {
        let root = self.orphans.get_orphan_root(hash);
        self.orphans.dependency_of(&root)
    }

    pub fn orphans(&self) -> &OrphanPool<BlockHash, Block> {
        &self.orphans
    }

    fn park(&self, hash: BlockHash, block: Block, parent: BlockHash) -> ChainResult<BlockStatus> {
        self.orphans.put_orphan(hash, block, parent);

        // The parent may have reached the gate between the check and the insert.
        if self.gate.is_known(&parent)? {
            let promoted = self.promote(&parent)?;
            if promoted.accepted.contains(&hash) {
                let mut committed = promoted.committed;
                self.promote_committed(&mut committed)?;
                return Ok(if committed.is_empty() {
                    BlockStatus::Pending
                } else {
                    BlockStatus::Committed(committed)
                });
            }
        }

        tracing::debug!("Block {} is an orphan, waiting on {}", hash, parent);
        Ok(BlockStatus::Orphaned {
            missing: self.missing_ancestor(&hash).unwrap_or(parent),
        })
    }

    fn promote(&self, parent: &BlockHash) -> ChainResult<PromotedBlocks> {
        let mut committed = Vec::new();
        let accepted = self.orphans.accept_children(parent, |hash, block| {
            match self.submit_body(hash, block.clone()) {
                Ok(newly_committed) => {
                    committed.extend(newly_committed);
                    Promotion::Accepted
                }
                Err(e) if e.is_retryable() => Promotion::Deferred(None),
                Err(e) => Promotion::Failed(e),
            }
        })?;
        Ok(PromotedBlocks {
            accepted,
            committed,
        })
    }

    /// Promotes the orphans waiting on each committed block, appending what
    /// those promotions commit.
    ///
    /// Takes the pool's acceptance lock, so it must not run inside a
    /// [`Self::promote`] callback.
    fn promote_committed(&self, committed: &mut Vec<BlockHash>) -> ChainResult<()> {
        let mut next = 0;
        while next < committed.len() {
            let promoted = self.promote(&committed[next])?;
            committed.extend(promoted.committed);
            next += 1;
        }
        Ok(())
    }

    fn submit_body(&self, hash: &BlockHash, block: Block) -> ChainResult<Vec<BlockHash>> {
        let committed = self.gate.put_received_block(hash, block)?;
        self.block_committed(&committed)?;
        Ok(committed)
    }

    fn block_committed(&self, committed: &[BlockHash]) -> ChainResult<()> {
        for hash in committed {
            let block = self.store.get_block(hash)?.ok_or_else(|| {
                ChainError::Storage(StorageError::NotFound(format!("committed block {}", hash)))
            })?;
            self.transactions.block_committed(&block)?;
        }
        Ok(())
    }

    fn journal(&self, entry: JournalEntry) -> ChainResult<()> {
        if let Some(journal) = &self.journal {
            journal.append(&entry)?;
        }
        Ok(())
    }
}

struct PromotedBlocks {
    accepted: Vec<BlockHash>,
    committed: Vec<BlockHash>,
}

fn check_block_hash(hash: &BlockHash, block: &Block) -> ChainResult<()> {
    let actual = block.block_hash();
    if *hash != actual {
        return Err(ChainError::BlockHashMismatch {
            expected: *hash,
            actual,
        });
    }
    Ok(())
}
