//! The node's view of the main chain.
//!
//! [`ChainView`] is the seam between the acceptance engine and whatever keeps
//! the chain state (UTXO set, wallet bookkeeping, ...). The engine only asks
//! whether something is already known and hands over items to apply.
//! [`MemoryChainView`] is the in-process implementation used by the node.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashcore::{Block, BlockHash, OutPoint, Transaction, Txid};
use tracing::{debug, trace};

use crate::error::{ChainError, ChainResult};

/// Script and policy checks on a loose transaction.
pub trait TransactionVerifier: Send + Sync {
    /// Returns the reason the transaction is invalid, if it is.
    fn verify(&self, tx: &Transaction) -> Result<(), String>;
}

/// Verifier that accepts every transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllVerifier;

impl TransactionVerifier for AcceptAllVerifier {
    fn verify(&self, _tx: &Transaction) -> Result<(), String> {
        Ok(())
    }
}

/// Chain state the acceptance engine commits into.
pub trait ChainView: Send + Sync {
    fn has_block(&self, hash: &BlockHash) -> ChainResult<bool>;

    fn has_transaction(&self, txid: &Txid) -> ChainResult<bool>;

    fn get_transaction(&self, txid: &Txid) -> ChainResult<Option<Transaction>>;

    /// Apply `block` on top of the best block.
    ///
    /// Fails with [`ChainError::NonContinuousBlockHeaders`] when the block does
    /// not extend the best block. Re-applying a known block is a no-op.
    fn put_block(&self, hash: &BlockHash, block: &Block) -> ChainResult<()>;

    /// Apply a loose transaction.
    ///
    /// Fails with [`ChainError::ParentTransactionNotFound`] when an input spends
    /// an unknown transaction and [`ChainError::TransactionOutputAlreadySpent`]
    /// when an input was already spent by a different transaction. Re-applying a
    /// known transaction is a no-op.
    fn put_transaction(&self, txid: &Txid, tx: &Transaction) -> ChainResult<()>;

    fn best_block_hash(&self) -> ChainResult<Option<BlockHash>>;
}

#[derive(Default)]
struct ViewState {
    block_heights: HashMap<BlockHash, u32>,
    best: Option<(BlockHash, u32)>,
    transactions: HashMap<Txid, Transaction>,
    spent_by: HashMap<OutPoint, Txid>,
}

impl ViewState {
    fn record_transaction(&mut self, txid: Txid, tx: &Transaction) {
        for input in &tx.input {
            if !input.previous_output.is_null() {
                self.spent_by.insert(input.previous_output, txid);
            }
        }
        self.transactions.insert(txid, tx.clone());
    }
}

/// In-memory [`ChainView`] tracking blocks, transactions and spent outputs.
pub struct MemoryChainView {
    state: RwLock<ViewState>,
    verifier: Arc<dyn TransactionVerifier>,
}

impl Default for MemoryChainView {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChainView {
    pub fn new() -> Self {
        Self::with_verifier(Arc::new(AcceptAllVerifier))
    }

    pub fn with_verifier(verifier: Arc<dyn TransactionVerifier>) -> Self {
        Self {
            state: RwLock::new(ViewState::default()),
            verifier,
        }
    }

    /// Height of the best block, if any block was applied.
    pub fn best_height(&self) -> ChainResult<Option<u32>> {
        Ok(self.read()?.best.map(|(_, height)| height))
    }

    /// Transaction that spent `outpoint`, if any.
    pub fn spender_of(&self, outpoint: &OutPoint) -> ChainResult<Option<Txid>> {
        Ok(self.read()?.spent_by.get(outpoint).copied())
    }

    pub fn transaction_count(&self) -> ChainResult<usize> {
        Ok(self.read()?.transactions.len())
    }

    fn read(&self) -> ChainResult<RwLockReadGuard<'_, ViewState>> {
        self.state.read().map_err(|_| ChainError::LockPoisoned("chain view".to_string()))
    }

    fn write(&self) -> ChainResult<RwLockWriteGuard<'_, ViewState>> {
        self.state.write().map_err(|_| ChainError::LockPoisoned("chain view".to_string()))
    }
}

impl ChainView for MemoryChainView {
    fn has_block(&self, hash: &BlockHash) -> ChainResult<bool> {
        Ok(self.read()?.block_heights.contains_key(hash))
    }

    fn has_transaction(&self, txid: &Txid) -> ChainResult<bool> {
        Ok(self.read()?.transactions.contains_key(txid))
    }

    fn get_transaction(&self, txid: &Txid) -> ChainResult<Option<Transaction>> {
        Ok(self.read()?.transactions.get(txid).cloned())
    }

    fn put_block(&self, hash: &BlockHash, block: &Block) -> ChainResult<()> {
        let actual = block.block_hash();
        if *hash != actual {
            return Err(ChainError::BlockHashMismatch {
                expected: *hash,
                actual,
            });
        }

        let mut state = self.write()?;
        if state.block_heights.contains_key(hash) {
            return Ok(());
        }

        let height = match state.best {
            None => 0,
            Some((best, best_height)) if best == block.header.prev_blockhash => best_height + 1,
            Some((best, best_height)) => {
                // Parent known but no longer the best block: a stale height.
                if let Some(parent_height) = state.block_heights.get(&block.header.prev_blockhash) {
                    return Err(ChainError::InvalidBlockHeight {
                        height: parent_height + 1,
                        tip_height: best_height,
                    });
                }
                return Err(ChainError::NonContinuousBlockHeaders {
                    expected: best,
                    actual: block.header.prev_blockhash,
                });
            }
        };

        // Confirmed transactions displace any conflicting loose spend.
        for tx in &block.txdata {
            state.record_transaction(tx.txid(), tx);
        }
        state.block_heights.insert(*hash, height);
        state.best = Some((*hash, height));

        debug!("Applied block {} at height {} ({} txs)", hash, height, block.txdata.len());
        Ok(())
    }

    fn put_transaction(&self, txid: &Txid, tx: &Transaction) -> ChainResult<()> {
        let mut state = self.write()?;
        if state.transactions.contains_key(txid) {
            return Ok(());
        }

        for input in &tx.input {
            let outpoint = input.previous_output;
            if outpoint.is_null() {
                continue;
            }
            let parent = state
                .transactions
                .get(&outpoint.txid)
                .ok_or(ChainError::ParentTransactionNotFound(outpoint.txid))?;
            if outpoint.vout as usize >= parent.output.len() {
                return Err(ChainError::Verification {
                    txid: *txid,
                    reason: format!("input spends missing output {}", outpoint),
                });
            }
            match state.spent_by.get(&outpoint) {
                Some(spender) if spender != txid => {
                    return Err(ChainError::TransactionOutputAlreadySpent(outpoint));
                }
                _ => {}
            }
        }

        self.verifier.verify(tx).map_err(|reason| ChainError::Verification {
            txid: *txid,
            reason,
        })?;

        state.record_transaction(*txid, tx);
        trace!("Applied transaction {}", txid);
        Ok(())
    }

    fn best_block_hash(&self) -> ChainResult<Option<BlockHash>> {
        Ok(self.read()?.best.map(|(hash, _)| hash))
    }
}
