//! Transaction acceptance.

use std::sync::Arc;

use dashcore::{Block, Transaction, Txid};

use crate::chain::{ChainView, OrphanPool, Promotion};
use crate::error::{ChainError, ChainResult};
use crate::storage::{JournalEntry, PendingJournal};

/// What happened to a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Applied to the chain view. `promoted` lists orphans applied after it.
    Accepted {
        promoted: Vec<Txid>,
    },
    /// Already applied earlier.
    Duplicate,
    /// Stored as an orphan until `missing` is applied.
    Orphaned {
        missing: Txid,
    },
}

/// Accepts loose transactions, parking the ones whose inputs are unknown.
pub struct TransactionProcessor {
    view: Arc<dyn ChainView>,
    orphans: Arc<OrphanPool<Txid, Transaction>>,
    journal: Option<Arc<PendingJournal>>,
}

impl TransactionProcessor {
    pub fn new(
        view: Arc<dyn ChainView>,
        orphans: Arc<OrphanPool<Txid, Transaction>>,
        journal: Option<Arc<PendingJournal>>,
    ) -> Self {
        Self {
            view,
            orphans,
            journal,
        }
    }

    /// Whether the transaction is applied to the chain view.
    pub fn exists(&self, txid: &Txid) -> ChainResult<bool> {
        self.view.has_transaction(txid)
    }

    pub fn is_orphan(&self, txid: &Txid) -> bool {
        self.orphans.has_orphan(txid)
    }

    pub fn get_transaction(&self, txid: &Txid) -> ChainResult<Option<Transaction>> {
        self.view.get_transaction(txid)
    }

    /// Applies `tx`, or parks it as an orphan if one of its inputs is unknown.
    ///
    /// A spend conflicting with an applied transaction is returned as
    /// [`ChainError::TransactionOutputAlreadySpent`].
    pub fn put_transaction(&self, txid: &Txid, tx: Transaction) -> ChainResult<TransactionStatus> {
        let actual = tx.txid();
        if *txid != actual {
            return Err(ChainError::Verification {
                txid: *txid,
                reason: format!("transaction hashes to {}", actual),
            });
        }
        if self.view.has_transaction(txid)? {
            self.orphans.del_orphan(txid);
            return Ok(TransactionStatus::Duplicate);
        }

        match self.view.put_transaction(txid, &tx) {
            Ok(()) => {
                self.orphans.del_orphan(txid);
                let promoted = self.accept_children(txid)?;
                tracing::debug!("Accepted transaction {} ({} orphans promoted)", txid, promoted.len());
                Ok(TransactionStatus::Accepted {
                    promoted,
                })
            }
            Err(ChainError::ParentTransactionNotFound(missing)) => self.park(*txid, tx, missing),
            Err(e) => Err(e),
        }
    }

    /// Parks `tx` as an orphan under its first input whose transaction is unknown.
    ///
    /// Returns that dependency, or `None` (without parking) when every input is known.
    pub fn put_orphan(&self, txid: &Txid, tx: Transaction) -> ChainResult<Option<Txid>> {
        let missing = match self.first_missing_parent(&tx)? {
            Some(missing) => missing,
            None => return Ok(None),
        };
        self.park(*txid, tx, missing)?;
        Ok(Some(missing))
    }

    /// Promotes every orphan waiting, directly or transitively, on `parent`.
    pub fn accept_children(&self, parent: &Txid) -> ChainResult<Vec<Txid>> {
        self.orphans.accept_children(parent, |txid, tx| match self.view.put_transaction(txid, tx) {
            Ok(()) => Promotion::Accepted,
            Err(ChainError::ParentTransactionNotFound(missing)) => {
                Promotion::Deferred(Some(missing))
            }
            // A conflicting spend may still resolve, e.g. if the other spender
            // is never confirmed, so the orphan waits for expiry.
            Err(e) if e.is_retryable() => Promotion::Deferred(None),
            Err(e) => Promotion::Failed(e),
        })
    }

    /// Drops orphans that a committed block confirmed and promotes orphans
    /// waiting on the block's transactions.
    pub fn block_committed(&self, block: &Block) -> ChainResult<Vec<Txid>> {
        let mut promoted = Vec::new();
        for tx in &block.txdata {
            let txid = tx.txid();
            self.orphans.del_orphan(&txid);
            promoted.extend(self.accept_children(&txid)?);
        }
        Ok(promoted)
    }

    /// The dependency to fetch from peers for orphan `txid`.
    pub fn missing_ancestor(&self, txid: &Txid) -> Option<Txid> {
        let root = self.orphans.get_orphan_root(txid);
        self.orphans.dependency_of(&root)
    }

    pub fn orphans(&self) -> &OrphanPool<Txid, Transaction> {
        &self.orphans
    }

    fn park(&self, txid: Txid, tx: Transaction, missing: Txid) -> ChainResult<TransactionStatus> {
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::OrphanTransaction(tx.clone()))?;
        }
        self.orphans.put_orphan(txid, tx, missing);

        // The parent may have been applied between the failed put and the insert.
        if self.view.has_transaction(&missing)? {
            let mut promoted = self.accept_children(&missing)?;
            if let Some(position) = promoted.iter().position(|hash| *hash == txid) {
                promoted.remove(position);
                return Ok(TransactionStatus::Accepted {
                    promoted,
                });
            }
        }

        Ok(TransactionStatus::Orphaned {
            missing: self.missing_ancestor(&txid).unwrap_or(missing),
        })
    }

    fn first_missing_parent(&self, tx: &Transaction) -> ChainResult<Option<Txid>> {
        for input in &tx.input {
            let outpoint = input.previous_output;
            if !outpoint.is_null() && !self.view.has_transaction(&outpoint.txid)? {
                return Ok(Some(outpoint.txid));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{spend, spend_all, Harness};
    use assert_matches::assert_matches;

    #[test]
    fn test_accept_and_duplicate() {
        let h = Harness::new();
        let tx = spend(h.coinbase_txid(), 0, 1);
        let txid = tx.txid();

        assert_eq!(
            h.transactions.put_transaction(&txid, tx.clone()).unwrap(),
            TransactionStatus::Accepted {
                promoted: vec![]
            }
        );
        assert!(h.transactions.exists(&txid).unwrap());
        assert_eq!(h.transactions.get_transaction(&txid).unwrap(), Some(tx.clone()));
        assert_eq!(
            h.transactions.put_transaction(&txid, tx).unwrap(),
            TransactionStatus::Duplicate
        );
    }

    #[test]
    fn test_orphan_chain_promoted_when_parent_arrives() {
        let h = Harness::new();
        let a = spend(h.coinbase_txid(), 0, 1);
        let b = spend(a.txid(), 0, 2);
        let c = spend(b.txid(), 0, 3);

        assert_eq!(
            h.transactions.put_transaction(&c.txid(), c.clone()).unwrap(),
            TransactionStatus::Orphaned {
                missing: b.txid()
            }
        );
        // b is an orphan too, so c's missing ancestor moves up to a
        assert_eq!(
            h.transactions.put_transaction(&b.txid(), b.clone()).unwrap(),
            TransactionStatus::Orphaned {
                missing: a.txid()
            }
        );
        assert_eq!(h.transactions.missing_ancestor(&c.txid()), Some(a.txid()));

        assert_eq!(
            h.transactions.put_transaction(&a.txid(), a.clone()).unwrap(),
            TransactionStatus::Accepted {
                promoted: vec![b.txid(), c.txid()]
            }
        );
        assert!(h.transactions.orphans().is_empty());
        assert!(h.transactions.exists(&c.txid()).unwrap());
        assert!(h.transactions.accept_children(&a.txid()).unwrap().is_empty());
    }

    #[test]
    fn test_orphan_with_two_missing_parents() {
        let h = Harness::new();
        let a = spend(h.coinbase_txid(), 0, 1);
        let b = spend(h.coinbase_txid(), 0, 2);
        let joined = spend_all(&[(a.txid(), 0), (b.txid(), 0)], 3);

        h.transactions.put_transaction(&joined.txid(), joined.clone()).unwrap();
        h.transactions.put_transaction(&a.txid(), a.clone()).unwrap();

        // Promotion ran into b missing and re-filed the orphan under it
        assert!(h.transactions.is_orphan(&joined.txid()));
        assert_eq!(h.transactions.orphans().dependency_of(&joined.txid()), Some(b.txid()));
    }

    #[test]
    fn test_conflicting_spend_propagates() {
        let h = Harness::new();
        let first = spend(h.coinbase_txid(), 0, 1);
        let second = spend(h.coinbase_txid(), 0, 2);

        h.transactions.put_transaction(&first.txid(), first).unwrap();
        assert_matches!(
            h.transactions.put_transaction(&second.txid(), second),
            Err(ChainError::TransactionOutputAlreadySpent(_))
        );
    }

    #[test]
    fn test_conflicting_orphan_stays_orphaned() {
        let h = Harness::new();
        let parent = spend(h.coinbase_txid(), 0, 1);
        let first = spend(parent.txid(), 0, 2);
        let second = spend(parent.txid(), 0, 3);

        h.transactions.put_transaction(&first.txid(), first.clone()).unwrap();
        h.transactions.put_transaction(&second.txid(), second.clone()).unwrap();

        let status = h.transactions.put_transaction(&parent.txid(), parent).unwrap();
        assert_eq!(
            status,
            TransactionStatus::Accepted {
                promoted: vec![first.txid()]
            }
        );
        assert!(h.transactions.is_orphan(&second.txid()));
        assert!(!h.transactions.exists(&second.txid()).unwrap());
    }

    #[test]
    fn test_put_orphan_finds_missing_parent() {
        let h = Harness::new();
        let a = spend(h.coinbase_txid(), 0, 1);
        let b = spend_all(&[(h.coinbase_txid(), 0), (a.txid(), 0)], 2);

        assert_eq!(h.transactions.put_orphan(&b.txid(), b.clone()).unwrap(), Some(a.txid()));
        assert!(h.transactions.is_orphan(&b.txid()));

        let known = spend(h.coinbase_txid(), 0, 3);
        assert_eq!(h.transactions.put_orphan(&known.txid(), known.clone()).unwrap(), None);
        assert!(!h.transactions.is_orphan(&known.txid()));
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let h = Harness::new();
        let a = spend(h.coinbase_txid(), 0, 1);
        let b = spend(h.coinbase_txid(), 0, 2);
        assert_matches!(
            h.transactions.put_transaction(&a.txid(), b),
            Err(ChainError::Verification { .. })
        );
    }
}
