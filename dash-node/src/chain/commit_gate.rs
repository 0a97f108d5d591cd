//! Two-source commit protocol.
//!
//! The ordering service delivers consensual headers; peers deliver block bodies.
//! A block becomes canonical only when its header and its body are both present
//! and its parent is the current tip. Either half alone never moves the tip.
//!
//! Per height the state goes `EMPTY -> HEADER_ONLY | BODY_ONLY -> ready ->
//! COMMITTED`. Everything from reading the buffers to advancing the tip happens
//! under one mutex, so concurrent deliveries cannot commit the same height twice
//! or skip one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use dashcore::block::Header as BlockHeader;
use dashcore::{Block, BlockHash};
use tracing::{debug, info, trace};

use super::chain_tip::ChainTip;
use super::view::ChainView;
use crate::error::{ChainError, ChainResult, StorageError};
use crate::storage::BlockStore;

struct GateState {
    tip: ChainTip,
    /// Consensual headers above the tip, each linking to the one before it.
    pending_headers: VecDeque<(BlockHash, BlockHeader)>,
    /// Received bodies not yet committed, keyed by header hash.
    pending_bodies: HashMap<BlockHash, Block>,
}

/// Reconciles consensual headers with received block bodies and commits the
/// resulting chain to the [`BlockStore`] and the [`ChainView`].
pub struct ChainCommitGate {
    state: Mutex<GateState>,
    store: Arc<BlockStore>,
    view: Arc<dyn ChainView>,
}

impl ChainCommitGate {
    /// Builds the gate on top of whatever `store` already holds.
    ///
    /// Stored blocks are applied to `view` in height order. An empty store gets
    /// `genesis` committed at height 0. The tip starts at the last stored block.
    pub fn open(
        store: Arc<BlockStore>,
        view: Arc<dyn ChainView>,
        genesis: &Block,
    ) -> ChainResult<Self> {
        let mut replayed = 0usize;
        for block in store.blocks()? {
            let block = block?;
            view.put_block(&block.block_hash(), &block)?;
            replayed += 1;
        }

        if replayed == 0 {
            let hash = genesis.block_hash();
            store.put_block(0, genesis)?;
            view.put_block(&hash, genesis)?;
            info!("Committed genesis block {}", hash);
        }

        let (hash, height) = store.tip()?.ok_or_else(|| {
            ChainError::Storage(StorageError::InconsistentState(
                "block store is empty after genesis commit".to_string(),
            ))
        })?;
        let tip = ChainTip::new(hash, height);
        debug!("Commit gate starting at {} ({} stored blocks applied)", tip, replayed);

        Ok(Self {
            state: Mutex::new(GateState {
                tip,
                pending_headers: VecDeque::new(),
                pending_bodies: HashMap::new(),
            }),
            store,
            view,
        })
    }

    /// Records a header from the ordering service and commits whatever became ready.
    ///
    /// The header must link to the last pending header, or to the tip when none
    /// is pending. Returns the hashes committed by this call, in height order.
    pub fn put_consensual_header(&self, header: BlockHeader) -> ChainResult<Vec<BlockHash>> {
        let hash = header.block_hash();
        let mut state = self.lock()?;

        if self.store.contains(&hash)? {
            trace!("Ignoring committed consensual header {}", hash);
            return Ok(Vec::new());
        }
        if state.pending_headers.iter().any(|(pending, _)| *pending == hash) {
            trace!("Consensual header {} already pending", hash);
            // A commit that failed earlier is retried here.
            return self.advance(&mut state);
        }

        let expected =
            state.pending_headers.back().map(|(last, _)| *last).unwrap_or(state.tip.hash);
        if header.prev_blockhash != expected {
            return Err(ChainError::NonContinuousBlockHeaders {
                expected,
                actual: header.prev_blockhash,
            });
        }

        state.pending_headers.push_back((hash, header));
        trace!("Consensual header {} pending ({} pending)", hash, state.pending_headers.len());
        self.advance(&mut state)
    }

    /// Records a block body received from a peer and commits whatever became ready.
    ///
    /// `hash` is the hash the body was announced under; a body hashing to
    /// anything else is rejected. Returns the hashes committed by this call.
    pub fn put_received_block(&self, hash: &BlockHash, block: Block) -> ChainResult<Vec<BlockHash>> {
        let actual = block.block_hash();
        if *hash != actual {
            return Err(ChainError::BlockHashMismatch {
                expected: *hash,
                actual,
            });
        }

        let mut state = self.lock()?;
        if self.store.contains(hash)? {
            trace!("Ignoring committed block {}", hash);
            return Ok(Vec::new());
        }
        if self.is_stale(&state, &block.header)? {
            debug!("Dropping block {} on a fork below the tip {}", hash, state.tip);
            return Ok(Vec::new());
        }

        state.pending_bodies.insert(*hash, block);
        trace!("Block body {} pending ({} pending)", hash, state.pending_bodies.len());
        self.advance(&mut state)
    }

    pub fn tip(&self) -> ChainResult<ChainTip> {
        Ok(self.lock()?.tip)
    }

    pub fn is_committed(&self, hash: &BlockHash) -> ChainResult<bool> {
        Ok(self.store.contains(hash)?)
    }

    pub fn has_pending_header(&self, hash: &BlockHash) -> ChainResult<bool> {
        Ok(self.lock()?.pending_headers.iter().any(|(pending, _)| pending == hash))
    }

    pub fn has_pending_body(&self, hash: &BlockHash) -> ChainResult<bool> {
        Ok(self.lock()?.pending_bodies.contains_key(hash))
    }

    pub fn get_pending_body(&self, hash: &BlockHash) -> ChainResult<Option<Block>> {
        Ok(self.lock()?.pending_bodies.get(hash).cloned())
    }

    /// Hashes of the pending consensual headers, lowest height first.
    pub fn pending_headers(&self) -> ChainResult<Vec<BlockHash>> {
        Ok(self.lock()?.pending_headers.iter().map(|(hash, _)| *hash).collect())
    }

    /// Hashes of the pending block bodies, in no particular order.
    pub fn pending_bodies(&self) -> ChainResult<Vec<BlockHash>> {
        Ok(self.lock()?.pending_bodies.keys().copied().collect())
    }

    /// Whether the block with `header` can never be committed because a
    /// different block already occupies its height.
    ///
    /// Once true this stays true: the tip only moves forward.
    pub fn is_stale_block(&self, header: &BlockHeader) -> ChainResult<bool> {
        let state = self.lock()?;
        if self.store.contains(&header.block_hash())? {
            return Ok(false);
        }
        self.is_stale(&state, header)
    }

    fn is_stale(&self, state: &GateState, header: &BlockHeader) -> ChainResult<bool> {
        let parent = header.prev_blockhash;
        Ok(parent != state.tip.hash && self.store.contains(&parent)?)
    }

    /// Whether `hash` is committed or waiting in either buffer.
    pub fn is_known(&self, hash: &BlockHash) -> ChainResult<bool> {
        if self.store.contains(hash)? {
            return Ok(true);
        }
        let state = self.lock()?;
        Ok(state.pending_bodies.contains_key(hash)
            || state.pending_headers.iter().any(|(pending, _)| pending == hash))
    }

    /// Commits heights while the next header has its body.
    fn advance(&self, state: &mut GateState) -> ChainResult<Vec<BlockHash>> {
        let mut committed = Vec::new();

        while let Some(&(hash, _)) = state.pending_headers.front() {
            let block = match state.pending_bodies.remove(&hash) {
                Some(block) => block,
                None => break,
            };

            let height = state.tip.height + 1;
            if let Err(e) = self.commit(&hash, height, &block) {
                state.pending_bodies.insert(hash, block);
                return Err(e);
            }

            state.pending_headers.pop_front();
            let parent = state.tip.hash;
            state.tip = state.tip.next(hash);

            let dropped = drop_forks(&mut state.pending_bodies, parent);
            if dropped > 0 {
                debug!("Dropped {} stale fork bodies beside {}", dropped, hash);
            }

            info!("Committed block {} at height {}", hash, height);
            committed.push(hash);
        }

        Ok(committed)
    }

    /// Applies the block to the view, then persists it.
    ///
    /// The store is what marks a block committed, so a failure in either step
    /// leaves the height open and the next delivery retries it. The view
    /// treats a block it already holds as a no-op.
    fn commit(&self, hash: &BlockHash, height: u32, block: &Block) -> ChainResult<()> {
        self.view.put_block(hash, block)?;
        self.store.put_block(height, block)?;
        Ok(())
    }

    fn lock(&self) -> ChainResult<MutexGuard<'_, GateState>> {
        self.state.lock().map_err(|_| ChainError::LockPoisoned("commit gate".to_string()))
    }
}

/// Removes the bodies built on `parent` other than the committed one, and
/// every body built on those. Returns how many were removed.
fn drop_forks(bodies: &mut HashMap<BlockHash, Block>, parent: BlockHash) -> usize {
    let mut dead = HashSet::from([parent]);
    let mut dropped = 0;
    loop {
        let stale: Vec<BlockHash> = bodies
            .iter()
            .filter(|(_, body)| dead.contains(&body.header.prev_blockhash))
            .map(|(hash, _)| *hash)
            .collect();
        if stale.is_empty() {
            return dropped;
        }
        for hash in stale {
            bodies.remove(&hash);
            dead.insert(hash);
            dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::view::MemoryChainView;
    use crate::test_utils::{child_block, genesis_block};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    const MAX_FILE_SIZE: u64 = 64 * 1024;

    struct Fixture {
        _dir: TempDir,
        gate: ChainCommitGate,
        view: Arc<MemoryChainView>,
        genesis: Block,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(BlockStore::open(dir.path(), MAX_FILE_SIZE).unwrap());
        let view = Arc::new(MemoryChainView::new());
        let genesis = genesis_block();
        let gate = ChainCommitGate::open(store, view.clone(), &genesis).unwrap();
        Fixture {
            _dir: dir,
            gate,
            view,
            genesis,
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Event {
        Header1,
        Header2,
        Body1,
        Body2,
    }

    fn permutations(events: &[Event]) -> Vec<Vec<Event>> {
        if events.len() <= 1 {
            return vec![events.to_vec()];
        }
        let mut result = Vec::new();
        for i in 0..events.len() {
            let mut rest = events.to_vec();
            let first = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, first);
                result.push(tail);
            }
        }
        result
    }

    #[test]
    fn test_genesis_is_committed_on_open() {
        let f = fixture();
        let tip = f.gate.tip().unwrap();
        assert_eq!(tip, ChainTip::genesis(&f.genesis));
        assert!(f.gate.is_committed(&f.genesis.block_hash()).unwrap());
        assert_eq!(f.view.best_block_hash().unwrap(), Some(f.genesis.block_hash()));
    }

    #[test]
    fn test_all_interleavings_reach_block2() {
        let all = [Event::Header1, Event::Header2, Event::Body1, Event::Body2];
        let orders: Vec<_> = permutations(&all)
            .into_iter()
            .filter(|order| {
                let h1 = order.iter().position(|e| *e == Event::Header1);
                let h2 = order.iter().position(|e| *e == Event::Header2);
                h1 < h2
            })
            .collect();
        assert_eq!(orders.len(), 12);

        for order in orders {
            let f = fixture();
            let block1 = child_block(&f.genesis, 1);
            let block2 = child_block(&block1, 2);
            let genesis_hash = f.genesis.block_hash();

            for (step, event) in order.iter().enumerate() {
                match event {
                    Event::Header1 => f.gate.put_consensual_header(block1.header).unwrap(),
                    Event::Header2 => f.gate.put_consensual_header(block2.header).unwrap(),
                    Event::Body1 => {
                        f.gate.put_received_block(&block1.block_hash(), block1.clone()).unwrap()
                    }
                    Event::Body2 => {
                        f.gate.put_received_block(&block2.block_hash(), block2.clone()).unwrap()
                    }
                };

                let seen = &order[..=step];
                let expected = if seen.len() == all.len() {
                    block2.block_hash()
                } else if seen.contains(&Event::Header1) && seen.contains(&Event::Body1) {
                    block1.block_hash()
                } else {
                    genesis_hash
                };
                let tip = f.gate.tip().unwrap();
                assert_eq!(tip.hash, expected, "tip after {:?} in {:?}", event, order);
            }

            let tip = f.gate.tip().unwrap();
            assert_eq!(tip.hash, block2.block_hash(), "order {:?}", order);
            assert_eq!(tip.height, 2);
            assert!(f.gate.pending_headers().unwrap().is_empty());
            assert!(f.gate.pending_bodies().unwrap().is_empty());
            assert_eq!(f.view.best_block_hash().unwrap(), Some(block2.block_hash()));
        }
    }

    #[test]
    fn test_header_alone_or_body_alone_never_commits() {
        let f = fixture();
        let block1 = child_block(&f.genesis, 1);
        let block2 = child_block(&block1, 2);

        assert!(f.gate.put_consensual_header(block1.header).unwrap().is_empty());
        assert!(f.gate.put_received_block(&block2.block_hash(), block2.clone()).unwrap().is_empty());
        assert_eq!(f.gate.tip().unwrap().height, 0);
        assert!(f.gate.has_pending_body(&block2.block_hash()).unwrap());
        assert_eq!(f.gate.pending_headers().unwrap(), vec![block1.block_hash()]);

        // Header 2 then body 1 commits both in one call
        assert!(f.gate.put_consensual_header(block2.header).unwrap().is_empty());
        let committed = f.gate.put_received_block(&block1.block_hash(), block1.clone()).unwrap();
        assert_eq!(committed, vec![block1.block_hash(), block2.block_hash()]);
    }

    #[test]
    fn test_redelivery_is_noop() {
        let f = fixture();
        let block1 = child_block(&f.genesis, 1);

        f.gate.put_consensual_header(block1.header).unwrap();
        f.gate.put_consensual_header(block1.header).unwrap();
        assert_eq!(f.gate.pending_headers().unwrap().len(), 1);

        let committed = f.gate.put_received_block(&block1.block_hash(), block1.clone()).unwrap();
        assert_eq!(committed, vec![block1.block_hash()]);

        assert!(f.gate.put_consensual_header(block1.header).unwrap().is_empty());
        assert!(f.gate.put_received_block(&block1.block_hash(), block1.clone()).unwrap().is_empty());
        assert!(f.gate.put_consensual_header(f.genesis.header).unwrap().is_empty());
        assert_eq!(f.gate.tip().unwrap().height, 1);
        assert!(f.gate.pending_bodies().unwrap().is_empty());
    }

    #[test]
    fn test_non_continuous_header_rejected() {
        let f = fixture();
        let block1 = child_block(&f.genesis, 1);
        let block2 = child_block(&block1, 2);

        assert_matches!(
            f.gate.put_consensual_header(block2.header),
            Err(ChainError::NonContinuousBlockHeaders { expected, actual })
                if expected == f.genesis.block_hash() && actual == block1.block_hash()
        );
        assert!(f.gate.pending_headers().unwrap().is_empty());
    }

    #[test]
    fn test_body_hash_mismatch_rejected() {
        let f = fixture();
        let block1 = child_block(&f.genesis, 1);
        let block2 = child_block(&block1, 2);

        assert_matches!(
            f.gate.put_received_block(&block1.block_hash(), block2),
            Err(ChainError::BlockHashMismatch { expected, .. }) if expected == block1.block_hash()
        );
        assert!(f.gate.pending_bodies().unwrap().is_empty());
    }

    #[test]
    fn test_stale_sibling_body_dropped() {
        let f = fixture();
        let block1 = child_block(&f.genesis, 1);
        let sibling = child_block(&f.genesis, 77);

        f.gate.put_received_block(&sibling.block_hash(), sibling.clone()).unwrap();
        f.gate.put_received_block(&block1.block_hash(), block1.clone()).unwrap();
        assert!(f.gate.is_known(&sibling.block_hash()).unwrap());

        f.gate.put_consensual_header(block1.header).unwrap();
        assert_eq!(f.gate.tip().unwrap().hash, block1.block_hash());
        assert!(!f.gate.has_pending_body(&sibling.block_hash()).unwrap());
        assert!(f.gate.get_pending_body(&sibling.block_hash()).unwrap().is_none());
    }

    #[test]
    fn test_late_fork_body_dropped() {
        let f = fixture();
        let block1 = child_block(&f.genesis, 1);
        let block2 = child_block(&block1, 2);
        let fork = child_block(&f.genesis, 77);

        f.gate.put_consensual_header(block1.header).unwrap();
        f.gate.put_received_block(&block1.block_hash(), block1.clone()).unwrap();
        assert!(!f.gate.is_stale_block(&block2.header).unwrap());
        assert!(f.gate.is_stale_block(&fork.header).unwrap());

        assert!(f.gate.put_received_block(&fork.block_hash(), fork.clone()).unwrap().is_empty());
        assert!(!f.gate.has_pending_body(&fork.block_hash()).unwrap());
        assert!(!f.gate.is_known(&fork.block_hash()).unwrap());
        assert!(f.gate.pending_bodies().unwrap().is_empty());

        // A committed block is not stale
        assert!(!f.gate.is_stale_block(&block1.header).unwrap());
        assert_eq!(f.gate.tip().unwrap().hash, block1.block_hash());
    }

    #[test]
    fn test_fork_descendants_dropped_on_commit() {
        let f = fixture();
        let block1 = child_block(&f.genesis, 1);
        let fork1 = child_block(&f.genesis, 77);
        let fork2 = child_block(&fork1, 78);
        let block2 = child_block(&block1, 2);

        for block in [&fork1, &fork2, &block2] {
            f.gate.put_received_block(&block.block_hash(), (*block).clone()).unwrap();
        }
        f.gate.put_consensual_header(block1.header).unwrap();
        f.gate.put_received_block(&block1.block_hash(), block1.clone()).unwrap();

        assert_eq!(f.gate.pending_bodies().unwrap(), vec![block2.block_hash()]);
    }

    struct FlakyView {
        inner: MemoryChainView,
        failing: std::sync::atomic::AtomicBool,
    }

    impl FlakyView {
        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl ChainView for FlakyView {
        fn has_block(&self, hash: &BlockHash) -> ChainResult<bool> {
            self.inner.has_block(hash)
        }

        fn has_transaction(&self, txid: &dashcore::Txid) -> ChainResult<bool> {
            self.inner.has_transaction(txid)
        }

        fn get_transaction(
            &self,
            txid: &dashcore::Txid,
        ) -> ChainResult<Option<dashcore::Transaction>> {
            self.inner.get_transaction(txid)
        }

        fn put_block(&self, hash: &BlockHash, block: &Block) -> ChainResult<()> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StorageError::WriteFailed("view unavailable".to_string()).into());
            }
            self.inner.put_block(hash, block)
        }

        fn put_transaction(
            &self,
            txid: &dashcore::Txid,
            tx: &dashcore::Transaction,
        ) -> ChainResult<()> {
            self.inner.put_transaction(txid, tx)
        }

        fn best_block_hash(&self) -> ChainResult<Option<BlockHash>> {
            self.inner.best_block_hash()
        }
    }

    #[test]
    fn test_failed_view_commit_is_retried() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(BlockStore::open(dir.path(), MAX_FILE_SIZE).unwrap());
        let view = Arc::new(FlakyView {
            inner: MemoryChainView::new(),
            failing: Default::default(),
        });
        let genesis = genesis_block();
        let gate = ChainCommitGate::open(store.clone(), view.clone(), &genesis).unwrap();
        let block1 = child_block(&genesis, 1);
        let hash = block1.block_hash();

        gate.put_consensual_header(block1.header).unwrap();
        view.set_failing(true);
        assert_matches!(
            gate.put_received_block(&hash, block1.clone()),
            Err(ChainError::Storage(StorageError::WriteFailed(_)))
        );

        // Nothing was persisted, so the height is still open
        assert_eq!(gate.tip().unwrap().hash, genesis.block_hash());
        assert!(!gate.is_committed(&hash).unwrap());
        assert!(!store.contains(&hash).unwrap());
        assert!(gate.has_pending_body(&hash).unwrap());

        view.set_failing(false);
        assert_eq!(gate.put_consensual_header(block1.header).unwrap(), vec![hash]);
        assert_eq!(gate.tip().unwrap().height, 1);
        assert_eq!(view.best_block_hash().unwrap(), Some(hash));
        assert!(store.contains(&hash).unwrap());
    }

    #[test]
    fn test_concurrent_headers_and_bodies() {
        let f = fixture();
        let mut chain = vec![f.genesis.clone()];
        for nonce in 1..=20 {
            let next = child_block(chain.last().unwrap(), nonce);
            chain.push(next);
        }
        let blocks = &chain[1..];

        std::thread::scope(|s| {
            s.spawn(|| {
                for block in blocks {
                    f.gate.put_consensual_header(block.header).unwrap();
                }
            });
            for worker in 0..4 {
                let gate = &f.gate;
                s.spawn(move || {
                    for block in blocks.iter().rev().skip(worker).step_by(4) {
                        gate.put_received_block(&block.block_hash(), block.clone()).unwrap();
                    }
                });
            }
        });

        let tip = f.gate.tip().unwrap();
        assert_eq!(tip.height, 20);
        assert_eq!(tip.hash, blocks[19].block_hash());
        assert_eq!(f.view.best_height().unwrap(), Some(20));
    }
}
