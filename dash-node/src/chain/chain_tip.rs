//! The block the node's committed chain currently ends at.

use std::fmt;

use dashcore::{Block, BlockHash};

/// Hash and height of the last committed block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainTip {
    /// The block hash of this tip
    pub hash: BlockHash,
    /// The height of this tip
    pub height: u32,
}

impl ChainTip {
    pub fn new(hash: BlockHash, height: u32) -> Self {
        Self {
            hash,
            height,
        }
    }

    /// Tip for a chain consisting of `genesis` only.
    pub fn genesis(genesis: &Block) -> Self {
        Self::new(genesis.block_hash(), 0)
    }

    /// Whether a block with parent `prev_blockhash` would extend this tip.
    pub fn is_extended_by(&self, prev_blockhash: &BlockHash) -> bool {
        self.hash == *prev_blockhash
    }

    /// The tip after `hash` is committed on top of this one.
    pub fn next(&self, hash: BlockHash) -> Self {
        Self::new(hash, self.height + 1)
    }
}

impl fmt::Display for ChainTip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at height {}", self.hash, self.height)
    }
}
