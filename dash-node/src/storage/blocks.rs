//! Committed block storage on top of a [`RecordStore`].
//!
//! Blocks are appended in height order as consensus-encoded records. The
//! hash/height index lives in memory and is rebuilt by scanning the records on
//! startup, so the record files are the only source of truth.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use dashcore::consensus::encode::{deserialize, serialize};
use dashcore::{Block, BlockHash};
use tracing::{debug, info};

use super::record_store::RecordStore;
use super::types::{FileRecordLocator, StorageStats};
use crate::error::{StorageError, StorageResult};

/// File name prefix of block record files (`blk00000.dat`, ...).
pub const BLOCK_FILE_PREFIX: &str = "blk";

/// Index entry for a committed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlock {
    pub height: u32,
    pub locator: FileRecordLocator,
}

#[derive(Default)]
struct BlockIndex {
    by_hash: HashMap<BlockHash, StoredBlock>,
    by_height: Vec<BlockHash>,
}

/// Append-only store of canonical blocks.
pub struct BlockStore {
    records: RecordStore,
    index: RwLock<BlockIndex>,
}

impl BlockStore {
    /// Open the store and rebuild the index from the record files.
    ///
    /// Every stored block must extend the one stored before it; anything else
    /// means the files were tampered with and is reported as corruption.
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> StorageResult<Self> {
        let records = RecordStore::open(dir, BLOCK_FILE_PREFIX, max_file_size)?;
        let mut index = BlockIndex::default();

        for record in records.records()? {
            let (locator, payload) = record?;
            let block: Block = deserialize(&payload)?;
            let hash = block.block_hash();

            if let Some(prev) = index.by_height.last() {
                if block.header.prev_blockhash != *prev {
                    return Err(StorageError::Corruption(format!(
                        "block {} at {} does not extend {}",
                        hash, locator, prev
                    )));
                }
            }

            let height = index.by_height.len() as u32;
            index.by_hash.insert(
                hash,
                StoredBlock {
                    height,
                    locator,
                },
            );
            index.by_height.push(hash);
        }

        if let Some(tip) = index.by_height.last() {
            info!(
                "Recovered {} blocks from {}, tip {} at height {}",
                index.by_height.len(),
                records.dir().display(),
                tip,
                index.by_height.len() - 1
            );
        }

        Ok(Self {
            records,
            index: RwLock::new(index),
        })
    }

    /// Persist the block at `height`, which must be exactly one above the current tip.
    pub fn put_block(&self, height: u32, block: &Block) -> StorageResult<FileRecordLocator> {
        let mut index = self
            .index
            .write()
            .map_err(|_| StorageError::LockPoisoned("block index".to_string()))?;

        let hash = block.block_hash();
        if let Some(existing) = index.by_hash.get(&hash) {
            return Ok(existing.locator);
        }

        let expected_height = index.by_height.len() as u32;
        if height != expected_height {
            return Err(StorageError::InconsistentState(format!(
                "block {} stored at height {} but next height is {}",
                hash, height, expected_height
            )));
        }
        if let Some(prev) = index.by_height.last() {
            if block.header.prev_blockhash != *prev {
                return Err(StorageError::InconsistentState(format!(
                    "block {} does not extend stored tip {}",
                    hash, prev
                )));
            }
        }

        let locator = self.records.append_record(&serialize(block))?;
        index.by_hash.insert(
            hash,
            StoredBlock {
                height,
                locator,
            },
        );
        index.by_height.push(hash);

        debug!("Stored block {} at height {} ({})", hash, height, locator);
        Ok(locator)
    }

    pub fn get_block(&self, hash: &BlockHash) -> StorageResult<Option<Block>> {
        let stored = match self.get_stored(hash)? {
            Some(stored) => stored,
            None => return Ok(None),
        };
        let payload = self.records.read_record(&stored.locator)?;
        Ok(Some(deserialize(&payload)?))
    }

    pub fn get_block_at(&self, height: u32) -> StorageResult<Option<Block>> {
        let hash = self.read_index()?.by_height.get(height as usize).copied();
        match hash {
            Some(hash) => self.get_block(&hash),
            None => Ok(None),
        }
    }

    pub fn get_stored(&self, hash: &BlockHash) -> StorageResult<Option<StoredBlock>> {
        Ok(self.read_index()?.by_hash.get(hash).copied())
    }

    pub fn contains(&self, hash: &BlockHash) -> StorageResult<bool> {
        Ok(self.read_index()?.by_hash.contains_key(hash))
    }

    pub fn height_of(&self, hash: &BlockHash) -> StorageResult<Option<u32>> {
        Ok(self.get_stored(hash)?.map(|stored| stored.height))
    }

    /// Hash and height of the last stored block.
    pub fn tip(&self) -> StorageResult<Option<(BlockHash, u32)>> {
        let index = self.read_index()?;
        Ok(index.by_height.last().map(|hash| (*hash, index.by_height.len() as u32 - 1)))
    }

    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.read_index()?.by_height.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Decode every stored block in height order.
    pub fn blocks(&self) -> StorageResult<impl Iterator<Item = StorageResult<Block>>> {
        Ok(self.records.records()?.map(|record| {
            let (_, payload) = record?;
            Ok(deserialize::<Block>(&payload)?)
        }))
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.records.flush()
    }

    pub fn stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats {
            file_count: self.records.file_count()?,
            last_file_size: self.records.last_file_size()?,
            block_count: self.len()? as u64,
        })
    }

    fn read_index(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, BlockIndex>> {
        self.index.read().map_err(|_| StorageError::LockPoisoned("block index".to_string()))
    }
}
