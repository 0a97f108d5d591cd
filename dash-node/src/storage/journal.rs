//! Write-ahead journal of received items that are not yet part of the chain.
//!
//! Consensual headers, block bodies and orphaned transactions are appended here
//! before they are buffered in memory, so a restart can rebuild the orphan pools
//! and the commit gate by replaying the journal through the processors. Replay
//! relies on the processors treating already-committed items as no-ops.
//!
//! Entries are never removed in place. [`PendingJournal::compact`] rewrites the
//! survivors into `<dir>.compact` and swaps it in for `<dir>`; an interrupted
//! swap is finished or rolled back the next time the journal is opened.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashcore::block::Header as BlockHeader;
use dashcore::consensus::encode::{deserialize, serialize};
use dashcore::{Block, Transaction};
use tracing::{debug, info, warn};

use super::record_store::RecordStore;
use super::types::FileRecordLocator;
use crate::error::{StorageError, StorageResult};

/// File name prefix of journal record files (`pnd00000.dat`, ...).
pub const JOURNAL_FILE_PREFIX: &str = "pnd";

const STAGING_SUFFIX: &str = "compact";
const RETIRED_SUFFIX: &str = "old";

const TAG_CONSENSUAL_HEADER: u8 = 0;
const TAG_RECEIVED_BLOCK: u8 = 1;
const TAG_ORPHAN_TRANSACTION: u8 = 2;

/// One journaled item.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    ConsensualHeader(BlockHeader),
    ReceivedBlock(Block),
    OrphanTransaction(Transaction),
}

impl JournalEntry {
    fn encode(&self) -> Vec<u8> {
        let (tag, body) = match self {
            JournalEntry::ConsensualHeader(header) => (TAG_CONSENSUAL_HEADER, serialize(header)),
            JournalEntry::ReceivedBlock(block) => (TAG_RECEIVED_BLOCK, serialize(block)),
            JournalEntry::OrphanTransaction(tx) => (TAG_ORPHAN_TRANSACTION, serialize(tx)),
        };
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(tag);
        bytes.extend_from_slice(&body);
        bytes
    }

    fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| StorageError::Corruption("empty journal record".to_string()))?;
        match *tag {
            TAG_CONSENSUAL_HEADER => Ok(JournalEntry::ConsensualHeader(deserialize(body)?)),
            TAG_RECEIVED_BLOCK => Ok(JournalEntry::ReceivedBlock(deserialize(body)?)),
            TAG_ORPHAN_TRANSACTION => Ok(JournalEntry::OrphanTransaction(deserialize(body)?)),
            other => Err(StorageError::Corruption(format!("unknown journal tag {}", other))),
        }
    }
}

/// Append-only journal of pending chain state.
pub struct PendingJournal {
    records: RwLock<RecordStore>,
    replaying: AtomicBool,
}

impl PendingJournal {
    pub fn open(dir: impl Into<PathBuf>, max_file_size: u64) -> StorageResult<Self> {
        let dir = dir.into();
        recover_compaction(&dir)?;
        Ok(Self {
            records: RwLock::new(RecordStore::open(dir, JOURNAL_FILE_PREFIX, max_file_size)?),
            replaying: AtomicBool::new(false),
        })
    }

    /// Append an entry. Returns `None` while a replay is running, since the
    /// replayed entries are already in the journal.
    pub fn append(&self, entry: &JournalEntry) -> StorageResult<Option<FileRecordLocator>> {
        if self.replaying.load(Ordering::Acquire) {
            return Ok(None);
        }
        let locator = self.read()?.append_record(&entry.encode())?;
        Ok(Some(locator))
    }

    /// Decode every entry in append order.
    pub fn entries(&self) -> StorageResult<impl Iterator<Item = StorageResult<JournalEntry>>> {
        Ok(self.read()?.records()?.map(|record| {
            let (_, payload) = record?;
            JournalEntry::decode(&payload)
        }))
    }

    /// Feed every journaled entry to `apply`, suppressing re-journaling for the
    /// duration. Stops at the first error.
    pub fn replay<E, F>(&self, mut apply: F) -> Result<usize, E>
    where
        E: From<StorageError>,
        F: FnMut(JournalEntry) -> Result<(), E>,
    {
        self.replaying.store(true, Ordering::Release);
        let result = self.apply_entries(&mut apply);
        self.replaying.store(false, Ordering::Release);

        if let Ok(count) = &result {
            if *count > 0 {
                info!("Replayed {} pending journal entries", count);
            } else {
                debug!("Pending journal is empty");
            }
        }
        result
    }

    fn apply_entries<E, F>(&self, apply: &mut F) -> Result<usize, E>
    where
        E: From<StorageError>,
        F: FnMut(JournalEntry) -> Result<(), E>,
    {
        let mut count = 0usize;
        for entry in self.entries()? {
            apply(entry?)?;
            count += 1;
        }
        Ok(count)
    }

    /// Rewrite the journal keeping only the entries `keep` accepts, in their
    /// original order. Returns how many entries were dropped.
    ///
    /// Appends wait for the rewrite to finish. An entry appended before its
    /// item is buffered would be judged by `keep` too early, so this is only
    /// safe while no processor is running.
    pub fn compact<F>(&self, mut keep: F) -> StorageResult<usize>
    where
        F: FnMut(&JournalEntry) -> bool,
    {
        let mut records = self.write()?;
        let dir = records.dir().to_path_buf();
        let max_file_size = records.max_file_size();
        let staging = sibling(&dir, STAGING_SUFFIX);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        let (kept, total) = {
            let fresh = RecordStore::open(&staging, JOURNAL_FILE_PREFIX, max_file_size)?;
            let mut kept = 0usize;
            let mut total = 0usize;
            for record in records.records()? {
                let (_, payload) = record?;
                total += 1;
                if keep(&JournalEntry::decode(&payload)?) {
                    fresh.append_record(&payload)?;
                    kept += 1;
                }
            }
            fresh.flush()?;
            (kept, total)
        };

        if kept == total {
            fs::remove_dir_all(&staging)?;
            debug!("Pending journal has nothing to compact ({} entries)", total);
            return Ok(0);
        }

        let retired = sibling(&dir, RETIRED_SUFFIX);
        fs::rename(&dir, &retired)?;
        fs::rename(&staging, &dir)?;
        *records = RecordStore::open(&dir, JOURNAL_FILE_PREFIX, max_file_size)?;
        fs::remove_dir_all(&retired)?;

        info!("Compacted pending journal: kept {} of {} entries", kept, total);
        Ok(total - kept)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.read()?.flush()
    }

    pub fn file_count(&self) -> StorageResult<u32> {
        self.read()?.file_count()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, RecordStore>> {
        self.records
            .read()
            .map_err(|_| StorageError::LockPoisoned("pending journal".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, RecordStore>> {
        self.records
            .write()
            .map_err(|_| StorageError::LockPoisoned("pending journal".to_string()))
    }
}

/// `<dir>.<suffix>` next to `dir`.
fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    dir.with_file_name(name)
}

/// Settle a compaction that stopped part way.
///
/// The staging directory only replaces `dir` once it is complete, so a staging
/// directory next to a live journal is discarded and one without is promoted.
fn recover_compaction(dir: &Path) -> StorageResult<()> {
    let staging = sibling(dir, STAGING_SUFFIX);
    if staging.exists() {
        if dir.exists() {
            warn!("Discarding unfinished journal compaction in {}", staging.display());
            fs::remove_dir_all(&staging)?;
        } else {
            warn!("Completing interrupted journal compaction in {}", dir.display());
            fs::rename(&staging, dir)?;
        }
    }

    let retired = sibling(dir, RETIRED_SUFFIX);
    if retired.exists() {
        fs::remove_dir_all(&retired)?;
    }
    Ok(())
}
