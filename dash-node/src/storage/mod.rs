//! Durable storage for the Dash node.
//!
//! Everything is built on [`RecordStore`], an append-only log of length-prefixed
//! records spread over bounded files and addressed by [`FileRecordLocator`].
//! [`BlockStore`] keeps the canonical chain in one record store, and
//! [`PendingJournal`] keeps received-but-uncommitted items in another.

pub mod blocks;
pub mod journal;
pub mod lockfile;
pub mod record_file;
pub mod record_store;
pub mod types;

pub use blocks::{BlockStore, StoredBlock, BLOCK_FILE_PREFIX};
pub use journal::{JournalEntry, PendingJournal, JOURNAL_FILE_PREFIX};
pub use lockfile::DataDirLock;
pub use record_file::{RecordFile, LENGTH_PREFIX_SIZE};
pub use record_store::{RecordStore, Records};
pub use types::{FileRecordLocator, RecordLocator, StorageStats};

/// Directory holding committed block files.
pub const BLOCKS_DIR_NAME: &str = "blocks";

/// Directory holding the pending journal files.
pub const PENDING_DIR_NAME: &str = "pending";
