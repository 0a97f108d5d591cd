//! Storage-related types and structures.

use std::fmt;

/// Position of a record inside a single record file.
///
/// `offset` points at the first payload byte (just past the length prefix) and
/// `size` is the payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordLocator {
    pub offset: u64,
    pub size: u32,
}

/// Globally stable address of a persisted record.
///
/// Once issued a locator never changes and never aliases another record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileRecordLocator {
    pub file_index: u32,
    pub locator: RecordLocator,
}

impl FileRecordLocator {
    pub fn new(file_index: u32, offset: u64, size: u32) -> Self {
        Self {
            file_index,
            locator: RecordLocator {
                offset,
                size,
            },
        }
    }
}

impl fmt::Display for FileRecordLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.file_index, self.locator.offset, self.locator.size)
    }
}

/// Storage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of record files in the store.
    pub file_count: u32,

    /// Append position of the last file.
    pub last_file_size: u64,

    /// Number of committed blocks.
    pub block_count: u64,
}
