//! Error types for the Dash node chain-acceptance engine.

use std::io;
use std::path::PathBuf;

use dashcore::{BlockHash, OutPoint, Txid};
use thiserror::Error;

/// Main error type for the Dash node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Import error: {0}")]
    Import(String),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A locator referenced a file that does not exist, or a directory listing
    /// broke the `0..n` file sequence.
    #[error("Invalid file number {file_index} ({file_count} files)")]
    InvalidFileNumber {
        file_index: u32,
        file_count: u32,
    },

    /// The record cannot fit even in an empty file, so rotation cannot help.
    #[error("Record of {size} bytes exceeds the maximum file size of {max_file_size} bytes")]
    RecordTooLarge {
        size: u64,
        max_file_size: u64,
    },

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("IO error at {path:?}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Data directory locked: {0}")]
    DirectoryLocked(String),
}

impl From<dashcore::consensus::encode::Error> for StorageError {
    fn from(err: dashcore::consensus::encode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors raised while committing blocks and transactions to the chain.
///
/// The first four variants are the ones a caller may see as an expected race
/// (see [`ChainError::is_retryable`]); everything else is fatal for the operation.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Parent transaction {0} not found")]
    ParentTransactionNotFound(Txid),

    #[error("Transaction output {0} already spent")]
    TransactionOutputAlreadySpent(OutPoint),

    #[error("Non-continuous block headers: expected parent {expected}, got {actual}")]
    NonContinuousBlockHeaders {
        expected: BlockHash,
        actual: BlockHash,
    },

    #[error("Invalid block height {height} (tip height {tip_height})")]
    InvalidBlockHeight {
        height: u32,
        tip_height: u32,
    },

    #[error("Block hash mismatch: expected {expected}, got {actual}")]
    BlockHashMismatch {
        expected: BlockHash,
        actual: BlockHash,
    },

    #[error("Transaction {txid} failed verification: {reason}")]
    Verification {
        txid: Txid,
        reason: String,
    },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ChainError {
    /// Whether this error is an expected ordering race that resolves itself once
    /// another item arrives. Retryable failures leave the item orphaned; all other
    /// errors propagate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChainError::ParentTransactionNotFound(_)
                | ChainError::TransactionOutputAlreadySpent(_)
                | ChainError::NonContinuousBlockHeaders { .. }
                | ChainError::InvalidBlockHeight { .. }
        )
    }

    /// Returns a static string representing the error category
    pub fn category(&self) -> &'static str {
        match self {
            ChainError::ParentTransactionNotFound(_) => "dependency",
            ChainError::TransactionOutputAlreadySpent(_) => "conflict",
            ChainError::NonContinuousBlockHeaders { .. } | ChainError::InvalidBlockHeight { .. } => {
                "ordering"
            }
            ChainError::BlockHashMismatch { .. } | ChainError::Verification { .. } => "validation",
            ChainError::LockPoisoned(_) => "state",
            ChainError::Storage(_) => "storage",
        }
    }
}

/// Type alias for Result with NodeError.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for chain operation results.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;
