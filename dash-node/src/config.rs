//! Configuration management for the Dash node.

use std::path::PathBuf;
use std::time::Duration;

use dashcore::Network;

use crate::chain::orphan_pool::{MAX_ORPHANS, ORPHAN_TIMEOUT};

/// Default upper bound on the size of a single record file.
pub const DEFAULT_MAX_RECORD_FILE_SIZE: u64 = 128 * 1024 * 1024;

/// Configuration for the Dash node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network whose genesis block starts the chain.
    pub network: Network,

    /// Directory holding block files, the pending journal and the lock file.
    /// Defaults to ./dash-node-data
    pub data_dir: PathBuf,

    /// Maximum size of one record file, length prefixes included. Also bounds
    /// the largest block that can be stored.
    pub max_record_file_size: u64,

    /// Maximum number of orphan blocks kept in memory.
    pub max_orphan_blocks: usize,

    /// Maximum number of orphan transactions kept in memory.
    pub max_orphan_transactions: usize,

    /// How long an orphan may wait for its dependency.
    pub orphan_timeout: Duration,

    /// Journal pending headers, bodies and orphan transactions so they survive
    /// a restart.
    pub journal_pending: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Dash,
            data_dir: PathBuf::from("./dash-node-data"),
            max_record_file_size: DEFAULT_MAX_RECORD_FILE_SIZE,
            max_orphan_blocks: MAX_ORPHANS,
            max_orphan_transactions: MAX_ORPHANS * 10,
            orphan_timeout: ORPHAN_TIMEOUT,
            journal_pending: true,
        }
    }
}

impl Config {
    /// Create a new configuration for the given network.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Create a configuration for mainnet.
    pub fn mainnet() -> Self {
        Self::new(Network::Dash)
    }

    /// Create a configuration for testnet.
    pub fn testnet() -> Self {
        Self::new(Network::Testnet)
    }

    /// Create a configuration for regtest.
    pub fn regtest() -> Self {
        Self::new(Network::Regtest)
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the maximum record file size.
    pub fn with_max_record_file_size(mut self, size: u64) -> Self {
        self.max_record_file_size = size;
        self
    }

    /// Set the orphan block limit.
    pub fn with_max_orphan_blocks(mut self, max: usize) -> Self {
        self.max_orphan_blocks = max;
        self
    }

    /// Set the orphan transaction limit.
    pub fn with_max_orphan_transactions(mut self, max: usize) -> Self {
        self.max_orphan_transactions = max;
        self
    }

    /// Set how long orphans are kept.
    pub fn with_orphan_timeout(mut self, timeout: Duration) -> Self {
        self.orphan_timeout = timeout;
        self
    }

    /// Enable or disable the pending journal.
    pub fn with_journal_pending(mut self, enabled: bool) -> Self {
        self.journal_pending = enabled;
        self
    }

    /// Directory of the committed block files.
    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join(crate::storage::BLOCKS_DIR_NAME)
    }

    /// Directory of the pending journal files.
    pub fn pending_dir(&self) -> PathBuf {
        self.data_dir.join(crate::storage::PENDING_DIR_NAME)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_record_file_size <= crate::storage::LENGTH_PREFIX_SIZE {
            return Err(format!(
                "max_record_file_size must exceed the {}-byte record prefix",
                crate::storage::LENGTH_PREFIX_SIZE
            ));
        }
        if self.max_record_file_size > u32::MAX as u64 {
            return Err("max_record_file_size must fit in 32 bits".to_string());
        }

        if self.max_orphan_blocks == 0 {
            return Err("max_orphan_blocks must be > 0".to_string());
        }
        if self.max_orphan_transactions == 0 {
            return Err("max_orphan_transactions must be > 0".to_string());
        }
        if self.orphan_timeout.is_zero() {
            return Err("orphan_timeout must be > 0".to_string());
        }

        if self.data_dir.as_os_str().is_empty() {
            return Err("data_dir must not be empty".to_string());
        }

        Ok(())
    }
}
