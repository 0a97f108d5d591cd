//! Chain-acceptance engine for a Dash full node.
//!
//! Blocks and transactions arrive out of order from peers, and block headers
//! arrive in consensus order from an external ordering service. This crate
//! decides when each of them becomes part of the canonical chain:
//!
//! - [`chain::OrphanPool`] parks items whose dependency is unknown and promotes
//!   them once it arrives.
//! - [`chain::ChainCommitGate`] commits a block only when its consensual header
//!   and its body are both present and its parent is the tip.
//! - [`storage::RecordStore`] persists committed blocks and pending state as
//!   append-only records addressed by stable locators.
//!
//! # Quick Start
//!
//! ```no_run
//! use dash_node::{Config, Node};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::open(Config::regtest().with_data_dir("./regtest-data"))?;
//! println!("tip: {}", node.tip()?);
//!
//! let _blocks = node.blocks();
//! // Feed consensual headers and received blocks:
//! // blocks.put_consensual_header(header)?;
//! // blocks.accept_block(&hash, block)?;
//! # Ok(())
//! # }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod chain;
pub mod config;
pub mod error;
pub mod import;
pub mod logging;
pub mod node;
pub mod processor;
pub mod storage;
pub mod types;


pub use config::Config;
pub use error::{
    ChainError, ChainResult, LoggingError, LoggingResult, NodeError, Result, StorageError,
    StorageResult,
};
pub use logging::{init_logging, LogFileConfig, LoggingConfig, LoggingGuard};
pub use node::Node;
pub use processor::{
    BlockProcessor, BlockStatus, InventoryProcessor, TransactionProcessor, TransactionStatus,
};
pub use tracing::level_filters::LevelFilter;
pub use types::{ImportSummary, InventoryItem, NodeStats};

pub use dashcore::{Block, BlockHash, Network, Transaction, Txid};

/// Current version of the dash-node library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
