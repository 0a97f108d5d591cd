mod fixtures;
#[cfg(test)]
mod harness;

pub use fixtures::{block_with, child_block, coinbase, genesis_block, spend, spend_all};
#[cfg(test)]
pub use harness::Harness;
