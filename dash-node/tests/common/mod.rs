//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use dashcore::block::{Header as BlockHeader, Version};
use dashcore::hashes::Hash;
use dashcore::{
    Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Transaction, TxIn, TxMerkleNode, TxOut,
    Txid,
};

pub fn coinbase(tag: u32) -> Transaction {
    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from(tag.to_le_bytes().to_vec()),
            sequence: 0xFFFFFFFF,
            ..Default::default()
        }],
        output: vec![TxOut {
            value: 50_0000_0000,
            script_pubkey: ScriptBuf::new(),
        }],
        special_transaction_payload: None,
    }
}

pub fn spend(txid: Txid, vout: u32, value: u64) -> Transaction {
    Transaction {
        version: 1,
        lock_time: 0,
        input: vec![TxIn {
            previous_output: OutPoint::new(txid, vout),
            script_sig: ScriptBuf::new(),
            sequence: 0xFFFFFFFF,
            ..Default::default()
        }],
        output: vec![TxOut {
            value,
            script_pubkey: ScriptBuf::new(),
        }],
        special_transaction_payload: None,
    }
}

pub fn block_with(prev: BlockHash, nonce: u32, txdata: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: Version::from_consensus(1),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000 + nonce,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce,
        },
        txdata,
    }
}

pub fn genesis_block() -> Block {
    block_with(BlockHash::all_zeros(), 0, vec![coinbase(0)])
}

pub fn child_block(parent: &Block, nonce: u32) -> Block {
    block_with(parent.block_hash(), nonce, vec![coinbase(nonce)])
}

/// `genesis` followed by `len` blocks, each extending the previous one.
pub fn chain_from(genesis: &Block, len: u32) -> Vec<Block> {
    let mut chain = vec![genesis.clone()];
    for nonce in 1..=len {
        let next = child_block(chain.last().unwrap(), nonce);
        chain.push(next);
    }
    chain
}
