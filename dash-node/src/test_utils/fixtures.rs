//! Small hand-built blocks and transactions for tests.
//!
//! Nothing here is valid under consensus rules; the acceptance engine only
//! looks at hashes and parent links.

use dashcore::block::{Header as BlockHeader, Version};
use dashcore::hashes::Hash;
use dashcore::{
    Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Transaction, TxIn, TxMerkleNode, TxOut,
    Txid,
};

/// A coinbase transaction made unique by `tag`.
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

/// A block on top of `prev` holding `txdata`.
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

/// A block with no parent and a single coinbase.
pub fn genesis_block() -> Block {
    block_with(BlockHash::all_zeros(), 0, vec![coinbase(0)])
}

/// A block extending `parent` with a coinbase tagged by `nonce`.
pub fn child_block(parent: &Block, nonce: u32) -> Block {
    block_with(parent.block_hash(), nonce, vec![coinbase(nonce)])
}

/// A transaction spending output `vout` of `txid`; `tag` sets the output value.
pub fn spend(txid: Txid, vout: u32, tag: u64) -> Transaction {
    spend_all(&[(txid, vout)], tag)
}

/// A transaction spending every listed output.
pub fn spend_all(inputs: &[(Txid, u32)], tag: u64) -> Transaction {
    Transaction {
        version: 1,
        lock_time: 0,
        input: inputs
            .iter()
            .map(|(txid, vout)| TxIn {
                previous_output: OutPoint::new(*txid, *vout),
                script_sig: ScriptBuf::new(),
                sequence: 0xFFFFFFFF,
                ..Default::default()
            })
            .collect(),
        output: vec![TxOut {
            value: tag,
            script_pubkey: ScriptBuf::new(),
        }],
        special_transaction_payload: None,
    }
}
