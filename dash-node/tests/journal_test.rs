//! Integration tests for the pending-state journal.

mod common;

use assert_matches::assert_matches;
use dash_node::storage::{JournalEntry, PendingJournal};
use dash_node::StorageError;
use tempfile::TempDir;

use common::{child_block, coinbase, genesis_block, spend};

fn sample_entries() -> Vec<JournalEntry> {
    let genesis = genesis_block();
    let b1 = child_block(&genesis, 1);
    let b2 = child_block(&b1, 2);
    vec![
        JournalEntry::ConsensualHeader(b1.header),
        JournalEntry::ReceivedBlock(b2),
        JournalEntry::OrphanTransaction(spend(coinbase(5).txid(), 0, 1000)),
    ]
}

#[test]
fn test_entries_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let entries = sample_entries();
    {
        let journal = PendingJournal::open(temp_dir.path(), 4096).unwrap();
        for entry in &entries {
            assert!(journal.append(entry).unwrap().is_some());
        }
        journal.flush().unwrap();
    }

    let journal = PendingJournal::open(temp_dir.path(), 4096).unwrap();
    let read: Vec<_> = journal.entries().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(read, entries);
}

#[test]
fn test_replay_suppresses_appends() {
    let temp_dir = TempDir::new().unwrap();
    let journal = PendingJournal::open(temp_dir.path(), 4096).unwrap();
    for entry in sample_entries() {
        journal.append(&entry).unwrap();
    }

    let mut seen = Vec::new();
    let count = journal
        .replay(|entry| {
            // Re-journaling during replay is a no-op
            assert_eq!(journal.append(&entry)?, None);
            seen.push(entry);
            Ok::<(), StorageError>(())
        })
        .unwrap();

    assert_eq!(count, 3);
    assert_eq!(seen, sample_entries());
    assert_eq!(journal.entries().unwrap().count(), 3);

    // Appending works again once replay is over
    assert!(journal.append(&sample_entries()[0]).unwrap().is_some());
}

#[test]
fn test_replay_stops_at_first_error() {
    let temp_dir = TempDir::new().unwrap();
    let journal = PendingJournal::open(temp_dir.path(), 4096).unwrap();
    for entry in sample_entries() {
        journal.append(&entry).unwrap();
    }

    let mut applied = 0;
    let result = journal.replay(|entry| {
        if matches!(entry, JournalEntry::ReceivedBlock(_)) {
            return Err(StorageError::Corruption("rejected".to_string()));
        }
        applied += 1;
        Ok(())
    });

    assert_matches!(result, Err(StorageError::Corruption(_)));
    assert_eq!(applied, 1);
    assert!(journal.append(&sample_entries()[0]).unwrap().is_some());
}

#[test]
fn test_journal_rotates_files() {
    let temp_dir = TempDir::new().unwrap();
    let journal = PendingJournal::open(temp_dir.path(), 256).unwrap();
    let genesis = genesis_block();

    let mut parent = genesis;
    for nonce in 1..=10 {
        let block = child_block(&parent, nonce);
        journal.append(&JournalEntry::ReceivedBlock(block.clone())).unwrap();
        parent = block;
    }

    assert!(journal.file_count().unwrap() > 1);
    assert_eq!(journal.entries().unwrap().count(), 10);
}

#[test]
fn test_compact_keeps_selected_entries() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("pending");
    let journal = PendingJournal::open(&dir, 256).unwrap();
    let genesis = genesis_block();

    let mut parent = genesis;
    let mut blocks = Vec::new();
    for nonce in 1..=10 {
        let block = child_block(&parent, nonce);
        journal.append(&JournalEntry::ReceivedBlock(block.clone())).unwrap();
        blocks.push(block.clone());
        parent = block;
    }
    assert!(journal.file_count().unwrap() > 1);

    let last = blocks[9].block_hash();
    let dropped = journal
        .compact(|entry| matches!(entry, JournalEntry::ReceivedBlock(b) if b.block_hash() == last))
        .unwrap();
    assert_eq!(dropped, 9);
    assert_eq!(journal.file_count().unwrap(), 1);
    assert!(!temp_dir.path().join("pending.compact").exists());
    assert!(!temp_dir.path().join("pending.old").exists());

    // The compacted journal keeps taking appends and survives a reopen
    let tx = spend(coinbase(5).txid(), 0, 1000);
    journal.append(&JournalEntry::OrphanTransaction(tx.clone())).unwrap();
    journal.flush().unwrap();
    drop(journal);

    let journal = PendingJournal::open(&dir, 256).unwrap();
    let read: Vec<_> = journal.entries().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(read, vec![
        JournalEntry::ReceivedBlock(blocks[9].clone()),
        JournalEntry::OrphanTransaction(tx),
    ]);

    // Nothing to drop leaves the files alone
    assert_eq!(journal.compact(|_| true).unwrap(), 0);
    assert_eq!(journal.entries().unwrap().count(), 2);
}

#[test]
fn test_unfinished_compaction_discarded() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("pending");
    let staging = temp_dir.path().join("pending.compact");
    {
        let journal = PendingJournal::open(&dir, 4096).unwrap();
        for entry in sample_entries() {
            journal.append(&entry).unwrap();
        }
        journal.flush().unwrap();
    }
    // A half-written staging copy next to the live journal
    {
        let partial = PendingJournal::open(&staging, 4096).unwrap();
        partial.append(&sample_entries()[0]).unwrap();
        partial.flush().unwrap();
    }

    let journal = PendingJournal::open(&dir, 4096).unwrap();
    assert!(!staging.exists());
    let read: Vec<_> = journal.entries().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(read, sample_entries());
}

#[test]
fn test_interrupted_swap_completed() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("pending");
    let staging = temp_dir.path().join("pending.compact");
    let retired = temp_dir.path().join("pending.old");
    {
        let old = PendingJournal::open(&retired, 4096).unwrap();
        for entry in sample_entries() {
            old.append(&entry).unwrap();
        }
        old.flush().unwrap();

        let compacted = PendingJournal::open(&staging, 4096).unwrap();
        compacted.append(&sample_entries()[2]).unwrap();
        compacted.flush().unwrap();
    }

    // The live journal was moved aside but the compacted copy never moved in
    let journal = PendingJournal::open(&dir, 4096).unwrap();
    assert!(!staging.exists());
    assert!(!retired.exists());
    let read: Vec<_> = journal.entries().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(read, vec![sample_entries()[2].clone()]);
}
