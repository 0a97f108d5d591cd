//! Bulk import of blocks from a flat file.
//!
//! The file is a plain concatenation of consensus-encoded blocks in chain
//! order, the layout of a `bootstrap.dat` without network magic. Each block is
//! fed to the node as its own consensual header followed by its body.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashcore::consensus::{encode, Decodable};
use dashcore::{Block, BlockHash};
use tracing::{debug, info};

use crate::error::{NodeError, Result};
use crate::node::Node;
use crate::processor::BlockStatus;
use crate::types::ImportSummary;

/// Import `path` on a blocking task so the runtime stays responsive.
pub async fn import_blocks(node: Arc<Node>, path: PathBuf) -> Result<ImportSummary> {
    tokio::task::spawn_blocking(move || import_file(&node, &path))
        .await
        .map_err(|e| NodeError::Import(format!("import task failed: {}", e)))?
}

/// Import `path` on the current thread.
pub fn import_file(node: &Node, path: &Path) -> Result<ImportSummary> {
    let file = File::open(path)
        .map_err(|e| NodeError::Import(format!("failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let blocks = node.blocks();
    let mut summary = ImportSummary::default();
    let mut imported: Vec<BlockHash> = Vec::new();

    loop {
        let block = match Block::consensus_decode(&mut reader) {
            Ok(block) => block,
            Err(encode::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(e) => {
                return Err(NodeError::Import(format!(
                    "failed to decode block {} of {}: {}",
                    summary.blocks_read,
                    path.display(),
                    e
                )))
            }
        };
        summary.blocks_read += 1;

        let hash = block.block_hash();
        if blocks.exists(&hash)? {
            summary.duplicates += 1;
            continue;
        }

        imported.push(hash);
        let committed = blocks.put_consensual_header(block.header)?;
        summary.blocks_committed += committed.len() as u64;
        if let BlockStatus::Committed(committed) = blocks.accept_block(&hash, block)? {
            summary.blocks_committed += committed.len() as u64;
        }

        if summary.blocks_read % 1000 == 0 {
            debug!("Imported {} blocks so far", summary.blocks_read);
        }
    }

    // Commits may include blocks that were pending before the import, so the
    // remainder is counted per block rather than derived from the totals.
    for hash in &imported {
        if !blocks.exists(hash)? {
            summary.left_pending += 1;
        }
    }
    node.flush()?;
    info!(
        "Imported {} blocks from {} ({} committed, {} already known, {} pending)",
        summary.blocks_read,
        path.display(),
        summary.blocks_committed,
        summary.duplicates,
        summary.left_pending
    );
    Ok(summary)
}
