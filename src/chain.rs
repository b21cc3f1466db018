//! Hash chaining for the append-only audit tables.
//!
//! Each row commits to its predecessor: `entry_hash = sha256(prev_hash || payload)`.
//! Editing or deleting a row in the middle breaks every later link.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};

pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Hashes a log entry payload with the previous chain hash.
pub fn hash_entry(prev_hash: &[u8; 32], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload);
    hasher.finalize().into()
}

/// One stored link, as read back from a table in insertion order.
#[derive(Clone, Debug)]
pub struct ChainLink {
    pub id: i64,
    pub payload: String,
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
}

/// Walks links in insertion order and checks each one against its predecessor.
pub fn verify_links(table: &str, links: &[ChainLink]) -> Result<()> {
    let mut expected_prev = GENESIS_HASH;
    for link in links {
        if link.prev_hash != expected_prev {
            return Err(anyhow!(
                "{} chain broken at id {}: prev_hash mismatch",
                table,
                link.id
            ));
        }
        let recomputed = hash_entry(&link.prev_hash, link.payload.as_bytes());
        if recomputed != link.entry_hash {
            return Err(anyhow!(
                "{} chain broken at id {}: entry_hash mismatch",
                table,
                link.id
            ));
        }
        expected_prev = link.entry_hash;
    }
    Ok(())
}

pub(crate) fn hash_from_blob(table: &str, bytes: Vec<u8>) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!("corrupt {}: hash size {}", table, bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
