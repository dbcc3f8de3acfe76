//! Chunked ledger synchronization
//!
//! A node answers `blockchain_sync_request{from_height}` with every block at
//! index `>= from_height`, split into chunks of [`SYNC_CHUNK_SIZE`]. The
//! requester collects chunks per peer and applies the blocks once the set is
//! complete; chunks may arrive in any order.

use crate::blockchain::{Block, Ledger, SyncOutcome};
use crate::network::protocol::{SyncChunk, SYNC_CHUNK_SIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// An unfinished session is dropped after this long without a new chunk.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Split `blocks` into sync chunks. An empty range still yields one empty
/// chunk so the requester learns it is up to date.
pub fn chunk_blocks(blocks: Vec<Block>) -> Vec<SyncChunk> {
    let total_blocks = blocks.len() as u64;
    if blocks.is_empty() {
        return vec![SyncChunk {
            blocks,
            chunk_index: 0,
            total_chunks: 1,
            total_blocks: 0,
        }];
    }
    let chunks: Vec<Vec<Block>> = blocks.chunks(SYNC_CHUNK_SIZE).map(|c| c.to_vec()).collect();
    let total_chunks = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, blocks)| SyncChunk {
            blocks,
            chunk_index: i as u32,
            total_chunks,
            total_blocks,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub peer_id: String,
    pub chunks: u32,
    pub total_blocks: u64,
    pub outcome: SyncOutcome,
    pub height_after: u64,
    pub completed_at: i64,
}

struct Session {
    total_chunks: u32,
    total_blocks: u64,
    chunks: BTreeMap<u32, Vec<Block>>,
    updated: Instant,
}

/// Per-peer reassembly of sync chunks.
#[derive(Default)]
pub struct SyncAssembler {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SyncAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk from `peer_id`. Returns the full block set once every
    /// chunk of the session has arrived.
    pub fn accept_chunk(&self, peer_id: &str, chunk: SyncChunk) -> Option<Vec<Block>> {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        sessions.retain(|_, s| now.duration_since(s.updated) < SESSION_TIMEOUT);

        let restart = match sessions.get(peer_id) {
            Some(s) => s.total_chunks != chunk.total_chunks || s.total_blocks != chunk.total_blocks,
            None => true,
        };
        if restart {
            sessions.insert(
                peer_id.to_string(),
                Session {
                    total_chunks: chunk.total_chunks,
                    total_blocks: chunk.total_blocks,
                    chunks: BTreeMap::new(),
                    updated: now,
                },
            );
        }
        let session = sessions.get_mut(peer_id)?;
        session.updated = now;
        if session.chunks.insert(chunk.chunk_index, chunk.blocks).is_some() {
            debug!("Duplicate sync chunk {} from {}", chunk.chunk_index, peer_id);
        }
        if session.chunks.len() < session.total_chunks as usize {
            return None;
        }

        let session = sessions.remove(peer_id)?;
        let blocks: Vec<Block> = session.chunks.into_values().flatten().collect();
        if blocks.len() as u64 != session.total_blocks {
            warn!(
                "Sync from {} announced {} blocks but delivered {}",
                peer_id,
                session.total_blocks,
                blocks.len()
            );
            return None;
        }
        Some(blocks)
    }

    pub fn in_progress(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn abandon(&self, peer_id: &str) {
        self.sessions.lock().remove(peer_id);
    }
}

/// Apply a completed block set from `peer_id` to `ledger`.
pub fn apply_session(ledger: &Ledger, peer_id: &str, blocks: Vec<Block>, chunks: u32) -> SyncReport {
    let total_blocks = blocks.len() as u64;
    let outcome = ledger.apply_synced_blocks(blocks);
    let report = SyncReport {
        peer_id: peer_id.to_string(),
        chunks,
        total_blocks,
        outcome,
        height_after: ledger.height(),
        completed_at: chrono::Utc::now().timestamp(),
    };
    info!(
        "Sync with {}: {} appended, {} known, {} rejected (height {})",
        peer_id, outcome.appended, outcome.known, outcome.rejected, report.height_after
    );
    report
}
