use crate::blockchain::core::metrics::{
    average_block_time, compute_health, next_difficulty, HealthMetrics, MAX_DIFFICULTY,
    MIN_DIFFICULTY,
};
use crate::blockchain::core::validation::{
    meets_difficulty, validate_block_shape, validate_chain, validate_link,
};
use crate::error::KioskError;
use crate::persistence::{ChainStore, InMemoryChainStore};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Upper bound on nonces tried per mining attempt.
pub const MAX_MINING_ATTEMPTS: u64 = 1_000_000;
pub const GENESIS_PREVIOUS_HASH: &str = "0";
/// 2024-01-01T00:00:00Z, so every node derives the same genesis block.
pub const GENESIS_TIMESTAMP_MS: u64 = 1_704_067_200_000;
/// How often the nonce search looks at its cancellation flag.
const CANCEL_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub transactions: Vec<Transaction>,
    /// Unix time in milliseconds.
    pub timestamp: u64,
    pub previous_hash: String,
    pub nonce: u64,
    /// Leading zero hex digits required when this block was mined.
    #[serde(default)]
    pub difficulty: u32,
    pub hash: String,
}

/// The hashed fields of a block, serialized once so the nonce search only
/// re-hashes the changing part.
///
/// The preimage is the canonical (sorted-key) JSON object
/// `{"difficulty","index","nonce","previous_hash","timestamp","transactions"}`.
struct HashPreimage {
    head: String,
    tail: String,
}

impl HashPreimage {
    fn new(block: &Block) -> Result<Self, KioskError> {
        let transactions = crate::crypto::canonical_json(&block.transactions)?;
        let previous_hash = serde_json::to_string(&block.previous_hash)?;
        Ok(Self {
            head: format!(
                "{{\"difficulty\":{},\"index\":{},\"nonce\":",
                block.difficulty, block.index
            ),
            tail: format!(
                ",\"previous_hash\":{},\"timestamp\":{},\"transactions\":{}}}",
                previous_hash, block.timestamp, transactions
            ),
        })
    }

    fn hash(&self, nonce: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.head.as_bytes());
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(self.tail.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl Block {
    pub fn new(
        index: u64,
        previous_hash: String,
        difficulty: u32,
        transactions: Vec<Transaction>,
    ) -> Self {
        Block {
            index,
            transactions,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
            previous_hash,
            nonce: 0,
            difficulty,
            hash: String::new(),
        }
    }

    /// The fixed first block every node starts from.
    pub fn genesis() -> Result<Self, KioskError> {
        let mut block = Block {
            index: 0,
            transactions: vec![Transaction::genesis()],
            timestamp: GENESIS_TIMESTAMP_MS,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            nonce: 0,
            difficulty: 0,
            hash: String::new(),
        };
        block.hash = block.calculate_hash()?;
        Ok(block)
    }

    pub fn calculate_hash(&self) -> Result<String, KioskError> {
        Ok(HashPreimage::new(self)?.hash(self.nonce))
    }

    /// Search for a nonce meeting `self.difficulty`. Returns `Ok(None)` when
    /// `max_attempts` nonces were tried or `cancel` was raised.
    pub fn mine(mut self, max_attempts: u64, cancel: &AtomicBool) -> Result<Option<Self>, KioskError> {
        let preimage = HashPreimage::new(&self)?;
        for nonce in 0..max_attempts {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                debug!("Nonce search for block {} cancelled after {} attempts", self.index, nonce);
                return Ok(None);
            }
            let hash = preimage.hash(nonce);
            if meets_difficulty(&hash, self.difficulty) {
                self.nonce = nonce;
                self.hash = hash;
                return Ok(Some(self));
            }
        }
        Ok(None)
    }
}

/// Outcome of feeding a batch of peer blocks into the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub appended: usize,
    pub known: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAcceptance {
    Appended,
    AlreadyKnown,
}

/// Where a transaction was found.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionLocation {
    pub transaction: Transaction,
    /// `None` while still pending.
    pub block_index: Option<u64>,
}

struct LedgerState {
    chain: Vec<Block>,
    pending: Vec<Transaction>,
    difficulty: u32,
    /// Bumped on every change to `chain` or `pending`.
    revision: u64,
}

impl LedgerState {
    /// Record a change and copy what has to reach the store.
    fn checkpoint(&mut self, chain_changed: bool) -> Checkpoint {
        self.revision += 1;
        Checkpoint {
            revision: self.revision,
            chain: chain_changed.then(|| self.chain.clone()),
            pending: self.pending.clone(),
        }
    }
}

/// State copied under the ledger lock, written after it is released.
struct Checkpoint {
    revision: u64,
    chain: Option<Vec<Block>>,
    pending: Vec<Transaction>,
}

/// Revisions already on disk, so an older checkpoint that loses the race
/// to the store never overwrites a newer one.
#[derive(Default)]
struct Written {
    chain: u64,
    pending: u64,
}

/// Append-only proof-of-work ledger.
///
/// The chain, the pending pool and the current difficulty share one mutex;
/// every mutation and every full-chain read happens under it. Disk writes
/// happen outside it.
pub struct Ledger {
    state: Mutex<LedgerState>,
    store: Box<dyn ChainStore>,
    written: Mutex<Written>,
    max_attempts: u64,
}

impl Ledger {
    /// Create a ledger with an in-memory store.
    pub fn in_memory(initial_difficulty: u32) -> Result<Self, KioskError> {
        Self::open(Box::new(InMemoryChainStore::new()), initial_difficulty)
    }

    /// Load the chain from `store`, or start a fresh genesis chain when none
    /// exists. A chain that cannot be read or fails validation is set aside
    /// and replaced.
    pub fn open(store: Box<dyn ChainStore>, initial_difficulty: u32) -> Result<Self, KioskError> {
        let loaded = match store.load_chain() {
            Ok(Some(chain)) => match validate_chain(&chain) {
                Ok(()) => Some(chain),
                Err(e) => {
                    warn!("Stored chain failed validation: {}. Starting a new chain.", e);
                    store.discard_corrupt()?;
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to load chain: {}. Starting a new chain.", e);
                store.discard_corrupt()?;
                None
            }
        };

        let chain = match loaded {
            Some(chain) => {
                info!("Loaded chain with {} blocks", chain.len());
                chain
            }
            None => {
                let chain = vec![Block::genesis()?];
                if let Err(e) = store.save_chain(&chain) {
                    warn!("Failed to persist genesis chain: {}", e);
                }
                chain
            }
        };

        let pending = match store.load_pending() {
            Ok(Some(stored)) => Self::restore_pending(&chain, stored),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to load pending transactions: {}. Starting with an empty pool.", e);
                Vec::new()
            }
        };

        Ok(Ledger {
            state: Mutex::new(LedgerState {
                chain,
                pending,
                difficulty: initial_difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY),
                revision: 0,
            }),
            store,
            written: Mutex::new(Written::default()),
            max_attempts: MAX_MINING_ATTEMPTS,
        })
    }

    /// Keep the stored pending transactions that are still valid and not
    /// already in `chain`.
    fn restore_pending(chain: &[Block], stored: Vec<Transaction>) -> Vec<Transaction> {
        let mut seen: HashSet<String> = chain
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter_map(|tx| tx.hash().ok())
            .collect();
        let stored_count = stored.len();
        let pending: Vec<Transaction> = stored
            .into_iter()
            .filter(|tx| tx.validate().is_ok() && tx.hash().map(|h| seen.insert(h)).unwrap_or(false))
            .collect();
        if pending.len() < stored_count {
            debug!(
                "Dropped {} stored pending transactions already mined or invalid",
                stored_count - pending.len()
            );
        }
        if !pending.is_empty() {
            info!("Restored {} pending transactions", pending.len());
        }
        pending
    }

    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Write `checkpoint` unless a newer one already reached the store.
    /// Must be called without the state lock held.
    fn persist(&self, checkpoint: Checkpoint) {
        let mut written = self.written.lock();
        if let Some(chain) = &checkpoint.chain {
            if checkpoint.revision > written.chain {
                match self.store.save_chain(chain) {
                    Ok(()) => written.chain = checkpoint.revision,
                    Err(e) => warn!("Failed to persist chain ({} blocks): {}", chain.len(), e),
                }
            }
        }
        if checkpoint.revision > written.pending {
            match self.store.save_pending(&checkpoint.pending) {
                Ok(()) => written.pending = checkpoint.revision,
                Err(e) => warn!(
                    "Failed to persist {} pending transactions: {}",
                    checkpoint.pending.len(),
                    e
                ),
            }
        }
    }

    fn drop_pending(pending: &mut Vec<Transaction>, block: &Block) {
        let mined: HashSet<String> = block
            .transactions
            .iter()
            .filter_map(|tx| tx.hash().ok())
            .collect();
        pending.retain(|tx| tx.hash().map(|h| !mined.contains(&h)).unwrap_or(false));
    }

    /// Queue a transaction for the next block and return its hash. Adding a
    /// transaction that is already pending is a no-op.
    pub fn add_transaction(&self, tx: Transaction) -> Result<String, KioskError> {
        tx.validate()?;
        let hash = tx.hash()?;
        let checkpoint = {
            let mut state = self.state.lock();
            let duplicate = state
                .pending
                .iter()
                .any(|p| p.hash().map(|h| h == hash).unwrap_or(false));
            if duplicate {
                return Ok(hash);
            }
            state.pending.push(tx);
            state.checkpoint(false)
        };
        self.persist(checkpoint);
        Ok(hash)
    }

    pub fn mine_pending(&self) -> Result<Option<Block>, KioskError> {
        self.mine_pending_with_cancel(&AtomicBool::new(false))
    }

    /// Mine every pending transaction into one block.
    ///
    /// Returns `Ok(None)` when nothing is pending, when the nonce search hits
    /// its attempt cap or is cancelled, or when the tip moved while searching.
    pub fn mine_pending_with_cancel(&self, cancel: &AtomicBool) -> Result<Option<Block>, KioskError> {
        let candidate = {
            let state = self.state.lock();
            if state.pending.is_empty() {
                return Ok(None);
            }
            let last = state
                .chain
                .last()
                .ok_or_else(|| KioskError::Consistency("Chain is empty".to_string()))?;
            let mut block = Block::new(
                last.index + 1,
                last.hash.clone(),
                state.difficulty,
                state.pending.clone(),
            );
            if block.timestamp < last.timestamp {
                block.timestamp = last.timestamp;
            }
            block
        };

        let index = candidate.index;
        let Some(block) = candidate.mine(self.max_attempts, cancel)? else {
            debug!("No nonce found for block {} within {} attempts", index, self.max_attempts);
            return Ok(None);
        };

        let mut state = self.state.lock();
        let tip_hash = state.chain.last().map(|b| b.hash.clone()).unwrap_or_default();
        if tip_hash != block.previous_hash {
            debug!("Chain tip moved while mining block {}; discarding", index);
            return Ok(None);
        }
        state.chain.push(block.clone());
        Self::drop_pending(&mut state.pending, &block);
        let checkpoint = state.checkpoint(true);
        drop(state);
        self.persist(checkpoint);
        info!(
            "Mined block {} ({} transactions, nonce {}, difficulty {})",
            block.index,
            block.transactions.len(),
            block.nonce,
            block.difficulty
        );
        Ok(Some(block))
    }

    pub fn validate(&self) -> bool {
        self.validate_detailed().is_ok()
    }

    pub fn validate_detailed(&self) -> Result<(), KioskError> {
        let state = self.state.lock();
        validate_chain(&state.chain)
    }

    /// One adaptation step from the recent block-time average.
    pub fn adapt_difficulty(&self) -> u32 {
        let mut state = self.state.lock();
        if let Some(avg) = average_block_time(&state.chain) {
            let next = next_difficulty(state.difficulty, avg);
            if next != state.difficulty {
                debug!(
                    "Difficulty {} -> {} (average block time {:.1}s)",
                    state.difficulty, next, avg
                );
            }
            state.difficulty = next;
        }
        state.difficulty
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let state = self.state.lock();
        compute_health(&state.chain)
    }

    pub fn difficulty(&self) -> u32 {
        self.state.lock().difficulty
    }

    pub fn set_difficulty(&self, difficulty: u32) {
        self.state.lock().difficulty = difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
    }

    /// Number of blocks, genesis included.
    pub fn height(&self) -> u64 {
        self.state.lock().chain.len() as u64
    }

    pub fn tip(&self) -> Option<Block> {
        self.state.lock().chain.last().cloned()
    }

    pub fn snapshot(&self) -> Vec<Block> {
        self.state.lock().chain.clone()
    }

    pub fn blocks_from(&self, height: u64) -> Vec<Block> {
        let state = self.state.lock();
        let start = (height as usize).min(state.chain.len());
        state.chain[start..].to_vec()
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        self.state.lock().chain.get(index as usize).cloned()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.state.lock().pending.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn contains_block(&self, hash: &str) -> bool {
        self.state.lock().chain.iter().any(|b| b.hash == hash)
    }

    /// Look a transaction up by hash in the chain, then the pending pool.
    pub fn find_transaction(&self, hash: &str) -> Option<TransactionLocation> {
        let state = self.state.lock();
        for block in &state.chain {
            for tx in &block.transactions {
                if tx.hash().map(|h| h == hash).unwrap_or(false) {
                    return Some(TransactionLocation {
                        transaction: tx.clone(),
                        block_index: Some(block.index),
                    });
                }
            }
        }
        state
            .pending
            .iter()
            .find(|tx| tx.hash().map(|h| h == hash).unwrap_or(false))
            .map(|tx| TransactionLocation {
                transaction: tx.clone(),
                block_index: None,
            })
    }

    fn try_append(state: &mut LedgerState, block: Block) -> Result<BlockAcceptance, KioskError> {
        validate_block_shape(&block)?;
        let len = state.chain.len() as u64;
        if block.index < len {
            let existing = &state.chain[block.index as usize];
            if existing.hash == block.hash {
                return Ok(BlockAcceptance::AlreadyKnown);
            }
            return Err(KioskError::Consistency(format!(
                "Conflicting block at index {}: have {}, got {}",
                block.index, existing.hash, block.hash
            )));
        }
        if block.index > len {
            return Err(KioskError::Consistency(format!(
                "Block {} does not extend chain of height {}",
                block.index, len
            )));
        }
        let previous = state
            .chain
            .last()
            .ok_or_else(|| KioskError::Consistency("Chain is empty".to_string()))?;
        validate_link(previous, &block)?;
        Self::drop_pending(&mut state.pending, &block);
        state.chain.push(block);
        Ok(BlockAcceptance::Appended)
    }

    /// Accept a single gossiped block. Known blocks are ignored.
    pub fn accept_block(&self, block: Block) -> Result<BlockAcceptance, KioskError> {
        let (acceptance, checkpoint) = {
            let mut state = self.state.lock();
            let acceptance = Self::try_append(&mut state, block)?;
            let checkpoint = (acceptance == BlockAcceptance::Appended).then(|| state.checkpoint(true));
            (acceptance, checkpoint)
        };
        if let Some(checkpoint) = checkpoint {
            self.persist(checkpoint);
        }
        Ok(acceptance)
    }

    /// Apply blocks received from a sync session in index order. Blocks the
    /// ledger already holds are counted as known; blocks that fail hashing or
    /// linkage are discarded.
    pub fn apply_synced_blocks(&self, mut blocks: Vec<Block>) -> SyncOutcome {
        blocks.sort_by_key(|b| b.index);
        let mut outcome = SyncOutcome::default();
        let checkpoint = {
            let mut state = self.state.lock();
            for block in blocks {
                let index = block.index;
                match Self::try_append(&mut state, block) {
                    Ok(BlockAcceptance::Appended) => outcome.appended += 1,
                    Ok(BlockAcceptance::AlreadyKnown) => outcome.known += 1,
                    Err(e) => {
                        debug!("Discarding synced block {}: {}", index, e);
                        outcome.rejected += 1;
                    }
                }
            }
            (outcome.appended > 0).then(|| state.checkpoint(true))
        };
        if let Some(checkpoint) = checkpoint {
            self.persist(checkpoint);
        }
        outcome
    }
}
