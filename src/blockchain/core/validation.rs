use crate::blockchain::core::chain::{Block, GENESIS_PREVIOUS_HASH};
use crate::blockchain::core::metrics::{MAX_DIFFICULTY, MIN_DIFFICULTY};
use crate::error::KioskError;

fn is_hex_hash(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// True when `hash` starts with `difficulty` zero hex digits.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Field-level checks for a block received from the network, before any
/// attempt to link it into the chain.
pub fn validate_block_shape(block: &Block) -> Result<(), KioskError> {
    if !is_hex_hash(&block.hash) {
        return Err(KioskError::Validation(format!(
            "Block {} has malformed hash '{}'",
            block.index, block.hash
        )));
    }
    let previous_ok = if block.index == 0 {
        block.previous_hash == GENESIS_PREVIOUS_HASH
    } else {
        is_hex_hash(&block.previous_hash)
    };
    if !previous_ok {
        return Err(KioskError::Validation(format!(
            "Block {} has malformed previous_hash '{}'",
            block.index, block.previous_hash
        )));
    }
    if block.transactions.is_empty() {
        return Err(KioskError::Validation(format!(
            "Block {} carries no transactions",
            block.index
        )));
    }
    Ok(())
}

/// Stored hash matches the recomputed hash and satisfies its PoW target.
pub fn validate_block_hash(block: &Block) -> Result<(), KioskError> {
    let recomputed = block.calculate_hash()?;
    if recomputed != block.hash {
        return Err(KioskError::Consistency(format!(
            "Block {} hash mismatch. Expected {}, but got {}.",
            block.index, recomputed, block.hash
        )));
    }
    if block.index > 0 {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&block.difficulty) {
            return Err(KioskError::Consistency(format!(
                "Block {} difficulty {} outside [{}, {}]",
                block.index, block.difficulty, MIN_DIFFICULTY, MAX_DIFFICULTY
            )));
        }
        if !meets_difficulty(&block.hash, block.difficulty) {
            return Err(KioskError::Consistency(format!(
                "Block {} does not satisfy proof-of-work at difficulty {}",
                block.index, block.difficulty
            )));
        }
    }
    Ok(())
}

/// `block` is a valid direct successor of `previous`.
pub fn validate_link(previous: &Block, block: &Block) -> Result<(), KioskError> {
    if block.index != previous.index + 1 {
        return Err(KioskError::Consistency(format!(
            "Invalid block index. Expected {}, but got {}.",
            previous.index + 1,
            block.index
        )));
    }
    if block.previous_hash != previous.hash {
        return Err(KioskError::Consistency(format!(
            "Invalid previous block hash. Expected {}, but got {}.",
            previous.hash, block.previous_hash
        )));
    }
    validate_block_hash(block)
}

/// Full-chain check: canonical genesis, then every block hashed and linked.
pub fn validate_chain(chain: &[Block]) -> Result<(), KioskError> {
    let genesis = chain
        .first()
        .ok_or_else(|| KioskError::Consistency("Chain is empty".to_string()))?;
    let expected = Block::genesis()?;
    if genesis.hash != expected.hash {
        return Err(KioskError::Consistency(format!(
            "Unexpected genesis block {}",
            genesis.hash
        )));
    }
    validate_block_hash(genesis)?;

    for pair in chain.windows(2) {
        validate_link(&pair[0], &pair[1])?;
    }
    Ok(())
}
