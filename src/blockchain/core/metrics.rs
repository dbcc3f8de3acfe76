//! Difficulty adaptation and chain health.

use crate::blockchain::core::chain::Block;
use serde::{Deserialize, Serialize};

pub const TARGET_BLOCK_TIME_SECS: f64 = 600.0;
/// Blocks considered when averaging block time and participation.
pub const METRICS_WINDOW: usize = 10;
pub const MIN_DIFFICULTY: u32 = 2;
pub const MAX_DIFFICULTY: u32 = 8;

const FAST_BLOCK_SECS: f64 = TARGET_BLOCK_TIME_SECS * 0.8;
const SLOW_BLOCK_SECS: f64 = TARGET_BLOCK_TIME_SECS * 1.2;
const PARTICIPATION_SATURATION: f64 = 50.0;
const HEALTH_BLOCK_TIME_CEILING: f64 = 1200.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub participation: f64,
    pub avg_block_time: f64,
    pub health_score: f64,
    pub window_blocks: usize,
    pub window_transactions: usize,
}

/// Difficulty after one adaptation step for an observed average interval.
pub fn next_difficulty(current: u32, avg_block_time_secs: f64) -> u32 {
    if avg_block_time_secs < FAST_BLOCK_SECS {
        (current + 1).min(MAX_DIFFICULTY)
    } else if avg_block_time_secs > SLOW_BLOCK_SECS {
        current.saturating_sub(1).max(MIN_DIFFICULTY)
    } else {
        current
    }
}

/// Mined blocks in the metrics window. Genesis carries a fixed synthetic
/// timestamp and is never part of it.
fn window(chain: &[Block]) -> &[Block] {
    let mined = chain.get(1..).unwrap_or(&[]);
    &mined[mined.len().saturating_sub(METRICS_WINDOW)..]
}

/// Mean interval in seconds between consecutive blocks of the window.
pub fn average_block_time(chain: &[Block]) -> Option<f64> {
    let blocks = window(chain);
    if blocks.len() < 2 {
        return None;
    }
    let total_ms: i128 = blocks
        .windows(2)
        .map(|pair| pair[1].timestamp as i128 - pair[0].timestamp as i128)
        .sum();
    Some(total_ms as f64 / 1000.0 / (blocks.len() - 1) as f64)
}

pub fn compute_health(chain: &[Block]) -> HealthMetrics {
    let blocks = window(chain);
    let window_transactions: usize = blocks.iter().map(|b| b.transactions.len()).sum();
    let participation = (window_transactions as f64 / PARTICIPATION_SATURATION).min(1.0);
    let avg_block_time = average_block_time(chain).unwrap_or(TARGET_BLOCK_TIME_SECS);
    let timeliness = 1.0 - (avg_block_time / HEALTH_BLOCK_TIME_CEILING).clamp(0.0, 1.0);

    HealthMetrics {
        participation,
        avg_block_time,
        health_score: 0.6 * participation + 0.4 * timeliness,
        window_blocks: blocks.len(),
        window_transactions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_adapts_around_target() {
        assert_eq!(next_difficulty(4, 400.0), 5);
        assert_eq!(next_difficulty(4, 900.0), 3);
        assert_eq!(next_difficulty(4, 600.0), 4);
        assert_eq!(next_difficulty(4, 480.0), 4);
        assert_eq!(next_difficulty(4, 720.0), 4);
    }

    #[test]
    fn test_difficulty_respects_bounds() {
        assert_eq!(next_difficulty(8, 10.0), 8);
        assert_eq!(next_difficulty(2, 5000.0), 2);
    }
}
