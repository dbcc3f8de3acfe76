//! Tiered staking with linear monthly accrual

use crate::error::KioskError;
use crate::persistence::JsonFile;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Accrual month: 30 days.
pub const SECONDS_PER_MONTH: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakeTier {
    Validator,
    Verifier,
    Supporter,
}

impl StakeTier {
    pub const ALL: [StakeTier; 3] = [StakeTier::Validator, StakeTier::Verifier, StakeTier::Supporter];

    pub fn min_stake(&self) -> f64 {
        match self {
            StakeTier::Validator => 100.0,
            StakeTier::Verifier => 50.0,
            StakeTier::Supporter => 25.0,
        }
    }

    pub fn monthly_rate(&self) -> f64 {
        match self {
            StakeTier::Validator => 0.03,
            StakeTier::Verifier => 0.02,
            StakeTier::Supporter => 0.01,
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "validator" => Some(StakeTier::Validator),
            "verifier" => Some(StakeTier::Verifier),
            "supporter" => Some(StakeTier::Supporter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeRecord {
    pub wallet_id: String,
    pub amount: f64,
    pub tier: StakeTier,
    #[serde(alias = "staked_at")]
    pub start_time: i64,
    /// Task rewards paid while staked, plus the accrual paid on unstake.
    #[serde(default)]
    pub total_rewards_earned: f64,
}

impl StakeRecord {
    /// `amount × monthly_rate × months_elapsed`, linear in time.
    pub fn accrued_reward_at(&self, now: i64) -> f64 {
        let elapsed = (now - self.start_time).max(0) as f64;
        self.amount * self.tier.monthly_rate() * (elapsed / SECONDS_PER_MONTH as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unstaked {
    pub wallet_id: String,
    pub principal: f64,
    pub reward: f64,
    pub total: f64,
    pub total_rewards_earned: f64,
}

/// Stake records keyed by wallet id, persisted to `staking.json`.
pub struct StakingPool {
    stakes: RwLock<HashMap<String, StakeRecord>>,
    file: Option<JsonFile<HashMap<String, StakeRecord>>>,
}

impl Default for StakingPool {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StakingPool {
    pub fn in_memory() -> Self {
        Self {
            stakes: RwLock::new(HashMap::new()),
            file: None,
        }
    }

    pub fn open(path: &Path) -> Result<Self, KioskError> {
        let file: JsonFile<HashMap<String, StakeRecord>> = JsonFile::new(path);
        let stakes = file.load()?.unwrap_or_default();
        Ok(Self {
            stakes: RwLock::new(stakes),
            file: Some(file),
        })
    }

    fn persist(&self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.save(&self.stakes.read()) {
                warn!("Failed to persist stakes: {}", e);
            }
        }
    }

    /// Reject `amount` below the tier minimum or a wallet that already
    /// stakes, without changing anything.
    pub fn check_stake(&self, wallet_id: &str, amount: f64, tier: StakeTier) -> Result<(), KioskError> {
        if !amount.is_finite() || amount < tier.min_stake() {
            return Err(KioskError::Validation(format!(
                "{:?} tier needs at least {} staked, got {}",
                tier,
                tier.min_stake(),
                amount
            )));
        }
        if self.stakes.read().contains_key(wallet_id) {
            return Err(KioskError::Validation(format!("{} already has a stake", wallet_id)));
        }
        Ok(())
    }

    pub fn stake_at(
        &self,
        wallet_id: &str,
        amount: f64,
        tier: StakeTier,
        now: i64,
    ) -> Result<StakeRecord, KioskError> {
        self.check_stake(wallet_id, amount, tier)?;
        let record = {
            let mut stakes = self.stakes.write();
            if stakes.contains_key(wallet_id) {
                return Err(KioskError::Validation(format!("{} already has a stake", wallet_id)));
            }
            let record = StakeRecord {
                wallet_id: wallet_id.to_string(),
                amount,
                tier,
                start_time: now,
                total_rewards_earned: 0.0,
            };
            stakes.insert(wallet_id.to_string(), record.clone());
            record
        };
        self.persist();
        info!("{} staked {} as {:?}", wallet_id, amount, tier);
        Ok(record)
    }

    pub fn stake(&self, wallet_id: &str, amount: f64, tier: StakeTier) -> Result<StakeRecord, KioskError> {
        self.stake_at(wallet_id, amount, tier, chrono::Utc::now().timestamp())
    }

    pub fn accrued_reward_at(&self, wallet_id: &str, now: i64) -> Option<f64> {
        self.stakes.read().get(wallet_id).map(|r| r.accrued_reward_at(now))
    }

    /// Add a paid reward to the staker's running total. Returns false when
    /// `wallet_id` has no stake.
    pub fn credit_reward(&self, wallet_id: &str, amount: f64) -> bool {
        let credited = match self.stakes.write().get_mut(wallet_id) {
            Some(record) => {
                record.total_rewards_earned += amount;
                true
            }
            None => false,
        };
        if credited {
            self.persist();
        }
        credited
    }

    /// Close the stake: compute principal plus accrued reward and delete the
    /// record. Crediting the payout is the caller's job.
    pub fn unstake_at(&self, wallet_id: &str, now: i64) -> Result<Unstaked, KioskError> {
        let record = self
            .stakes
            .write()
            .remove(wallet_id)
            .ok_or_else(|| KioskError::Validation(format!("{} has no stake", wallet_id)))?;
        self.persist();
        let reward = record.accrued_reward_at(now);
        info!("{} unstaked {} (+{:.4} reward)", wallet_id, record.amount, reward);
        Ok(Unstaked {
            wallet_id: record.wallet_id,
            principal: record.amount,
            reward,
            total: record.amount + reward,
            total_rewards_earned: record.total_rewards_earned + reward,
        })
    }

    pub fn unstake(&self, wallet_id: &str) -> Result<Unstaked, KioskError> {
        self.unstake_at(wallet_id, chrono::Utc::now().timestamp())
    }

    pub fn get(&self, wallet_id: &str) -> Option<StakeRecord> {
        self.stakes.read().get(wallet_id).cloned()
    }

    /// All stakes, highest tier first and larger stakes before smaller.
    pub fn ranked(&self) -> Vec<StakeRecord> {
        let mut stakes: Vec<StakeRecord> = self.stakes.read().values().cloned().collect();
        stakes.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then(b.amount.total_cmp(&a.amount))
                .then_with(|| a.wallet_id.cmp(&b.wallet_id))
        });
        stakes
    }

    pub fn total_staked(&self) -> f64 {
        self.stakes.read().values().map(|r| r.amount).sum()
    }
}
