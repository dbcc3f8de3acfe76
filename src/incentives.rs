//! Incentives: block rewards, staking and verification tasks

pub mod mining;
pub mod staking;
pub mod tasks;

pub use mining::{
    compute_reward, BlockAnnouncer, MinedBlock, MiningDelays, MiningEngine, MiningStatus,
    P2pContributions, RewardBreakdown,
};
pub use staking::{StakeRecord, StakeTier, StakingPool, Unstaked};
pub use tasks::{TaskBoard, TaskResult, TaskStatus, TaskType, VerificationTask};
