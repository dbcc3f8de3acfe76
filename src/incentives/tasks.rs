//! Verification tasks handed out to stakers

use super::staking::StakeRecord;
use crate::error::KioskError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

pub const MAX_ASSIGNEES: usize = 3;
pub const DEFAULT_TASK_TTL_SECS: i64 = 60 * 60;
/// Finished tasks stay queryable this long past their deadline.
pub const TASK_RETENTION_SECS: i64 = 24 * 60 * 60;
/// Reward multiplier for a result later found to be wrong.
pub const INCORRECT_RESULT_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    BlockVerification,
    SecurityAlertValidation,
    TokenValidation,
    HardwareAttestation,
    PeerAudit,
}

impl TaskType {
    pub fn base_reward(&self) -> f64 {
        match self {
            TaskType::BlockVerification => 1.0,
            TaskType::SecurityAlertValidation => 2.0,
            TaskType::TokenValidation => 0.5,
            TaskType::HardwareAttestation => 1.5,
            TaskType::PeerAudit => 0.75,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// Every assigned staker submitted a result.
    Completed,
    /// The deadline passed first.
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub submitter: String,
    pub correct: bool,
    pub confidence: f64,
    pub reward: f64,
    pub submitted_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationTask {
    pub task_id: String,
    pub task_type: TaskType,
    /// Block hash, token id or event id under review.
    pub subject: String,
    /// Base reward for a correct, fully confident result.
    pub reward: f64,
    pub assigned_to: Vec<String>,
    pub created_at: i64,
    pub deadline: i64,
    pub status: TaskStatus,
    pub results: Vec<TaskResult>,
}

impl VerificationTask {
    fn expire_if_due(&mut self, now: i64) -> bool {
        if self.status == TaskStatus::Pending && now > self.deadline {
            self.status = TaskStatus::Expired;
            return true;
        }
        false
    }
}

#[derive(Default)]
pub struct TaskBoard {
    tasks: RwLock<HashMap<String, VerificationTask>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task and assign it to the first `MAX_ASSIGNEES` of `ranked`
    /// (callers pass stakers best first).
    pub fn create_task_at(
        &self,
        task_type: TaskType,
        subject: &str,
        ranked: &[StakeRecord],
        ttl_secs: i64,
        now: i64,
    ) -> Result<VerificationTask, KioskError> {
        if ranked.is_empty() {
            return Err(KioskError::Validation("no stakers available for assignment".to_string()));
        }
        let task = VerificationTask {
            task_id: hex::encode(rand::random::<[u8; 12]>()),
            task_type,
            subject: subject.to_string(),
            reward: task_type.base_reward(),
            assigned_to: ranked
                .iter()
                .take(MAX_ASSIGNEES)
                .map(|r| r.wallet_id.clone())
                .collect(),
            created_at: now,
            deadline: now + ttl_secs,
            status: TaskStatus::Pending,
            results: Vec::new(),
        };
        self.tasks.write().insert(task.task_id.clone(), task.clone());
        info!(
            "Created {:?} task {} for {} assignees",
            task.task_type,
            task.task_id,
            task.assigned_to.len()
        );
        Ok(task)
    }

    /// Record a result and return the reward it earns:
    /// `reward × (1.0 if correct else 0.5) × confidence`. The last assignee
    /// to submit completes the task.
    pub fn submit_result_at(
        &self,
        task_id: &str,
        submitter: &str,
        correct: bool,
        confidence: f64,
        now: i64,
    ) -> Result<f64, KioskError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(KioskError::Validation(format!("confidence {} outside [0, 1]", confidence)));
        }
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| KioskError::Validation(format!("Unknown task {}", task_id)))?;
        if task.expire_if_due(now) {
            info!("Task {} expired with {} results", task_id, task.results.len());
        }
        match task.status {
            TaskStatus::Pending => {}
            TaskStatus::Expired => {
                return Err(KioskError::Validation(format!("task {} is past its deadline", task_id)))
            }
            TaskStatus::Completed => {
                return Err(KioskError::Validation(format!("task {} is already completed", task_id)))
            }
        }
        if !task.assigned_to.iter().any(|a| a == submitter) {
            return Err(KioskError::Validation(format!(
                "{} is not assigned to task {}",
                submitter, task_id
            )));
        }
        if task.results.iter().any(|r| r.submitter == submitter) {
            return Err(KioskError::Validation(format!(
                "{} already submitted for task {}",
                submitter, task_id
            )));
        }
        let factor = if correct { 1.0 } else { INCORRECT_RESULT_FACTOR };
        let reward = task.reward * factor * confidence;
        task.results.push(TaskResult {
            submitter: submitter.to_string(),
            correct,
            confidence,
            reward,
            submitted_at: now,
        });
        debug!("{} earned {:.3} on task {}", submitter, reward, task_id);
        if task.results.len() == task.assigned_to.len() {
            task.status = TaskStatus::Completed;
            info!("Task {} completed", task_id);
        }
        Ok(reward)
    }

    pub fn get(&self, task_id: &str) -> Option<VerificationTask> {
        self.tasks.read().get(task_id).cloned()
    }

    /// Open tasks assigned to `wallet_id`.
    pub fn assigned_to(&self, wallet_id: &str, now: i64) -> Vec<VerificationTask> {
        self.tasks
            .read()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.deadline >= now
                    && t.assigned_to.iter().any(|a| a == wallet_id)
            })
            .cloned()
            .collect()
    }

    /// Mark open tasks past their deadline as expired and forget finished
    /// tasks older than [`TASK_RETENTION_SECS`]. Returns how many expired.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut tasks = self.tasks.write();
        let expired = tasks
            .values_mut()
            .map(|t| t.expire_if_due(now))
            .filter(|expired| *expired)
            .count();
        let before = tasks.len();
        tasks.retain(|_, t| t.status == TaskStatus::Pending || now <= t.deadline + TASK_RETENTION_SECS);
        let purged = before - tasks.len();
        if purged > 0 {
            debug!("Forgot {} finished tasks", purged);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}
