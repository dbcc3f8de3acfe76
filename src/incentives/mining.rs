//! Background mining loop and block rewards

use crate::attestation::HardwareAttestor;
use crate::blockchain::{Block, Ledger};
use crate::error::KioskError;
use crate::token::{Token, TokenAuthority};
use crate::transaction::Transaction;
use crate::wallet::WalletStore;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const BASE_BLOCK_REWARD: f64 = 10.0;
pub const MAX_BLOCK_REWARD: f64 = 30.0;
const PER_TRANSACTION_REWARD: f64 = 0.5;
const HIGH_SEVERITY_BONUS: f64 = 3.0;
const VERIFICATION_BONUS: f64 = 1.0;
const PER_CONTRIBUTION_BONUS: f64 = 0.1;
/// Uptime reaches 100% after one day of running.
const FULL_UPTIME_SECS: f64 = 24.0 * 60.0 * 60.0;
/// The chain is backed up to the wallet every this many blocks.
const BACKUP_EVERY_BLOCKS: u64 = 10;

/// Pause lengths of the mining loop.
#[derive(Debug, Clone, Copy)]
pub struct MiningDelays {
    pub after_block: Duration,
    pub idle: Duration,
    pub after_error: Duration,
}

impl Default for MiningDelays {
    fn default() -> Self {
        Self {
            after_block: Duration::from_secs(10),
            idle: Duration::from_secs(30),
            after_error: Duration::from_secs(10),
        }
    }
}

/// Count of network services this node performed for its peers.
#[derive(Debug, Default)]
pub struct P2pContributions(AtomicU64);

impl P2pContributions {
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Receives every block this node mines, e.g. to gossip it.
pub trait BlockAnnouncer: Send + Sync {
    fn announce(&self, block: &Block);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub base: f64,
    pub transactions: f64,
    pub security: f64,
    pub participation: f64,
    pub uptime: f64,
    pub p2p: f64,
    pub total: f64,
}

/// Reward for `block`, capped at [`MAX_BLOCK_REWARD`].
pub fn compute_reward(
    block: &Block,
    participation: f64,
    uptime_percent: f64,
    contributions: u64,
) -> RewardBreakdown {
    let high_severity = block
        .transactions
        .iter()
        .filter(|tx| tx.is_high_severity_security())
        .count();
    let verifications = block.transactions.iter().filter(|tx| tx.is_verification()).count();

    let base = BASE_BLOCK_REWARD;
    let transactions = PER_TRANSACTION_REWARD * block.transactions.len() as f64;
    let security = HIGH_SEVERITY_BONUS * high_severity as f64 + VERIFICATION_BONUS * verifications as f64;
    let participation = 10.0 * (1.0 - participation.clamp(0.0, 1.0)) * 0.5;
    let uptime = (uptime_percent.clamp(0.0, 100.0) / 100.0) * 2.0;
    let p2p = contributions as f64 * PER_CONTRIBUTION_BONUS;
    let total = (base + transactions + security + participation + uptime + p2p).min(MAX_BLOCK_REWARD);
    RewardBreakdown {
        base,
        transactions,
        security,
        participation,
        uptime,
        p2p,
        total,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinedBlock {
    pub block: Block,
    pub reward: RewardBreakdown,
    pub reward_token: Token,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningStatus {
    pub is_mining: bool,
    pub blocks_mined: u64,
    pub difficulty: u32,
    pub pending_transactions: usize,
    pub p2p_contributions: u64,
    pub uptime_percent: f64,
    pub last_reward: Option<RewardBreakdown>,
}

pub struct MiningEngine {
    ledger: Arc<Ledger>,
    authority: Arc<TokenAuthority>,
    wallet: Arc<WalletStore>,
    attestor: Arc<HardwareAttestor>,
    contributions: Arc<P2pContributions>,
    announcer: RwLock<Option<Arc<dyn BlockAnnouncer>>>,
    running: watch::Sender<bool>,
    cancel: Arc<AtomicBool>,
    blocks_mined: AtomicU64,
    last_reward: RwLock<Option<RewardBreakdown>>,
    started_at: Instant,
    delays: MiningDelays,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MiningEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        authority: Arc<TokenAuthority>,
        wallet: Arc<WalletStore>,
        attestor: Arc<HardwareAttestor>,
        contributions: Arc<P2pContributions>,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            ledger,
            authority,
            wallet,
            attestor,
            contributions,
            announcer: RwLock::new(None),
            running,
            cancel: Arc::new(AtomicBool::new(false)),
            blocks_mined: AtomicU64::new(0),
            last_reward: RwLock::new(None),
            started_at: Instant::now(),
            delays: MiningDelays::default(),
            task: Mutex::new(None),
        }
    }

    pub fn with_delays(mut self, delays: MiningDelays) -> Self {
        self.delays = delays;
        self
    }

    pub fn set_announcer(&self, announcer: Arc<dyn BlockAnnouncer>) {
        *self.announcer.write() = Some(announcer);
    }

    pub fn is_mining(&self) -> bool {
        *self.running.borrow()
    }

    pub fn blocks_mined(&self) -> u64 {
        self.blocks_mined.load(Ordering::Relaxed)
    }

    pub fn uptime_percent(&self) -> f64 {
        (self.started_at.elapsed().as_secs_f64() / FULL_UPTIME_SECS * 100.0).min(100.0)
    }

    pub fn status(&self) -> MiningStatus {
        MiningStatus {
            is_mining: self.is_mining(),
            blocks_mined: self.blocks_mined(),
            difficulty: self.ledger.difficulty(),
            pending_transactions: self.ledger.pending_count(),
            p2p_contributions: self.contributions.count(),
            uptime_percent: self.uptime_percent(),
            last_reward: self.last_reward.read().clone(),
        }
    }

    fn require_mining_role(&self) -> Result<(), KioskError> {
        let report = self
            .attestor
            .last_report()
            .unwrap_or_else(|| self.attestor.verify_eligibility());
        report.require_mining_role()
    }

    /// Start the background loop. Needs an eligible, non-spoofed attestation.
    pub fn start(self: &Arc<Self>) -> Result<(), KioskError> {
        self.require_mining_role()?;
        if self.running.send_replace(true) {
            return Err(KioskError::Validation("Mining is already running".to_string()));
        }
        self.cancel.store(false, Ordering::SeqCst);
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run_loop().await });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop the loop and cancel any nonce search in progress.
    pub async fn stop(&self) -> Result<(), KioskError> {
        if !self.running.send_replace(false) {
            return Err(KioskError::Validation("Mining is not running".to_string()));
        }
        self.cancel.store(true, Ordering::SeqCst);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Mining task ended abnormally: {}", e);
            }
        }
        info!("Mining stopped");
        Ok(())
    }

    async fn run_loop(self: Arc<Self>) {
        info!("Mining started");
        let mut running = self.running.subscribe();
        while *running.borrow_and_update() {
            let delay = match self.mine_iteration().await {
                Ok(Some(mined)) => {
                    info!(
                        "Block {} mined, reward {:.2}",
                        mined.block.index, mined.reward.total
                    );
                    self.delays.after_block
                }
                Ok(None) => self.delays.idle,
                Err(e) => {
                    error!("Mining iteration failed: {}", e);
                    self.delays.after_error
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = running.changed() => {}
            }
        }
    }

    /// Whether the pool holds anything besides reward records.
    fn has_work(&self) -> bool {
        self.ledger
            .pending_transactions()
            .iter()
            .any(|tx| !matches!(tx, Transaction::Reward(_)))
    }

    async fn mine_iteration(self: &Arc<Self>) -> Result<Option<MinedBlock>, KioskError> {
        self.ledger.adapt_difficulty();
        if !self.has_work() {
            return Ok(None);
        }
        let cancel = Arc::clone(&self.cancel);
        self.mine_blocking(cancel).await
    }

    /// Mine the pending pool once, outside the background loop.
    pub async fn mine_once(self: &Arc<Self>) -> Result<Option<MinedBlock>, KioskError> {
        self.require_mining_role()?;
        self.mine_blocking(Arc::new(AtomicBool::new(false))).await
    }

    async fn mine_blocking(self: &Arc<Self>, cancel: Arc<AtomicBool>) -> Result<Option<MinedBlock>, KioskError> {
        let ledger = Arc::clone(&self.ledger);
        let block = tokio::task::spawn_blocking(move || ledger.mine_pending_with_cancel(&cancel))
            .await
            .map_err(|e| KioskError::Consistency(format!("Mining task failed: {}", e)))??;
        match block {
            Some(block) => self.reward_block(block).map(Some),
            None => Ok(None),
        }
    }

    fn reward_block(&self, block: Block) -> Result<MinedBlock, KioskError> {
        let health = self.ledger.health_metrics();
        let reward = compute_reward(
            &block,
            health.participation,
            self.uptime_percent(),
            self.contributions.count(),
        );
        self.blocks_mined.fetch_add(1, Ordering::Relaxed);
        if let Some(announcer) = self.announcer.read().clone() {
            announcer.announce(&block);
        }

        let wallet_id = self.wallet.wallet_id();
        let reward_token = self.authority.issue_reward(&wallet_id, reward.total, block.index)?;
        self.wallet.add_token(reward_token.clone());
        *self.last_reward.write() = Some(reward.clone());

        if block.index % BACKUP_EVERY_BLOCKS == 0 {
            if let Err(e) = self.wallet.backup(&self.ledger.snapshot()) {
                warn!("Chain backup failed: {}", e);
            }
        }
        Ok(MinedBlock {
            block,
            reward,
            reward_token,
        })
    }
}
