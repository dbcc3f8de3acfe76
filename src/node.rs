//! Node wiring and the programmatic API used by the admin surface
//!
//! Every service is constructed once here and handed to its consumers by
//! `Arc`; nothing in the crate reaches for global state.

use crate::attestation::{AttestationReport, HardwareAttestor};
use crate::blockchain::{HealthMetrics, Ledger};
use crate::config::Config;
use crate::crypto::{KeyPair, TokenSigningKey};
use crate::error::KioskError;
use crate::incentives::tasks::DEFAULT_TASK_TTL_SECS;
use crate::incentives::{
    MinedBlock, MiningEngine, MiningStatus, P2pContributions, StakeRecord, StakeTier, StakingPool,
    TaskBoard, TaskType, Unstaked, VerificationTask,
};
use crate::network::{NetworkSettings, NetworkStatus, PeerNetwork, SharedEvent};
use crate::persistence::{
    JsonChainStore, NODE_KEY_FILE, STAKING_FILE, TOKENS_FILE, TOKEN_KEY_FILE, WALLET_FILE,
};
use crate::token::{Token, TokenAuthority};
use crate::transaction::Severity;
use crate::wallet::{Transfer, WalletStatus, WalletStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub peer_id: String,
    pub wallet_id: String,
    pub version: String,
    pub blockchain_height: u64,
    pub last_block_hash: String,
    pub chain_valid: bool,
    pub health: HealthMetrics,
    pub mining: MiningStatus,
    pub peer_count: usize,
    pub attestation: Option<AttestationReport>,
}

pub struct Node {
    config: Config,
    ledger: Arc<Ledger>,
    authority: Arc<TokenAuthority>,
    wallet: Arc<WalletStore>,
    staking: Arc<StakingPool>,
    tasks: TaskBoard,
    attestor: Arc<HardwareAttestor>,
    mining: Arc<MiningEngine>,
    network: Arc<PeerNetwork>,
}

impl Node {
    /// Load or create every piece of state under `config.storage.data_dir`
    /// and wire the services together. Nothing is started yet.
    pub fn open(config: Config, attestor: HardwareAttestor) -> Result<Arc<Self>, KioskError> {
        let data_dir = config.storage.data_dir.clone();
        fs::create_dir_all(&data_dir).map_err(|e| {
            KioskError::Persistence(format!("Cannot create {}: {}", data_dir.display(), e))
        })?;

        let keypair = KeyPair::load_or_create(&data_dir.join(NODE_KEY_FILE))?;
        let token_key = TokenSigningKey::load_or_create(&data_dir.join(TOKEN_KEY_FILE))?;
        let ledger = Arc::new(
            Ledger::open(
                Box::new(JsonChainStore::new(&data_dir)),
                config.mining.initial_difficulty,
            )?
            .with_max_attempts(config.mining.max_attempts),
        );
        let attestor = Arc::new(attestor);
        let peer_id = config.node.peer_id.clone();
        let authority = Arc::new(
            TokenAuthority::new(peer_id.clone(), token_key, Arc::clone(&ledger))
                .with_hardware_id(attestor.hardware_id())
                .with_store(&data_dir.join(TOKENS_FILE)),
        );
        let wallet = Arc::new(
            WalletStore::open(&data_dir.join(WALLET_FILE), config.wallet_id(), keypair.clone())?
                .with_backup_limits(config.wallet.backup_blocks, config.wallet.max_backups),
        );
        let staking = Arc::new(StakingPool::open(&data_dir.join(STAKING_FILE))?);
        let contributions = Arc::new(P2pContributions::default());

        let mining = Arc::new(MiningEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&authority),
            Arc::clone(&wallet),
            Arc::clone(&attestor),
            Arc::clone(&contributions),
        ));
        let network = PeerNetwork::new(
            NetworkSettings::from_config(&config),
            keypair,
            Arc::clone(&ledger),
            Arc::clone(&authority),
            Arc::clone(&wallet),
            contributions,
        );
        mining.set_announcer(network.clone());

        info!(
            "Node {} ready: height {}, wallet {}, data in {}",
            peer_id,
            ledger.height(),
            wallet.wallet_id(),
            data_dir.display()
        );
        Ok(Arc::new(Self {
            config,
            ledger,
            authority,
            wallet,
            staking,
            tasks: TaskBoard::new(),
            attestor,
            mining,
            network,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn authority(&self) -> &Arc<TokenAuthority> {
        &self.authority
    }

    pub fn wallet(&self) -> &Arc<WalletStore> {
        &self.wallet
    }

    pub fn staking(&self) -> &Arc<StakingPool> {
        &self.staking
    }

    pub fn network(&self) -> &Arc<PeerNetwork> {
        &self.network
    }

    /// Start the peer network, then the mining loop when configured. A node
    /// that fails attestation keeps running as a staker.
    pub async fn start(&self) -> Result<SocketAddr, KioskError> {
        let addr = self.network.start().await?;
        if self.config.mining.enabled {
            match self.mining.start() {
                Ok(()) => info!("Mining enabled"),
                Err(e) => warn!("Mining unavailable, continuing as staker only: {}", e),
            }
        }
        Ok(addr)
    }

    pub async fn shutdown(&self) {
        if self.mining.is_mining() {
            if let Err(e) = self.mining.stop().await {
                warn!("Stopping mining failed: {}", e);
            }
        }
        self.network.shutdown().await;
        info!("Node {} stopped", self.config.node.peer_id);
    }

    pub fn verify_hardware(&self) -> AttestationReport {
        self.attestor.verify_eligibility()
    }

    pub fn generate_token(&self, device_id: &str, permissions: &[String]) -> Result<Token, KioskError> {
        self.authority.issue(device_id, permissions)
    }

    pub fn validate_token(&self, token_id: &str) -> Result<Token, KioskError> {
        self.authority.validate_token_id(token_id)
    }

    pub async fn mine_once(&self) -> Result<Option<MinedBlock>, KioskError> {
        self.mining.mine_once().await
    }

    pub fn start_mining(&self) -> Result<(), KioskError> {
        self.mining.start()
    }

    pub async fn stop_mining(&self) -> Result<(), KioskError> {
        self.mining.stop().await
    }

    pub fn mining_status(&self) -> MiningStatus {
        self.mining.status()
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network.status()
    }

    pub fn request_sync(&self, peer_id: &str, from_height: u64) -> Result<(), KioskError> {
        self.network.request_sync(peer_id, from_height)
    }

    pub fn share_security_event(
        &self,
        event_type: &str,
        severity: Severity,
        description: &str,
    ) -> Result<SharedEvent, KioskError> {
        self.network.share_security_event(event_type, severity, description)
    }

    pub async fn request_transfer(
        &self,
        recipient_wallet: &str,
        token_ids: &[String],
    ) -> Result<Transfer, KioskError> {
        self.network.request_transfer(recipient_wallet, token_ids).await
    }

    pub fn wallet_status(&self) -> WalletStatus {
        self.wallet.status()
    }

    /// Stake `amount` from this node's wallet. The covering tokens stay
    /// locked until `unstake`.
    pub fn stake(&self, amount: f64, tier: StakeTier) -> Result<StakeRecord, KioskError> {
        let wallet_id = self.wallet.wallet_id();
        self.staking.check_stake(&wallet_id, amount, tier)?;
        let locked = self.wallet.lock_for_stake(amount)?;
        self.staking.stake(&wallet_id, amount, tier).map_err(|e| {
            self.wallet.unlock_staked(&locked);
            e
        })
    }

    /// Close the stake: the locked tokens come back and the accrued reward
    /// is paid into the wallet as a reward token.
    pub fn unstake(&self) -> Result<Unstaked, KioskError> {
        let unstaked = self.staking.unstake(&self.wallet.wallet_id())?;
        let released = self.wallet.release_stake();
        debug!("Released {} staked tokens", released);
        self.pay_reward(unstaked.reward)?;
        Ok(unstaked)
    }

    fn pay_reward(&self, amount: f64) -> Result<(), KioskError> {
        if amount <= 0.0 {
            return Ok(());
        }
        let wallet_id = self.wallet.wallet_id();
        let token = self
            .authority
            .issue_reward(&wallet_id, amount, self.ledger.height())?;
        self.wallet.add_token(token);
        Ok(())
    }

    /// Open a verification task for the current stakers, best tier first.
    pub fn create_verification_task(
        &self,
        task_type: TaskType,
        subject: &str,
    ) -> Result<VerificationTask, KioskError> {
        let now = chrono::Utc::now().timestamp();
        let swept = self.tasks.sweep_expired(now);
        if swept > 0 {
            info!("Dropped {} expired verification tasks", swept);
        }
        self.tasks
            .create_task_at(task_type, subject, &self.staking.ranked(), DEFAULT_TASK_TTL_SECS, now)
    }

    /// Submit this node's result for `task_id`; returns the reward earned.
    pub fn submit_task_result(&self, task_id: &str, correct: bool, confidence: f64) -> Result<f64, KioskError> {
        let wallet_id = self.wallet.wallet_id();
        let reward = self.tasks.submit_result_at(
            task_id,
            &wallet_id,
            correct,
            confidence,
            chrono::Utc::now().timestamp(),
        )?;
        self.pay_reward(reward)?;
        if reward > 0.0 {
            self.staking.credit_reward(&wallet_id, reward);
        }
        Ok(reward)
    }

    pub fn task(&self, task_id: &str) -> Option<VerificationTask> {
        self.tasks.get(task_id)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            peer_id: self.config.node.peer_id.clone(),
            wallet_id: self.wallet.wallet_id(),
            version: self.config.node.version.clone(),
            blockchain_height: self.ledger.height(),
            last_block_hash: self.ledger.tip().map(|b| b.hash).unwrap_or_default(),
            chain_valid: self.ledger.validate(),
            health: self.ledger.health_metrics(),
            mining: self.mining.status(),
            peer_count: self.network.peers().len(),
            attestation: self.attestor.last_report(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::tests::raspberry_pi;
    use crate::incentives::TaskStatus;
    use crate::transaction::{Transaction, VerificationTx};
    use std::time::Duration;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.node.peer_id = "kiosk-lobby".to_string();
        config.network.network_secret = "fleet-secret".to_string();
        config.network.bind_address = "127.0.0.1".to_string();
        config.network.listen_port = 0;
        config.storage.data_dir = dir.to_path_buf();
        config.mining.initial_difficulty = 2;
        config
    }

    fn open(dir: &std::path::Path) -> Arc<Node> {
        Node::open(config(dir), HardwareAttestor::new(Box::new(raspberry_pi()))).unwrap()
    }

    #[tokio::test]
    async fn test_mine_once_rewards_wallet_and_persists() {
        tokio::time::timeout(Duration::from_secs(60), async {
            let dir = tempfile::TempDir::new().unwrap();
            let node = open(dir.path());
            node.ledger()
                .add_transaction(Transaction::Verification(VerificationTx {
                    subject: "door-3".to_string(),
                    verifier: "kiosk-lobby".to_string(),
                    passed: true,
                    timestamp: 1,
                }))
                .unwrap();

            let mined = node.mine_once().await.unwrap().unwrap();
            assert_eq!(mined.block.index, 1);
            assert!(node.wallet_status().balance >= 10.0);
            assert!(node.status().chain_valid);
            drop(node);

            // State survives a restart.
            let node = open(dir.path());
            assert_eq!(node.ledger().height(), 2);
            assert_eq!(node.wallet_status().token_count, 1);
        })
        .await
        .expect("test timed out");
    }

    #[test]
    fn test_tokens_issue_and_validate() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = open(dir.path());
        let token = node
            .generate_token("display-7", &["display".to_string()])
            .unwrap();
        assert_eq!(node.validate_token(&token.token_id).unwrap(), token);
        assert!(node.validate_token("missing").is_err());
    }

    #[test]
    fn test_staking_feeds_task_assignment() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = open(dir.path());
        assert!(node
            .create_verification_task(TaskType::PeerAudit, "kiosk-cafe")
            .is_err());

        // An empty wallet has nothing to stake.
        let err = node
            .stake(StakeTier::Validator.min_stake(), StakeTier::Validator)
            .unwrap_err();
        assert!(err.to_string().contains("insufficient balance"));
        assert!(node.staking().get("kiosk-lobby").is_none());

        let funds = node.authority().issue_reward("kiosk-lobby", 150.0, 0).unwrap();
        node.wallet().add_token(funds);
        node.stake(StakeTier::Validator.min_stake(), StakeTier::Validator)
            .unwrap();
        let status = node.wallet_status();
        assert_eq!(status.balance, 0.0);
        assert_eq!(status.staked_balance, 150.0);

        let task = node
            .create_verification_task(TaskType::SecurityAlertValidation, "event-9")
            .unwrap();
        assert_eq!(task.assigned_to, vec!["kiosk-lobby".to_string()]);
        let reward = node.submit_task_result(&task.task_id, true, 0.5).unwrap();
        assert!((reward - 1.0).abs() < 1e-9);
        assert!((node.wallet_status().balance - 1.0).abs() < 1e-9);
        assert_eq!(node.task(&task.task_id).unwrap().status, TaskStatus::Completed);
        let record = node.staking().get("kiosk-lobby").unwrap();
        assert!((record.total_rewards_earned - 1.0).abs() < 1e-9);

        let unstaked = node.unstake().unwrap();
        assert_eq!(unstaked.principal, StakeTier::Validator.min_stake());
        assert!(unstaked.total_rewards_earned >= 1.0);
        let status = node.wallet_status();
        assert_eq!(status.staked_balance, 0.0);
        assert!(status.balance >= 151.0);
    }

    #[test]
    fn test_second_stake_leaves_wallet_untouched() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = open(dir.path());
        let funds = node.authority().issue_reward("kiosk-lobby", 400.0, 0).unwrap();
        node.wallet().add_token(funds);
        node.stake(100.0, StakeTier::Validator).unwrap();
        assert!(node.stake(100.0, StakeTier::Validator).is_err());
        assert_eq!(node.wallet_status().staked_balance, 400.0);
        node.unstake().unwrap();
        assert!(node.wallet_status().balance >= 400.0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_on_ephemeral_port() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let dir = tempfile::TempDir::new().unwrap();
            let node = open(dir.path());
            let addr = node.start().await.unwrap();
            assert_ne!(addr.port(), 0);
            assert!(node.network_status().running);
            node.shutdown().await;
            assert!(!node.network_status().running);
        })
        .await
        .expect("test timed out");
    }
}
