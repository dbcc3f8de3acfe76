//! Local token wallet with transfers, chain backups and recovery codes

use crate::blockchain::Block;
use crate::crypto::{canonical_json, verify_signature_hex, KeyPair};
use crate::error::KioskError;
use crate::persistence::JsonFile;
use crate::token::{Token, TokenAuthority};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Transfers older than this are rejected on receipt.
pub const TRANSFER_MAX_AGE_SECS: i64 = 3600;
/// Settled transfers kept in the wallet file. Pending transfers and those
/// still inside the replay window are never dropped.
pub const MAX_SETTLED_TRANSFERS: usize = 200;
const RECOVERY_CODE_GROUPS: usize = 4;
const RECOVERY_CODE_GROUP_LEN: usize = 4;
const RECOVERY_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl Default for TransferStatus {
    fn default() -> Self {
        TransferStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: String,
    pub sender_wallet: String,
    pub recipient_wallet: String,
    pub tokens: Vec<Token>,
    pub timestamp: i64,
    #[serde(default)]
    pub sender_public_key: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Transfer {
    /// Canonical JSON of everything except the signature and local status.
    pub fn signing_payload(&self) -> Result<String, KioskError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("signature");
            fields.remove("status");
            fields.remove("reason");
        }
        canonical_json(&value)
    }

    pub fn token_ids(&self) -> Vec<String> {
        self.tokens.iter().map(|t| t.token_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBackup {
    pub created_at: i64,
    pub height: u64,
    pub tip_hash: String,
    pub blocks: Vec<Block>,
}

/// On-disk shape of `wallet.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub tokens: Vec<Token>,
    /// Tokens locked behind the wallet's stake.
    #[serde(default)]
    pub staked: Vec<Token>,
    #[serde(default)]
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub backups: Vec<ChainBackup>,
    /// Argon2 PHC strings; the codes themselves are never stored.
    #[serde(default)]
    pub recovery_code_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletStatus {
    pub wallet_id: String,
    pub token_count: usize,
    pub balance: f64,
    pub staked_balance: f64,
    pub pending_transfers: usize,
    pub completed_transfers: usize,
    pub failed_transfers: usize,
    pub backups: usize,
    pub last_backup_height: Option<u64>,
    pub recovery_codes_remaining: usize,
}

pub struct WalletStore {
    keypair: KeyPair,
    wallet: RwLock<Wallet>,
    file: Option<JsonFile<Wallet>>,
    backup_blocks: usize,
    max_backups: usize,
    max_settled_transfers: usize,
}

fn recovery_hasher() -> Result<Argon2<'static>, KioskError> {
    let params = Params::new(4096, 2, 1, None)
        .map_err(|e| KioskError::Crypto(format!("Invalid argon2 parameters: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

fn random_recovery_code() -> String {
    let mut rng = rand::thread_rng();
    (0..RECOVERY_CODE_GROUPS)
        .map(|_| {
            (0..RECOVERY_CODE_GROUP_LEN)
                .map(|_| RECOVERY_CODE_ALPHABET[rng.gen_range(0..RECOVERY_CODE_ALPHABET.len())] as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Drop the oldest settled transfers beyond `cap`, skipping any a replay
/// could still present as fresh. Returns how many were dropped.
fn prune_transfers(wallet: &mut Wallet, cap: usize, now: i64) -> usize {
    let settled = wallet
        .transfers
        .iter()
        .filter(|t| t.status != TransferStatus::Pending)
        .count();
    let mut excess = settled.saturating_sub(cap);
    if excess == 0 {
        return 0;
    }
    let before = wallet.transfers.len();
    wallet.transfers.retain(|t| {
        let droppable = t.status != TransferStatus::Pending && now - t.timestamp > TRANSFER_MAX_AGE_SECS;
        if excess > 0 && droppable {
            excess -= 1;
            return false;
        }
        true
    });
    before - wallet.transfers.len()
}

impl WalletStore {
    pub fn in_memory(wallet_id: impl Into<String>, keypair: KeyPair) -> Self {
        Self {
            keypair,
            wallet: RwLock::new(Wallet {
                wallet_id: wallet_id.into(),
                created_at: chrono::Utc::now().timestamp(),
                ..Wallet::default()
            }),
            file: None,
            backup_blocks: 100,
            max_backups: 5,
            max_settled_transfers: MAX_SETTLED_TRANSFERS,
        }
    }

    /// Load `wallet.json` or start an empty wallet for `wallet_id`.
    pub fn open(path: &Path, wallet_id: impl Into<String>, keypair: KeyPair) -> Result<Self, KioskError> {
        let wallet_id = wallet_id.into();
        let file: JsonFile<Wallet> = JsonFile::new(path);
        let mut store = Self::in_memory(wallet_id.clone(), keypair);
        match file.load()? {
            Some(wallet) if wallet.wallet_id == wallet_id => {
                info!("Loaded wallet {} with {} tokens", wallet.wallet_id, wallet.tokens.len());
                *store.wallet.write() = wallet;
            }
            Some(wallet) => {
                return Err(KioskError::Config(format!(
                    "{} belongs to wallet {}, not {}",
                    path.display(),
                    wallet.wallet_id,
                    wallet_id
                )))
            }
            None => info!("Created wallet {}", wallet_id),
        }
        store.file = Some(file);
        store.persist();
        Ok(store)
    }

    pub fn with_backup_limits(mut self, backup_blocks: usize, max_backups: usize) -> Self {
        self.backup_blocks = backup_blocks.max(1);
        self.max_backups = max_backups.max(1);
        self
    }

    pub fn with_transfer_limit(mut self, max_settled_transfers: usize) -> Self {
        self.max_settled_transfers = max_settled_transfers.max(1);
        self
    }

    fn persist(&self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.save(&self.wallet.read()) {
                warn!("Failed to persist wallet: {}", e);
            }
        }
    }

    pub fn wallet_id(&self) -> String {
        self.wallet.read().wallet_id.clone()
    }

    pub fn public_key_hex(&self) -> String {
        self.keypair.public_key_hex()
    }

    /// Returns false when a token with the same id is already held.
    pub fn add_token(&self, token: Token) -> bool {
        let added = {
            let mut wallet = self.wallet.write();
            if wallet.tokens.iter().any(|t| t.token_id == token.token_id) {
                false
            } else {
                wallet.tokens.push(token);
                true
            }
        };
        if added {
            self.persist();
        }
        added
    }

    pub fn list_tokens(&self) -> Vec<Token> {
        self.wallet.read().tokens.clone()
    }

    pub fn find_token(&self, token_id: &str) -> Option<Token> {
        self.wallet
            .read()
            .tokens
            .iter()
            .find(|t| t.token_id == token_id)
            .cloned()
    }

    /// Sum of the values carried by held tokens.
    pub fn balance(&self) -> f64 {
        self.wallet.read().tokens.iter().filter_map(|t| t.value).sum()
    }

    pub fn staked_balance(&self) -> f64 {
        self.wallet.read().staked.iter().filter_map(|t| t.value).sum()
    }

    /// Lock valued tokens worth at least `amount` behind a stake, largest
    /// first. Tokens are indivisible, so the last one may overshoot. Returns
    /// the ids of the locked tokens.
    pub fn lock_for_stake(&self, amount: f64) -> Result<Vec<String>, KioskError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(KioskError::Validation(format!("cannot stake {}", amount)));
        }
        let (ids, covered) = {
            let mut wallet = self.wallet.write();
            let mut valued: Vec<(String, f64)> = wallet
                .tokens
                .iter()
                .filter_map(|t| t.value.map(|v| (t.token_id.clone(), v)))
                .collect();
            let balance: f64 = valued.iter().map(|(_, v)| v).sum();
            if balance < amount {
                return Err(KioskError::Validation(format!(
                    "insufficient balance: {:.2} available, {:.2} needed",
                    balance, amount
                )));
            }
            valued.sort_by(|a, b| b.1.total_cmp(&a.1));
            let mut covered = 0.0;
            let mut ids = HashSet::new();
            for (id, value) in valued {
                if covered >= amount {
                    break;
                }
                covered += value;
                ids.insert(id);
            }
            let (locked, kept): (Vec<Token>, Vec<Token>) = std::mem::take(&mut wallet.tokens)
                .into_iter()
                .partition(|t| ids.contains(&t.token_id));
            wallet.tokens = kept;
            let ids: Vec<String> = locked.iter().map(|t| t.token_id.clone()).collect();
            wallet.staked.extend(locked);
            (ids, covered)
        };
        self.persist();
        info!("Locked {} tokens worth {:.2} for staking", ids.len(), covered);
        Ok(ids)
    }

    /// Return the named staked tokens to the spendable set.
    pub fn unlock_staked(&self, token_ids: &[String]) -> usize {
        let unlocked = {
            let mut wallet = self.wallet.write();
            let (released, still_locked): (Vec<Token>, Vec<Token>) = std::mem::take(&mut wallet.staked)
                .into_iter()
                .partition(|t| token_ids.contains(&t.token_id));
            wallet.staked = still_locked;
            let count = released.len();
            wallet.tokens.extend(released);
            count
        };
        if unlocked > 0 {
            self.persist();
        }
        unlocked
    }

    /// Unlock every staked token.
    pub fn release_stake(&self) -> usize {
        let ids: Vec<String> = self
            .wallet
            .read()
            .staked
            .iter()
            .map(|t| t.token_id.clone())
            .collect();
        self.unlock_staked(&ids)
    }

    pub fn transfer(&self, transfer_id: &str) -> Option<Transfer> {
        self.wallet
            .read()
            .transfers
            .iter()
            .find(|t| t.transfer_id == transfer_id)
            .cloned()
    }

    /// Sign a transfer of `token_ids` to `recipient_wallet` and remove the
    /// tokens from this wallet until the recipient answers.
    pub fn initiate_transfer(
        &self,
        recipient_wallet: &str,
        token_ids: &[String],
    ) -> Result<Transfer, KioskError> {
        if recipient_wallet.trim().is_empty() {
            return Err(KioskError::Validation("recipient wallet must not be empty".to_string()));
        }
        if token_ids.is_empty() {
            return Err(KioskError::Validation("transfer names no tokens".to_string()));
        }
        let unique: HashSet<&String> = token_ids.iter().collect();
        if unique.len() != token_ids.len() {
            return Err(KioskError::Validation("transfer names a token twice".to_string()));
        }

        let mut wallet = self.wallet.write();
        if recipient_wallet == wallet.wallet_id {
            return Err(KioskError::Validation("cannot transfer to own wallet".to_string()));
        }
        if let Some(missing) = token_ids
            .iter()
            .find(|id| !wallet.tokens.iter().any(|t| &t.token_id == *id))
        {
            return Err(KioskError::Validation(format!("token {} is not in this wallet", missing)));
        }

        let (tokens, kept): (Vec<Token>, Vec<Token>) = std::mem::take(&mut wallet.tokens)
            .into_iter()
            .partition(|t| token_ids.contains(&t.token_id));
        let mut transfer = Transfer {
            transfer_id: hex::encode(rand::random::<[u8; 16]>()),
            sender_wallet: wallet.wallet_id.clone(),
            recipient_wallet: recipient_wallet.to_string(),
            tokens,
            timestamp: chrono::Utc::now().timestamp(),
            sender_public_key: self.keypair.public_key_hex(),
            signature: String::new(),
            status: TransferStatus::Pending,
            reason: None,
        };
        let signature = transfer
            .signing_payload()
            .and_then(|payload| self.keypair.sign_hex(payload.as_bytes()));
        match signature {
            Ok(signature) => transfer.signature = signature,
            Err(e) => {
                wallet.tokens = kept;
                wallet.tokens.extend(transfer.tokens);
                return Err(e);
            }
        }
        wallet.tokens = kept;
        wallet.transfers.push(transfer.clone());
        drop(wallet);
        self.persist();
        info!(
            "Initiated transfer {} of {} tokens to {}",
            transfer.transfer_id,
            transfer.tokens.len(),
            transfer.recipient_wallet
        );
        Ok(transfer)
    }

    /// Mark an outgoing transfer acknowledged by the recipient.
    pub fn complete_transfer(&self, transfer_id: &str) -> Result<(), KioskError> {
        self.settle(transfer_id, TransferStatus::Completed, None)
    }

    /// Mark an outgoing transfer rejected or timed out and return its tokens.
    pub fn fail_transfer(&self, transfer_id: &str, reason: &str) -> Result<(), KioskError> {
        self.settle(transfer_id, TransferStatus::Failed, Some(reason.to_string()))
    }

    fn settle(
        &self,
        transfer_id: &str,
        status: TransferStatus,
        reason: Option<String>,
    ) -> Result<(), KioskError> {
        {
            let mut wallet = self.wallet.write();
            let wallet = &mut *wallet;
            let transfer = wallet
                .transfers
                .iter_mut()
                .find(|t| t.transfer_id == transfer_id)
                .ok_or_else(|| KioskError::Validation(format!("Unknown transfer {}", transfer_id)))?;
            if transfer.status != TransferStatus::Pending {
                return Err(KioskError::Validation(format!(
                    "Transfer {} is already {:?}",
                    transfer_id, transfer.status
                )));
            }
            transfer.status = status;
            transfer.reason = reason;
            if status == TransferStatus::Failed && transfer.sender_wallet == wallet.wallet_id {
                for token in transfer.tokens.clone() {
                    if !wallet.tokens.iter().any(|t| t.token_id == token.token_id) {
                        wallet.tokens.push(token);
                    }
                }
                warn!("Transfer {} failed; tokens restored", transfer_id);
            }
            prune_transfers(wallet, self.max_settled_transfers, chrono::Utc::now().timestamp());
        }
        self.persist();
        Ok(())
    }

    /// Validate an incoming transfer at `now` and merge its tokens. Returns
    /// the number of tokens that were new to this wallet.
    pub fn receive_transfer_at(
        &self,
        transfer: &Transfer,
        authority: &TokenAuthority,
        now: i64,
    ) -> Result<usize, KioskError> {
        let required = [
            ("transfer_id", &transfer.transfer_id),
            ("sender_wallet", &transfer.sender_wallet),
            ("recipient_wallet", &transfer.recipient_wallet),
            ("sender_public_key", &transfer.sender_public_key),
            ("signature", &transfer.signature),
        ];
        if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(KioskError::Validation(format!("transfer is missing {}", field)));
        }
        if transfer.tokens.is_empty() {
            return Err(KioskError::Validation("transfer carries no tokens".to_string()));
        }
        if (now - transfer.timestamp).abs() > TRANSFER_MAX_AGE_SECS {
            return Err(KioskError::Validation(format!(
                "transfer {} is stale ({}s old)",
                transfer.transfer_id,
                now - transfer.timestamp
            )));
        }
        verify_signature_hex(
            &transfer.sender_public_key,
            transfer.signing_payload()?.as_bytes(),
            &transfer.signature,
        )
        .map_err(|_| KioskError::Validation(format!("transfer {} has a bad signature", transfer.transfer_id)))?;

        let wallet_id = self.wallet_id();
        if transfer.recipient_wallet != wallet_id {
            return Err(KioskError::Validation(format!(
                "transfer {} is addressed to {}, not {}",
                transfer.transfer_id, transfer.recipient_wallet, wallet_id
            )));
        }
        for token in &transfer.tokens {
            authority.verify_detached_at(token, now)?;
        }

        let added = {
            let mut wallet = self.wallet.write();
            if wallet.transfers.iter().any(|t| t.transfer_id == transfer.transfer_id) {
                return Err(KioskError::Validation(format!(
                    "transfer {} was already received",
                    transfer.transfer_id
                )));
            }
            let mut added = 0;
            for token in &transfer.tokens {
                if !wallet.tokens.iter().any(|t| t.token_id == token.token_id) {
                    wallet.tokens.push(token.clone());
                    added += 1;
                }
            }
            let mut record = transfer.clone();
            record.status = TransferStatus::Completed;
            wallet.transfers.push(record);
            let pruned = prune_transfers(&mut wallet, self.max_settled_transfers, now);
            if pruned > 0 {
                debug!("Dropped {} old settled transfers", pruned);
            }
            added
        };
        self.persist();
        info!(
            "Received transfer {} from {} ({} new tokens)",
            transfer.transfer_id, transfer.sender_wallet, added
        );
        Ok(added)
    }

    pub fn receive_transfer(&self, transfer: &Transfer, authority: &TokenAuthority) -> Result<usize, KioskError> {
        self.receive_transfer_at(transfer, authority, chrono::Utc::now().timestamp())
    }

    /// Snapshot the last `backup_blocks` blocks of `chain`.
    pub fn backup(&self, chain: &[Block]) -> Result<ChainBackup, KioskError> {
        let tip = chain
            .last()
            .ok_or_else(|| KioskError::Validation("cannot back up an empty chain".to_string()))?;
        let start = chain.len().saturating_sub(self.backup_blocks);
        let backup = ChainBackup {
            created_at: chrono::Utc::now().timestamp(),
            height: chain.len() as u64,
            tip_hash: tip.hash.clone(),
            blocks: chain[start..].to_vec(),
        };
        {
            let mut wallet = self.wallet.write();
            wallet.backups.push(backup.clone());
            let excess = wallet.backups.len().saturating_sub(self.max_backups);
            wallet.backups.drain(..excess);
        }
        self.persist();
        info!("Backed up {} blocks at height {}", backup.blocks.len(), backup.height);
        Ok(backup)
    }

    /// Blocks of the most recent backup.
    pub fn restore(&self) -> Option<Vec<Block>> {
        self.wallet.read().backups.last().map(|b| b.blocks.clone())
    }

    /// Replace the stored recovery codes with `count` fresh ones.
    pub fn generate_recovery_codes(&self, count: usize) -> Result<Vec<String>, KioskError> {
        let hasher = recovery_hasher()?;
        let mut codes = Vec::with_capacity(count);
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let code = random_recovery_code();
            let salt = SaltString::generate(&mut rand::rngs::OsRng);
            let hash = hasher
                .hash_password(code.as_bytes(), &salt)
                .map_err(|e| KioskError::Crypto(format!("Failed to hash recovery code: {}", e)))?;
            hashes.push(hash.to_string());
            codes.push(code);
        }
        self.wallet.write().recovery_code_hashes = hashes;
        self.persist();
        Ok(codes)
    }

    /// Check a recovery code; a matching code is consumed.
    pub fn verify_recovery_code(&self, code: &str) -> bool {
        let Ok(hasher) = recovery_hasher() else {
            return false;
        };
        let normalized = code.trim().to_ascii_uppercase();
        let matched = {
            let mut wallet = self.wallet.write();
            let position = wallet.recovery_code_hashes.iter().position(|stored| {
                PasswordHash::new(stored)
                    .map(|parsed| hasher.verify_password(normalized.as_bytes(), &parsed).is_ok())
                    .unwrap_or(false)
            });
            position.map(|i| wallet.recovery_code_hashes.remove(i)).is_some()
        };
        if matched {
            self.persist();
        }
        matched
    }

    pub fn status(&self) -> WalletStatus {
        let wallet = self.wallet.read();
        let count = |status| wallet.transfers.iter().filter(|t| t.status == status).count();
        WalletStatus {
            wallet_id: wallet.wallet_id.clone(),
            token_count: wallet.tokens.len(),
            balance: wallet.tokens.iter().filter_map(|t| t.value).sum(),
            staked_balance: wallet.staked.iter().filter_map(|t| t.value).sum(),
            pending_transfers: count(TransferStatus::Pending),
            completed_transfers: count(TransferStatus::Completed),
            failed_transfers: count(TransferStatus::Failed),
            backups: wallet.backups.len(),
            last_backup_height: wallet.backups.last().map(|b| b.height),
            recovery_codes_remaining: wallet.recovery_code_hashes.len(),
        }
    }
}
