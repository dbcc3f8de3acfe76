//! Hardware-bound capability tokens
//!
//! Tokens are signed by the issuing node's RSA token key (RSA-PSS with
//! SHA-256) over the canonical JSON of their fields and recorded on the ledger as `token_issuance`
//! transactions. The signed payload leaves out `signature` and
//! `blockchain_tx`: the ledger reference only exists once the signed token
//! has been recorded, and it is checked against the ledger instead.

use crate::blockchain::Ledger;
use crate::crypto::{canonical_json, sha256_hex, verify_pss_hex, TokenSigningKey};
use crate::error::KioskError;
use crate::persistence::JsonFile;
use crate::transaction::{RewardTx, TokenIssuanceTx, Transaction};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default validity of an issued token: one year.
pub const TOKEN_VALIDITY_SECS: i64 = 365 * 24 * 60 * 60;
pub const ACCESS_TOKEN_TYPE: &str = "kiosk_access";
pub const REWARD_TOKEN_TYPE: &str = "mining_reward";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: String,
    pub token_type: String,
    /// Peer id of the issuing node.
    pub issued_by: String,
    pub permissions: Vec<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    pub device_fingerprint: String,
    #[serde(default)]
    pub blockchain_tx: Option<String>,
    /// Reward tokens carry the amount they are worth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default)]
    pub signature: String,
}

impl Token {
    /// Canonical JSON of the signed fields.
    pub fn signing_payload(&self) -> Result<String, KioskError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("signature");
            fields.remove("blockchain_tx");
        }
        canonical_json(&value)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        now > self.expires_at
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fingerprint binding a token to `device_id` on this physical machine.
pub fn device_fingerprint(device_id: &str, hardware_id: &str) -> String {
    sha256_hex(format!("{}:{}", device_id, hardware_id).as_bytes())
}

/// Issues, signs and verifies capability tokens.
pub struct TokenAuthority {
    issuer_id: String,
    signing_key: TokenSigningKey,
    hardware_id: String,
    ledger: Arc<Ledger>,
    /// Issuer id -> RSA public key (PEM).
    issuers: RwLock<HashMap<String, String>>,
    registry: RwLock<HashMap<String, Token>>,
    store: Option<JsonFile<Vec<Token>>>,
}

impl TokenAuthority {
    pub fn new(issuer_id: impl Into<String>, signing_key: TokenSigningKey, ledger: Arc<Ledger>) -> Self {
        let issuer_id = issuer_id.into();
        let mut issuers = HashMap::new();
        issuers.insert(issuer_id.clone(), signing_key.public_key_pem().to_string());
        Self {
            issuer_id,
            signing_key,
            hardware_id: crate::attestation::stable_hardware_id(),
            ledger,
            issuers: RwLock::new(issuers),
            registry: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Attach `tokens.json`, loading any tokens issued in earlier runs.
    pub fn with_store(mut self, path: &Path) -> Self {
        let file = JsonFile::new(path);
        match file.load() {
            Ok(Some(tokens)) => {
                let tokens: Vec<Token> = tokens;
                let mut registry = self.registry.write();
                for token in tokens {
                    registry.insert(token.token_id.clone(), token);
                }
                info!("Loaded {} issued tokens", registry.len());
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable token registry: {}", e),
        }
        self.store = Some(file);
        self
    }

    pub fn with_hardware_id(mut self, hardware_id: impl Into<String>) -> Self {
        self.hardware_id = hardware_id.into();
        self
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    pub fn public_key_pem(&self) -> &str {
        self.signing_key.public_key_pem()
    }

    /// Trust tokens signed by `issuer_id` with the RSA key `public_key_pem`.
    pub fn register_issuer(&self, issuer_id: &str, public_key_pem: &str) {
        let previous = self
            .issuers
            .write()
            .insert(issuer_id.to_string(), public_key_pem.to_string());
        if previous.as_deref() != Some(public_key_pem) {
            debug!("Registered issuer key for {}", issuer_id);
        }
    }

    pub fn issuer_key(&self, issuer_id: &str) -> Option<String> {
        self.issuers.read().get(issuer_id).cloned()
    }

    pub fn device_fingerprint(&self, device_id: &str) -> String {
        device_fingerprint(device_id, &self.hardware_id)
    }

    /// Issue an access token for `device_id`.
    pub fn issue(&self, device_id: &str, permissions: &[String]) -> Result<Token, KioskError> {
        self.issue_typed(ACCESS_TOKEN_TYPE, device_id, permissions, None)
    }

    pub fn issue_typed(
        &self,
        token_type: &str,
        device_id: &str,
        permissions: &[String],
        value: Option<f64>,
    ) -> Result<Token, KioskError> {
        let mut token = self.sign_new(token_type, device_id, permissions, value)?;
        let tx_hash = self
            .ledger
            .add_transaction(Transaction::TokenIssuance(TokenIssuanceTx {
                token_id: token.token_id.clone(),
                token_type: token.token_type.clone(),
                issued_by: token.issued_by.clone(),
                device_fingerprint: token.device_fingerprint.clone(),
                signature: token.signature.clone(),
                timestamp: token.issued_at,
            }))?;
        token.blockchain_tx = Some(tx_hash);
        self.register(&token);
        info!("Issued {} token {} for {}", token.token_type, token.token_id, device_id);
        Ok(token)
    }

    /// Issue a mining reward token worth `amount` to `wallet_id`. The reward
    /// transaction doubles as the token's ledger record.
    pub fn issue_reward(&self, wallet_id: &str, amount: f64, block_index: u64) -> Result<Token, KioskError> {
        let mut token = self.sign_new(REWARD_TOKEN_TYPE, wallet_id, &[], Some(amount))?;
        let tx_hash = self.ledger.add_transaction(Transaction::Reward(RewardTx {
            recipient_wallet: wallet_id.to_string(),
            amount,
            block_index,
            token_id: token.token_id.clone(),
            timestamp: token.issued_at,
        }))?;
        token.blockchain_tx = Some(tx_hash);
        self.register(&token);
        debug!("Issued reward token {} worth {:.2}", token.token_id, amount);
        Ok(token)
    }

    fn sign_new(
        &self,
        token_type: &str,
        device_id: &str,
        permissions: &[String],
        value: Option<f64>,
    ) -> Result<Token, KioskError> {
        if device_id.trim().is_empty() {
            return Err(KioskError::Validation("device id must not be empty".to_string()));
        }
        let issued_at = chrono::Utc::now().timestamp();
        let mut token = Token {
            token_id: random_hex(16),
            token_type: token_type.to_string(),
            issued_by: self.issuer_id.clone(),
            permissions: permissions.to_vec(),
            issued_at,
            expires_at: issued_at + TOKEN_VALIDITY_SECS,
            device_fingerprint: self.device_fingerprint(device_id),
            blockchain_tx: None,
            value,
            signature: String::new(),
        };
        token.signature = self.signing_key.sign_pss_hex(token.signing_payload()?.as_bytes())?;
        Ok(token)
    }

    fn register(&self, token: &Token) {
        self.registry
            .write()
            .insert(token.token_id.clone(), token.clone());
        self.persist();
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let tokens: Vec<Token> = self.registry.read().values().cloned().collect();
            if let Err(e) = store.save(&tokens) {
                warn!("Failed to persist token registry: {}", e);
            }
        }
    }

    /// Signature under the issuer's known key and expiry, without consulting
    /// the ledger.
    pub fn verify_detached_at(&self, token: &Token, now: i64) -> Result<(), KioskError> {
        if token.expires_at <= token.issued_at {
            return Err(KioskError::Validation(format!(
                "Token {} expires before it is issued",
                token.token_id
            )));
        }
        let key = self.issuer_key(&token.issued_by).ok_or_else(|| {
            KioskError::Validation(format!("Unknown token issuer {}", token.issued_by))
        })?;
        verify_pss_hex(&key, token.signing_payload()?.as_bytes(), &token.signature)
            .map_err(|_| KioskError::Validation(format!("Token {} has a bad signature", token.token_id)))?;
        if token.is_expired_at(now) {
            return Err(KioskError::Validation(format!("Token {} expired", token.token_id)));
        }
        Ok(())
    }

    pub fn verify_detached(&self, token: &Token) -> Result<(), KioskError> {
        self.verify_detached_at(token, chrono::Utc::now().timestamp())
    }

    /// Full verification at `now`: signature, expiry and, when the token
    /// names one, its issuance transaction on the ledger.
    pub fn verify_at(&self, token: &Token, now: i64) -> Result<(), KioskError> {
        self.verify_detached_at(token, now)?;
        if let Some(tx_hash) = &token.blockchain_tx {
            let location = self.ledger.find_transaction(tx_hash).ok_or_else(|| {
                KioskError::Validation(format!("Issuance transaction {} not on ledger", tx_hash))
            })?;
            match location.transaction {
                Transaction::TokenIssuance(tx)
                    if tx.token_id == token.token_id && tx.signature == token.signature => {}
                Transaction::Reward(tx) if tx.token_id == token.token_id => {}
                _ => {
                    return Err(KioskError::Validation(format!(
                        "Ledger transaction {} does not match token {}",
                        tx_hash, token.token_id
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn verify(&self, token: &Token) -> bool {
        self.verify_at(token, chrono::Utc::now().timestamp()).is_ok()
    }

    pub fn find(&self, token_id: &str) -> Option<Token> {
        self.registry.read().get(token_id).cloned()
    }

    /// Look up a token this node issued and verify it.
    pub fn validate_token_id(&self, token_id: &str) -> Result<Token, KioskError> {
        let token = self
            .find(token_id)
            .ok_or_else(|| KioskError::Validation(format!("Unknown token {}", token_id)))?;
        self.verify_at(&token, chrono::Utc::now().timestamp())?;
        Ok(token)
    }

    pub fn issued_tokens(&self) -> Vec<Token> {
        let mut tokens: Vec<Token> = self.registry.read().values().cloned().collect();
        tokens.sort_by_key(|t| t.issued_at);
        tokens
    }
}
