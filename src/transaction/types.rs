/// Transaction types for the KioskMesh ledger
use crate::crypto::{canonical_json, sha256_hex};
use crate::error::KioskError;
use serde::{Deserialize, Serialize};

/// Marker recorded in the genesis block.
pub const GENESIS_MESSAGE: &str = "kioskmesh genesis: fleet security ledger";

/// Severity attached to a recorded security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn is_high(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

/// A security-relevant fact recorded on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transaction {
    Genesis(GenesisTx),
    TokenIssuance(TokenIssuanceTx),
    SecurityEvent(SecurityEventTx),
    Verification(VerificationTx),
    Reward(RewardTx),
    TokenTransfer(TokenTransferTx),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisTx {
    pub message: String,
}

/// Issuance of a capability token; `signature` ties it to the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenIssuanceTx {
    pub token_id: String,
    pub token_type: String,
    pub issued_by: String,
    pub device_fingerprint: String,
    pub signature: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEventTx {
    pub event_type: String,
    pub severity: Severity,
    pub source_peer: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: i64,
}

/// Outcome of a verification performed by a node or staker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationTx {
    pub subject: String,
    pub verifier: String,
    pub passed: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardTx {
    pub recipient_wallet: String,
    pub amount: f64,
    pub block_index: u64,
    pub token_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTransferTx {
    pub transfer_id: String,
    pub sender_wallet: String,
    pub recipient_wallet: String,
    pub token_ids: Vec<String>,
    pub timestamp: i64,
}

impl Transaction {
    pub fn genesis() -> Self {
        Transaction::Genesis(GenesisTx {
            message: GENESIS_MESSAGE.to_string(),
        })
    }

    /// SHA-256 over the canonical JSON encoding, hex encoded.
    pub fn hash(&self) -> Result<String, KioskError> {
        Ok(sha256_hex(canonical_json(self)?.as_bytes()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transaction::Genesis(_) => "genesis",
            Transaction::TokenIssuance(_) => "token_issuance",
            Transaction::SecurityEvent(_) => "security_event",
            Transaction::Verification(_) => "verification",
            Transaction::Reward(_) => "reward",
            Transaction::TokenTransfer(_) => "token_transfer",
        }
    }

    pub fn is_high_severity_security(&self) -> bool {
        matches!(self, Transaction::SecurityEvent(tx) if tx.severity.is_high())
    }

    pub fn is_verification(&self) -> bool {
        matches!(self, Transaction::Verification(_))
    }
}
