/// Stateless validation of ledger transactions
use crate::error::KioskError;
use crate::transaction::types::Transaction;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

fn require(field: &str, value: &str) -> Result<(), KioskError> {
    if value.trim().is_empty() {
        return Err(KioskError::Validation(format!(
            "Transaction field '{}' must not be empty",
            field
        )));
    }
    Ok(())
}

impl Transaction {
    pub fn validate_size(&self) -> Result<(), KioskError> {
        let size = serde_json::to_vec(self)?.len();
        if size > MAX_TRANSACTION_SIZE {
            return Err(KioskError::Validation(format!(
                "Transaction too large: {} bytes (max: {})",
                size, MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    /// Shape checks applied before a transaction enters the pending pool.
    pub fn validate(&self) -> Result<(), KioskError> {
        self.validate_size()?;
        match self {
            Transaction::Genesis(_) => Err(KioskError::Validation(
                "Genesis transactions cannot be submitted".to_string(),
            )),
            Transaction::TokenIssuance(tx) => {
                require("token_id", &tx.token_id)?;
                require("issued_by", &tx.issued_by)?;
                require("device_fingerprint", &tx.device_fingerprint)?;
                require("signature", &tx.signature)
            }
            Transaction::SecurityEvent(tx) => {
                require("event_type", &tx.event_type)?;
                require("source_peer", &tx.source_peer)
            }
            Transaction::Verification(tx) => {
                require("subject", &tx.subject)?;
                require("verifier", &tx.verifier)
            }
            Transaction::Reward(tx) => {
                require("recipient_wallet", &tx.recipient_wallet)?;
                if !tx.amount.is_finite() || tx.amount < 0.0 {
                    return Err(KioskError::Validation(format!(
                        "Reward amount {} is not a finite positive number",
                        tx.amount
                    )));
                }
                Ok(())
            }
            Transaction::TokenTransfer(tx) => {
                require("transfer_id", &tx.transfer_id)?;
                require("recipient_wallet", &tx.recipient_wallet)?;
                if tx.token_ids.is_empty() {
                    return Err(KioskError::Validation(
                        "Token transfer carries no tokens".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}
