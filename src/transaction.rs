//! Ledger transactions, split into types and validation

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::MAX_TRANSACTION_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(severity: Severity) -> Transaction {
        Transaction::SecurityEvent(SecurityEventTx {
            event_type: "intrusion_attempt".to_string(),
            severity,
            source_peer: "kiosk-gate".to_string(),
            description: "badge reader tamper switch".to_string(),
            timestamp: 1_700_000_000,
        })
    }

    #[test]
    fn test_hash_is_stable_across_json_round_trip() {
        let tx = alert(Severity::High);
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx.hash().unwrap(), back.hash().unwrap());
    }

    #[test]
    fn test_wire_shape_is_tagged_by_type() {
        let json = serde_json::to_value(alert(Severity::Critical)).unwrap();
        assert_eq!(json["type"], "security_event");
        assert_eq!(json["severity"], "critical");
    }

    #[test]
    fn test_high_severity_classification() {
        assert!(alert(Severity::High).is_high_severity_security());
        assert!(alert(Severity::Critical).is_high_severity_security());
        assert!(!alert(Severity::Low).is_high_severity_security());

        let verification = Transaction::Verification(VerificationTx {
            subject: "block:12".to_string(),
            verifier: "kiosk-cafe".to_string(),
            passed: true,
            timestamp: 1_700_000_000,
        });
        assert!(verification.is_verification());
        assert!(!verification.is_high_severity_security());
    }

    #[test]
    fn test_empty_issuance_fails_validation() {
        let tx = Transaction::TokenIssuance(TokenIssuanceTx {
            token_id: String::new(),
            token_type: "kiosk_access".to_string(),
            issued_by: "kiosk-a".to_string(),
            device_fingerprint: "ab".repeat(32),
            signature: "00".to_string(),
            timestamp: 1,
        });
        assert!(tx.validate().is_err());
    }
}
