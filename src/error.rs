//! Error types for KioskMesh

use thiserror::Error;

/// Crate-wide error. Variants follow the recovery classes the node uses:
/// only [`KioskError::is_fatal`] errors may stop the process.
#[derive(Debug, Clone, Error)]
pub enum KioskError {
    /// Malformed, unsigned or expired token, transfer or message.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Hash-chain mismatch, unmet proof-of-work, duplicate index.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Timeout, refused connection, malformed frame, rejected handshake.
    #[error("Network error: {0}")]
    Network(String),

    /// Hardware or anti-spoofing checks failed; the node may only stake.
    #[error("Attestation error: {0}")]
    Attestation(String),

    /// Disk I/O failure while saving or loading state.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The listening socket could not be bound.
    #[error("Failed to bind listener: {0}")]
    Bind(String),

    /// Master key material could not be loaded or created.
    #[error("Key material unavailable: {0}")]
    KeyMaterial(String),
}

impl KioskError {
    /// True for the conditions that must terminate the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KioskError::Bind(_) | KioskError::KeyMaterial(_))
    }
}

impl From<std::io::Error> for KioskError {
    fn from(err: std::io::Error) -> Self {
        KioskError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for KioskError {
    fn from(err: serde_json::Error) -> Self {
        KioskError::Validation(format!("JSON error: {}", err))
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, KioskError>;
