//! KioskMesh - a serverless trust fabric for fleets of kiosk devices
//!
//! # Architecture
//!
//! ## Ledger
//! - [`blockchain`] - Proof-of-work security ledger, validation and difficulty
//! - [`transaction`] - Ledger transaction types
//!
//! ## Trust
//! - [`token`] - Signed, device-bound access and reward tokens
//! - [`attestation`] - Hardware eligibility and anti-spoofing checks
//! - [`crypto`] - Hashing and secp256k1 signatures
//!
//! ## Incentives & Wallet
//! - [`incentives`] - Mining loop, rewards, staking and verification tasks
//! - [`wallet`] - Token holdings, transfers, backups and recovery codes
//!
//! ## Networking
//! - [`network`] - Framed peer protocol, handshake, heartbeat and gossip
//! - [`sync`] - Chunked ledger synchronization
//! - [`cache`] - Bounded duplicate suppression
//!
//! ## Wiring & Utilities
//! - [`node`] - Service construction and the programmatic node API
//! - [`api`] - HTTP admin API (feature `api`)
//! - [`config`] - Configuration management
//! - [`persistence`] - Atomic JSON state files
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Ledger
// ============================================================================
pub mod blockchain;
pub mod transaction;

// ============================================================================
// Trust
// ============================================================================
pub mod attestation;
pub mod crypto;
pub mod token;

// ============================================================================
// Incentives & Wallet
// ============================================================================
pub mod incentives;
pub mod wallet;

// ============================================================================
// Networking
// ============================================================================
pub mod cache;
pub mod network;
pub mod sync;

// ============================================================================
// Wiring & Utilities
// ============================================================================
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod error;
pub mod node;
pub mod persistence;

pub use error::{KioskError, Result};
