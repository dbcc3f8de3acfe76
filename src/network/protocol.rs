//! Wire messages exchanged between peers

use crate::blockchain::{validate_block_shape, Block};
use crate::crypto::canonical_json;
use crate::error::KioskError;
use crate::transaction::{SecurityEventTx, Severity};
use crate::wallet::Transfer;
use serde::{Deserialize, Serialize};

/// Blocks per `blockchain_sync_response` message.
pub const SYNC_CHUNK_SIZE: usize = 10;

/// Event types that may be shared with other peers.
pub const SHAREABLE_EVENT_TYPES: [&str; 5] = [
    "attack_detected",
    "system_compromise",
    "critical_alert",
    "intrusion_attempt",
    "malware_detected",
];

pub fn is_shareable_event(event_type: &str) -> bool {
    SHAREABLE_EVENT_TYPES.contains(&event_type)
}

/// Identity a node presents during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub hostname: String,
    pub version: String,
    pub blockchain_height: u64,
    pub last_block_hash: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub network_secret: String,
    pub timestamp: i64,
    /// Compressed secp256k1 node key (hex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// RSA public key (PEM) that verifies tokens this node issues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
}

/// Major component of a `major.minor.patch` version string.
pub fn major_version(version: &str) -> Option<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()?
        .parse()
        .ok()
}

pub fn versions_compatible(a: &str, b: &str) -> bool {
    matches!((major_version(a), major_version(b)), (Some(x), Some(y)) if x == y)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: Severity,
    pub source_peer: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: i64,
}

impl SecurityEvent {
    pub fn signing_payload(&self) -> Result<String, KioskError> {
        canonical_json(self)
    }

    pub fn to_transaction(&self) -> SecurityEventTx {
        SecurityEventTx {
            event_type: self.event_type.clone(),
            severity: self.severity,
            source_peer: self.source_peer.clone(),
            description: self.description.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChunk {
    pub blocks: Vec<Block>,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub total_blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Handshake {
        info: PeerInfo,
    },
    Accept {
        local_info: PeerInfo,
    },
    Reject {
        reason: String,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    BlockchainSyncRequest {
        from_height: u64,
        timestamp: i64,
    },
    BlockchainSyncResponse(SyncChunk),
    SecurityEvent {
        event: SecurityEvent,
        signature: String,
        sender_peer_id: String,
        timestamp: i64,
    },
    NewBlock {
        block: Block,
        timestamp: i64,
    },
    TokenTransferRequest {
        transfer_data: Transfer,
    },
    TokenTransferResponse {
        transfer_id: String,
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

fn require(field: &str, value: &str) -> Result<(), KioskError> {
    if value.trim().is_empty() {
        return Err(KioskError::Validation(format!("message field {} is empty", field)));
    }
    Ok(())
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::Accept { .. } => "accept",
            Message::Reject { .. } => "reject",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::BlockchainSyncRequest { .. } => "blockchain_sync_request",
            Message::BlockchainSyncResponse(_) => "blockchain_sync_response",
            Message::SecurityEvent { .. } => "security_event",
            Message::NewBlock { .. } => "new_block",
            Message::TokenTransferRequest { .. } => "token_transfer_request",
            Message::TokenTransferResponse { .. } => "token_transfer_response",
        }
    }

    /// Per-type schema checks applied before dispatch.
    pub fn validate(&self) -> Result<(), KioskError> {
        match self {
            Message::Handshake { info } | Message::Accept { local_info: info } => {
                require("peer_id", &info.peer_id)?;
                require("version", &info.version)
            }
            Message::BlockchainSyncResponse(chunk) => {
                if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
                    return Err(KioskError::Validation(format!(
                        "sync chunk {} of {} is out of range",
                        chunk.chunk_index, chunk.total_chunks
                    )));
                }
                if chunk.blocks.len() > SYNC_CHUNK_SIZE {
                    return Err(KioskError::Validation(format!(
                        "sync chunk carries {} blocks",
                        chunk.blocks.len()
                    )));
                }
                chunk.blocks.iter().try_for_each(validate_block_shape)
            }
            Message::NewBlock { block, .. } => validate_block_shape(block),
            Message::SecurityEvent {
                event,
                signature,
                sender_peer_id,
                ..
            } => {
                require("event.type", &event.event_type)?;
                require("event.event_id", &event.event_id)?;
                require("signature", signature)?;
                require("sender_peer_id", sender_peer_id)
            }
            Message::TokenTransferRequest { transfer_data } => require("transfer_id", &transfer_data.transfer_id),
            Message::TokenTransferResponse { transfer_id, .. } => require("transfer_id", transfer_id),
            Message::Reject { .. }
            | Message::Ping { .. }
            | Message::Pong { .. }
            | Message::BlockchainSyncRequest { .. } => Ok(()),
        }
    }
}
