//! Connected peers and their lifecycle

use super::protocol::{Message, PeerInfo};
use crate::error::KioskError;
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// `Discovered → Handshaking → Connected → {Active ⇄ Idle} → Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Discovered,
    Handshaking,
    Connected,
    Active,
    Idle,
    Disconnected,
}

/// A live connection. Outbound messages go through `sender` to the
/// connection's writer task; `close` stops its reader task.
pub struct PeerHandle {
    pub info: PeerInfo,
    pub address: SocketAddr,
    pub outbound: bool,
    pub connection_id: u64,
    pub state: PeerState,
    pub connected_at: i64,
    pub last_seen: Instant,
    sender: mpsc::UnboundedSender<Message>,
    close: watch::Sender<bool>,
}

impl PeerHandle {
    pub fn new(
        info: PeerInfo,
        address: SocketAddr,
        outbound: bool,
        connection_id: u64,
        sender: mpsc::UnboundedSender<Message>,
        close: watch::Sender<bool>,
    ) -> Self {
        Self {
            info,
            address,
            outbound,
            connection_id,
            state: PeerState::Connected,
            connected_at: chrono::Utc::now().timestamp(),
            last_seen: Instant::now(),
            sender,
            close,
        }
    }

    fn send(&self, message: Message) -> Result<(), KioskError> {
        self.sender
            .send(message)
            .map_err(|_| KioskError::Network(format!("Connection to {} is closed", self.info.peer_id)))
    }

    fn disconnect(mut self) -> PeerSummary {
        self.state = PeerState::Disconnected;
        self.close.send_replace(true);
        self.summary()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            peer_id: self.info.peer_id.clone(),
            hostname: self.info.hostname.clone(),
            address: self.address.to_string(),
            version: self.info.version.clone(),
            wallet_id: self.info.wallet_id.clone(),
            outbound: self.outbound,
            state: self.state,
            blockchain_height: self.info.blockchain_height,
            connected_at: self.connected_at,
            silent_secs: self.last_seen.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer_id: String,
    pub hostname: String,
    pub address: String,
    pub version: String,
    pub wallet_id: Option<String>,
    pub outbound: bool,
    pub state: PeerState,
    pub blockchain_height: u64,
    pub connected_at: i64,
    pub silent_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub pinged: Vec<String>,
    pub evicted: Vec<String>,
}

/// Peer id → connection. Written by the accept loop, the heartbeat loop and
/// every connection task.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, closing any older connection to the same peer.
    pub fn insert(&self, handle: PeerHandle) {
        let previous = self.peers.write().insert(handle.info.peer_id.clone(), handle);
        if let Some(previous) = previous {
            previous.disconnect();
        }
    }

    pub fn remove(&self, peer_id: &str) -> Option<PeerSummary> {
        let handle = self.peers.write().remove(peer_id)?;
        Some(handle.disconnect())
    }

    /// Remove `peer_id` only if it is still served by `connection_id`.
    pub fn remove_connection(&self, peer_id: &str, connection_id: u64) -> Option<PeerSummary> {
        let handle = {
            let mut peers = self.peers.write();
            match peers.get(peer_id) {
                Some(h) if h.connection_id == connection_id => peers.remove(peer_id),
                _ => None,
            }
        }?;
        Some(handle.disconnect())
    }

    /// Note traffic from `peer_id`.
    pub fn touch(&self, peer_id: &str) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.last_seen = Instant::now();
            peer.state = PeerState::Active;
        }
    }

    pub fn update_height(&self, peer_id: &str, height: u64, last_block_hash: &str) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            if height >= peer.info.blockchain_height {
                peer.info.blockchain_height = height;
                peer.info.last_block_hash = last_block_hash.to_string();
            }
        }
    }

    pub fn send(&self, peer_id: &str, message: Message) -> Result<(), KioskError> {
        let peers = self.peers.read();
        let peer = peers
            .get(peer_id)
            .ok_or_else(|| KioskError::Network(format!("Unknown peer {}", peer_id)))?;
        peer.send(message)
    }

    /// Queue `message` for every peer except `except`. Returns how many
    /// peers it was queued for.
    pub fn broadcast(&self, message: &Message, except: Option<&str>) -> usize {
        self.peers
            .read()
            .values()
            .filter(|p| Some(p.info.peer_id.as_str()) != except)
            .filter(|p| p.send(message.clone()).is_ok())
            .count()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    pub fn info(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).map(|p| p.info.clone())
    }

    /// Peer serving `wallet_id`; a peer without a wallet id serves its own
    /// peer id.
    pub fn find_by_wallet(&self, wallet_id: &str) -> Option<String> {
        self.peers
            .read()
            .values()
            .find(|p| p.info.wallet_id.as_deref().unwrap_or(&p.info.peer_id) == wallet_id)
            .map(|p| p.info.peer_id.clone())
    }

    pub fn random_peer(&self) -> Option<String> {
        self.peers
            .read()
            .keys()
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.peers.read().values().map(|p| p.summary()).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// One heartbeat pass at `now`: ping peers silent longer than `interval`
    /// and evict peers silent longer than three intervals.
    pub fn heartbeat(&self, now: Instant, interval: Duration) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();
        let evicted: Vec<PeerHandle> = {
            let mut peers = self.peers.write();
            let stale: Vec<String> = peers
                .values()
                .filter(|p| now.saturating_duration_since(p.last_seen) > interval * 3)
                .map(|p| p.info.peer_id.clone())
                .collect();
            let evicted = stale.iter().filter_map(|id| peers.remove(id)).collect();
            for peer in peers.values_mut() {
                if now.saturating_duration_since(peer.last_seen) > interval {
                    peer.state = PeerState::Idle;
                    let ping = Message::Ping {
                        timestamp: chrono::Utc::now().timestamp(),
                    };
                    if peer.send(ping).is_ok() {
                        report.pinged.push(peer.info.peer_id.clone());
                    }
                }
            }
            evicted
        };
        for handle in evicted {
            report.evicted.push(handle.disconnect().peer_id);
        }
        report
    }

    /// Disconnect every peer.
    pub fn clear(&self) -> usize {
        let drained: Vec<PeerHandle> = self.peers.write().drain().map(|(_, h)| h).collect();
        let count = drained.len();
        for handle in drained {
            handle.disconnect();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(peer_id: &str, wallet: Option<&str>) -> PeerInfo {
        PeerInfo {
            peer_id: peer_id.to_string(),
            hostname: "host".to_string(),
            version: "0.3.0".to_string(),
            blockchain_height: 1,
            last_block_hash: String::new(),
            capabilities: vec![],
            network_secret: String::new(),
            timestamp: 0,
            public_key: None,
            token_key: None,
            wallet_id: wallet.map(str::to_string),
        }
    }

    struct Connection {
        outbox: mpsc::UnboundedReceiver<Message>,
        closed: watch::Receiver<bool>,
    }

    fn connect(registry: &PeerRegistry, peer_id: &str, connection_id: u64) -> Connection {
        let (tx, outbox) = mpsc::unbounded_channel();
        let (close, closed) = watch::channel(false);
        let address: SocketAddr = "127.0.0.1:9470".parse().unwrap();
        registry.insert(PeerHandle::new(
            info(peer_id, None),
            address,
            false,
            connection_id,
            tx,
            close,
        ));
        Connection { outbox, closed }
    }

    #[test]
    fn test_silent_peer_is_evicted_after_three_intervals() {
        let registry = PeerRegistry::new();
        let interval = Duration::from_secs(30);
        let mut quiet = connect(&registry, "kiosk-quiet", 1);
        let mut idle = connect(&registry, "kiosk-idle", 2);
        let start = Instant::now();

        let report = registry.heartbeat(start + Duration::from_secs(31), interval);
        assert_eq!(report.evicted, Vec::<String>::new());
        assert_eq!(report.pinged.len(), 2);
        assert!(matches!(idle.outbox.try_recv(), Ok(Message::Ping { .. })));
        let _ = quiet.outbox.try_recv();

        registry.touch("kiosk-idle");
        let report = registry.heartbeat(Instant::now() + Duration::from_secs(91), interval);
        assert_eq!(report.evicted.len(), 2);
        assert!(registry.is_empty());
        assert!(*quiet.closed.borrow_and_update());
    }

    #[test]
    fn test_touch_keeps_peer_active() {
        let registry = PeerRegistry::new();
        let _conn = connect(&registry, "kiosk-a", 1);
        let later = Instant::now() + Duration::from_secs(5);
        let report = registry.heartbeat(later, Duration::from_secs(30));
        assert!(report.pinged.is_empty() && report.evicted.is_empty());
        assert_eq!(registry.summaries()[0].state, PeerState::Connected);
        registry.touch("kiosk-a");
        assert_eq!(registry.summaries()[0].state, PeerState::Active);
    }

    #[test]
    fn test_reconnect_replaces_and_closes_old_connection() {
        let registry = PeerRegistry::new();
        let old = connect(&registry, "kiosk-a", 1);
        let _new = connect(&registry, "kiosk-a", 2);
        assert!(*old.closed.borrow());
        assert_eq!(registry.len(), 1);

        // The old connection's reader exiting must not drop the new one.
        assert!(registry.remove_connection("kiosk-a", 1).is_none());
        assert!(registry.contains("kiosk-a"));
        assert!(registry.remove_connection("kiosk-a", 2).is_some());
    }

    #[test]
    fn test_broadcast_skips_sender_and_routes_by_wallet() {
        let registry = PeerRegistry::new();
        let mut a = connect(&registry, "kiosk-a", 1);
        let mut b = connect(&registry, "kiosk-b", 2);
        let sent = registry.broadcast(&Message::Pong { timestamp: 1 }, Some("kiosk-a"));
        assert_eq!(sent, 1);
        assert!(a.outbox.try_recv().is_err());
        assert!(b.outbox.try_recv().is_ok());

        assert_eq!(registry.find_by_wallet("kiosk-b").as_deref(), Some("kiosk-b"));
        assert!(registry.find_by_wallet("nobody").is_none());
        assert!(registry.send("nobody", Message::Pong { timestamp: 1 }).is_err());
    }
}
