//! Peer-to-peer fleet network
//!
//! Every node listens on one TCP port. A connection starts with a
//! handshake (trusted peer id, shared network secret, compatible major
//! version), after which each side runs one reader task and one writer task
//! for it. Background tasks send heartbeats, evict silent peers and pull
//! missing blocks from a random peer.

pub mod framing;
pub mod peer;
pub mod protocol;

pub use peer::{HeartbeatReport, PeerRegistry, PeerState, PeerSummary};
pub use protocol::{Message, PeerInfo, SecurityEvent, SyncChunk};

use crate::blockchain::{Block, BlockAcceptance, Ledger};
use crate::cache::SeenCache;
use crate::config::Config;
use crate::crypto::{verify_signature_hex, KeyPair};
use crate::error::KioskError;
use crate::incentives::{BlockAnnouncer, P2pContributions};
use crate::sync::{apply_session, chunk_blocks, SyncAssembler, SyncReport};
use crate::token::TokenAuthority;
use crate::transaction::{Severity, TokenTransferTx, Transaction};
use crate::wallet::{Transfer, WalletStore};
use framing::{read_message, write_message};
use parking_lot::{Mutex, RwLock};
use peer::PeerHandle;
use protocol::{is_shareable_event, versions_compatible};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECENT_EVENTS: usize = 100;
/// How long a failed handshake waits for its reject to be written.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub peer_id: String,
    pub hostname: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub network_secret: String,
    pub trusted_peers: HashSet<String>,
    pub bind_address: String,
    pub listen_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub sync_interval: Duration,
    pub connect_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl NetworkSettings {
    pub fn from_config(config: &Config) -> Self {
        let network = &config.network;
        Self {
            peer_id: config.node.peer_id.clone(),
            hostname: config.node.hostname.clone(),
            version: config.node.version.clone(),
            capabilities: config.node.capabilities.clone(),
            network_secret: network.network_secret.clone(),
            trusted_peers: network.trusted_peers.iter().cloned().collect(),
            bind_address: network.bind_address.clone(),
            listen_port: network.listen_port,
            bootstrap_peers: network.bootstrap_peers.clone(),
            heartbeat_interval: Duration::from_secs(network.heartbeat_interval_secs),
            sync_interval: Duration::from_secs(network.sync_interval_secs),
            connect_timeout: Duration::from_secs(network.connect_timeout_secs),
            transfer_timeout: Duration::from_secs(network.transfer_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub peer_id: String,
    pub listen_address: Option<String>,
    pub running: bool,
    pub peer_count: usize,
    pub peers: Vec<PeerSummary>,
    pub blockchain_height: u64,
    pub last_block_hash: String,
    pub last_sync: Option<SyncReport>,
    pub sync_sessions: usize,
    pub recent_events: Vec<SecurityEvent>,
    pub p2p_contributions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedEvent {
    pub event: SecurityEvent,
    pub peers_notified: usize,
}

#[derive(Debug)]
struct TransferAck {
    accepted: bool,
    reason: Option<String>,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct PeerNetwork {
    settings: NetworkSettings,
    keypair: KeyPair,
    /// Peer id -> secp256k1 node key (hex), learned in the handshake.
    node_keys: RwLock<HashMap<String, String>>,
    ledger: Arc<Ledger>,
    authority: Arc<TokenAuthority>,
    wallet: Arc<WalletStore>,
    contributions: Arc<P2pContributions>,
    peers: PeerRegistry,
    sync: SyncAssembler,
    last_sync: RwLock<Option<SyncReport>>,
    seen_events: SeenCache<String>,
    seen_blocks: SeenCache<String>,
    recent_events: RwLock<VecDeque<SecurityEvent>>,
    pending_transfers: Mutex<HashMap<String, oneshot::Sender<TransferAck>>>,
    shutdown: watch::Sender<bool>,
    local_addr: RwLock<Option<SocketAddr>>,
    next_connection_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerNetwork {
    pub fn new(
        settings: NetworkSettings,
        keypair: KeyPair,
        ledger: Arc<Ledger>,
        authority: Arc<TokenAuthority>,
        wallet: Arc<WalletStore>,
        contributions: Arc<P2pContributions>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let mut node_keys = HashMap::new();
        node_keys.insert(settings.peer_id.clone(), keypair.public_key_hex());
        Arc::new(Self {
            settings,
            keypair,
            node_keys: RwLock::new(node_keys),
            ledger,
            authority,
            wallet,
            contributions,
            peers: PeerRegistry::new(),
            sync: SyncAssembler::new(),
            last_sync: RwLock::new(None),
            seen_events: SeenCache::default(),
            seen_blocks: SeenCache::default(),
            recent_events: RwLock::new(VecDeque::new()),
            pending_transfers: Mutex::new(HashMap::new()),
            shutdown,
            local_addr: RwLock::new(None),
            next_connection_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.settings.peer_id
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn local_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.settings.peer_id.clone(),
            hostname: self.settings.hostname.clone(),
            version: self.settings.version.clone(),
            blockchain_height: self.ledger.height(),
            last_block_hash: self.ledger.tip().map(|b| b.hash).unwrap_or_default(),
            capabilities: self.settings.capabilities.clone(),
            network_secret: self.settings.network_secret.clone(),
            timestamp: now_secs(),
            public_key: Some(self.keypair.public_key_hex()),
            token_key: Some(self.authority.public_key_pem().to_string()),
            wallet_id: Some(self.wallet.wallet_id()),
        }
    }

    /// Node key `peer_id` presented in its handshake.
    pub fn node_key(&self, peer_id: &str) -> Option<String> {
        self.node_keys.read().get(peer_id).cloned()
    }

    pub fn register_node_key(&self, peer_id: &str, public_key_hex: &str) {
        let previous = self
            .node_keys
            .write()
            .insert(peer_id.to_string(), public_key_hex.to_string());
        if previous.as_deref() != Some(public_key_hex) {
            debug!("Registered node key for {}", peer_id);
        }
    }

    /// Reason `info` may not join, if any.
    pub fn check_handshake(&self, info: &PeerInfo) -> Result<(), String> {
        if info.peer_id == self.settings.peer_id {
            return Err("self-connection".to_string());
        }
        if !self.settings.trusted_peers.contains(&info.peer_id) {
            return Err(format!("peer {} is not trusted", info.peer_id));
        }
        if info.network_secret != self.settings.network_secret {
            return Err("network secret mismatch".to_string());
        }
        if !versions_compatible(&info.version, &self.settings.version) {
            return Err(format!(
                "incompatible version {} (local {})",
                info.version, self.settings.version
            ));
        }
        Ok(())
    }

    /// Bind the listener and start the accept, heartbeat and sync loops.
    /// Failing to bind is fatal for the node.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, KioskError> {
        let bind = format!("{}:{}", self.settings.bind_address, self.settings.listen_port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| KioskError::Bind(format!("Cannot listen on {}: {}", bind, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| KioskError::Bind(format!("Cannot read listener address: {}", e)))?;
        *self.local_addr.write() = Some(addr);
        info!("Peer {} listening on {}", self.settings.peer_id, addr);

        let mut tasks = vec![
            tokio::spawn(Arc::clone(self).accept_loop(listener)),
            tokio::spawn(Arc::clone(self).heartbeat_loop()),
            tokio::spawn(Arc::clone(self).sync_loop()),
        ];
        for address in self.settings.bootstrap_peers.clone() {
            let network = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                match network.connect(&address).await {
                    Ok(info) => info!("Joined bootstrap peer {} at {}", info.peer_id, address),
                    Err(e) => warn!("Bootstrap peer {} unavailable: {}", address, e),
                }
            }));
        }
        self.tasks.lock().extend(tasks);
        Ok(addr)
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.read().is_some() && !*self.shutdown.borrow()
    }

    /// Stop every loop and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let closed = self.peers.clear();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("Network task did not stop in time");
            }
        }
        self.pending_transfers.lock().clear();
        info!("Network stopped ({} peers disconnected)", closed);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow_and_update() {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let network = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = network.handle_inbound(stream, addr).await {
                                warn!("Inbound connection from {} failed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("Accept loop stopped");
    }

    async fn handle_inbound(self: Arc<Self>, mut stream: TcpStream, addr: SocketAddr) -> Result<(), KioskError> {
        let info = match self.read_handshake(&mut stream, addr).await {
            Ok(info) => info,
            Err(e) => {
                reject(&mut stream, e.to_string()).await;
                return Err(e);
            }
        };
        if let Err(reason) = self.check_handshake(&info) {
            warn!("Rejected handshake from {} ({}): {}", info.peer_id, addr, reason);
            reject(&mut stream, reason).await;
            return Ok(());
        }
        write_message(
            &mut stream,
            &Message::Accept {
                local_info: self.local_info(),
            },
        )
        .await?;
        self.register(stream, info, addr, false);
        Ok(())
    }

    async fn read_handshake(&self, stream: &mut TcpStream, addr: SocketAddr) -> Result<PeerInfo, KioskError> {
        let first = tokio::time::timeout(self.settings.connect_timeout, read_message(stream))
            .await
            .map_err(|_| KioskError::Network(format!("Handshake from {} timed out", addr)))??;
        match first {
            Message::Handshake { info } => Ok(info),
            other => Err(KioskError::Network(format!("expected handshake, got {}", other.kind()))),
        }
    }

    /// Dial `address` and perform the handshake. The responder is held to
    /// the same trust rules as inbound peers.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<PeerInfo, KioskError> {
        let timeout = self.settings.connect_timeout;
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| KioskError::Network(format!("Connecting to {} timed out", address)))?
            .map_err(|e| KioskError::Network(format!("Cannot connect to {}: {}", address, e)))?;
        let addr = stream
            .peer_addr()
            .map_err(|e| KioskError::Network(format!("Connection to {} failed: {}", address, e)))?;

        write_message(
            &mut stream,
            &Message::Handshake {
                info: self.local_info(),
            },
        )
        .await?;
        let reply = match tokio::time::timeout(timeout, read_message(&mut stream)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                reject(&mut stream, e.to_string()).await;
                return Err(e);
            }
            Err(_) => {
                let e = KioskError::Network(format!("Handshake with {} timed out", address));
                reject(&mut stream, e.to_string()).await;
                return Err(e);
            }
        };

        match reply {
            Message::Accept { local_info } => {
                if let Err(reason) = self.check_handshake(&local_info) {
                    reject(&mut stream, reason.clone()).await;
                    return Err(KioskError::Network(format!(
                        "{} at {} failed verification: {}",
                        local_info.peer_id, address, reason
                    )));
                }
                self.register(stream, local_info.clone(), addr, true);
                Ok(local_info)
            }
            Message::Reject { reason } => Err(KioskError::Network(format!(
                "{} rejected handshake: {}",
                address, reason
            ))),
            other => {
                let reason = format!("expected accept, got {}", other.kind());
                reject(&mut stream, reason.clone()).await;
                Err(KioskError::Network(format!(
                    "Unexpected {} during handshake with {}: {}",
                    other.kind(),
                    address,
                    reason
                )))
            }
        }
    }

    fn register(self: &Arc<Self>, stream: TcpStream, info: PeerInfo, address: SocketAddr, outbound: bool) {
        if let Some(key) = &info.public_key {
            self.register_node_key(&info.peer_id, key);
        }
        if let Some(key) = &info.token_key {
            self.authority.register_issuer(&info.peer_id, key);
        }
        let peer_id = info.peer_id.clone();
        let peer_height = info.blockchain_height;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (sender, outbox) = mpsc::unbounded_channel();
        let (close, closed) = watch::channel(false);
        self.peers
            .insert(PeerHandle::new(info, address, outbound, connection_id, sender, close));
        info!(
            "Peer {} connected ({} {})",
            peer_id,
            if outbound { "outbound to" } else { "inbound from" },
            address
        );

        tokio::spawn(write_loop(writer, outbox, peer_id.clone()));
        tokio::spawn(Arc::clone(self).read_loop(reader, peer_id.clone(), connection_id, closed));

        let local_height = self.ledger.height();
        if peer_height > local_height {
            if let Err(e) = self.request_sync(&peer_id, local_height) {
                warn!("Initial sync request to {} failed: {}", peer_id, e);
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        peer_id: String,
        connection_id: u64,
        mut closed: watch::Receiver<bool>,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *closed.borrow_and_update() || *shutdown.borrow_and_update() {
                break;
            }
            let message = tokio::select! {
                _ = shutdown.changed() => break,
                _ = closed.changed() => break,
                read = read_message(&mut reader) => read,
            };
            match message {
                Ok(message) => {
                    self.peers.touch(&peer_id);
                    self.dispatch(&peer_id, message);
                }
                Err(KioskError::Network(e)) => {
                    debug!("Connection to {} closed: {}", peer_id, e);
                    break;
                }
                Err(e) => warn!("Dropped message from {}: {}", peer_id, e),
            }
        }
        if self.peers.remove_connection(&peer_id, connection_id).is_some() {
            self.sync.abandon(&peer_id);
            info!("Peer {} disconnected", peer_id);
        }
    }

    fn dispatch(&self, peer_id: &str, message: Message) {
        let kind = message.kind();
        let result = match message {
            Message::Ping { .. } => self.peers.send(peer_id, Message::Pong { timestamp: now_secs() }),
            Message::Pong { .. } => Ok(()),
            Message::BlockchainSyncRequest { from_height, .. } => self.serve_sync(peer_id, from_height),
            Message::BlockchainSyncResponse(chunk) => {
                self.receive_sync_chunk(peer_id, chunk);
                Ok(())
            }
            Message::NewBlock { block, .. } => self.receive_block(peer_id, block),
            Message::SecurityEvent {
                event,
                signature,
                sender_peer_id,
                ..
            } => self.receive_security_event(peer_id, event, signature, sender_peer_id),
            Message::TokenTransferRequest { transfer_data } => self.receive_transfer(peer_id, transfer_data),
            Message::TokenTransferResponse {
                transfer_id,
                accepted,
                reason,
            } => {
                self.resolve_transfer(&transfer_id, TransferAck { accepted, reason });
                Ok(())
            }
            Message::Handshake { .. } | Message::Accept { .. } | Message::Reject { .. } => {
                debug!("Ignoring {} from {} after handshake", kind, peer_id);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Handling {} from {} failed: {}", kind, peer_id, e);
        }
    }

    /// Ask `peer_id` for every block from `from_height` on.
    pub fn request_sync(&self, peer_id: &str, from_height: u64) -> Result<(), KioskError> {
        debug!("Requesting blocks from height {} from {}", from_height, peer_id);
        self.peers.send(
            peer_id,
            Message::BlockchainSyncRequest {
                from_height,
                timestamp: now_secs(),
            },
        )
    }

    fn serve_sync(&self, peer_id: &str, from_height: u64) -> Result<(), KioskError> {
        let blocks = self.ledger.blocks_from(from_height);
        let served = blocks.len();
        for chunk in chunk_blocks(blocks) {
            self.peers.send(peer_id, Message::BlockchainSyncResponse(chunk))?;
        }
        if served > 0 {
            self.contributions.record();
        }
        debug!("Served {} blocks from height {} to {}", served, from_height, peer_id);
        Ok(())
    }

    fn receive_sync_chunk(&self, peer_id: &str, chunk: SyncChunk) {
        let chunks = chunk.total_chunks;
        if let Some(blocks) = self.sync.accept_chunk(peer_id, chunk) {
            let report = apply_session(&self.ledger, peer_id, blocks, chunks);
            *self.last_sync.write() = Some(report);
        }
    }

    pub fn last_sync(&self) -> Option<SyncReport> {
        self.last_sync.read().clone()
    }

    /// Only a block the ledger accepted (or already holds) is remembered as
    /// seen and moves the sender's advertised height; a forged copy must not
    /// shadow the genuine block arriving later.
    fn receive_block(&self, peer_id: &str, block: Block) -> Result<(), KioskError> {
        if self.seen_blocks.contains(&block.hash) {
            return Ok(());
        }
        let index = block.index;
        let hash = block.hash.clone();
        match self.ledger.accept_block(block.clone()) {
            Ok(acceptance) => {
                self.seen_blocks.insert(hash.clone(), now_secs());
                self.peers.update_height(peer_id, index + 1, &hash);
                if acceptance == BlockAcceptance::Appended {
                    info!("Accepted block {} from {}", index, peer_id);
                    self.contributions.record();
                    self.peers.broadcast(
                        &Message::NewBlock {
                            block,
                            timestamp: now_secs(),
                        },
                        Some(peer_id),
                    );
                }
                Ok(())
            }
            Err(_) if index > self.ledger.height() => {
                debug!("Block {} from {} is ahead of the local chain; syncing", index, peer_id);
                self.request_sync(peer_id, self.ledger.height())
            }
            Err(e) => Err(e),
        }
    }

    fn receive_security_event(
        &self,
        peer_id: &str,
        event: SecurityEvent,
        signature: String,
        sender_peer_id: String,
    ) -> Result<(), KioskError> {
        if !is_shareable_event(&event.event_type) {
            return Err(KioskError::Validation(format!(
                "event type {} is not shareable",
                event.event_type
            )));
        }
        if self.seen_events.contains(&signature) {
            return Ok(());
        }
        if event.source_peer != sender_peer_id {
            return Err(KioskError::Validation(format!(
                "event from {} claims source {}",
                sender_peer_id, event.source_peer
            )));
        }
        let key = self.node_key(&sender_peer_id).ok_or_else(|| {
            KioskError::Validation(format!("no key known for {}", sender_peer_id))
        })?;
        verify_signature_hex(&key, event.signing_payload()?.as_bytes(), &signature).map_err(|_| {
            KioskError::Validation(format!("event {} has a bad signature", event.event_id))
        })?;
        if !self.seen_events.insert(signature.clone(), now_secs()) {
            return Ok(());
        }

        match event.event_type.as_str() {
            "system_compromise" | "malware_detected" => error!(
                "Peer {} reports {}: {}",
                sender_peer_id, event.event_type, event.description
            ),
            _ => warn!(
                "Peer {} reports {} ({:?}): {}",
                sender_peer_id, event.event_type, event.severity, event.description
            ),
        }
        self.ledger
            .add_transaction(Transaction::SecurityEvent(event.to_transaction()))?;
        self.remember_event(event.clone());
        self.contributions.record();
        self.peers.broadcast(
            &Message::SecurityEvent {
                event,
                signature,
                sender_peer_id,
                timestamp: now_secs(),
            },
            Some(peer_id),
        );
        Ok(())
    }

    fn remember_event(&self, event: SecurityEvent) {
        let mut events = self.recent_events.write();
        if events.len() == RECENT_EVENTS {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Sign a security event with the node key, record it locally and send
    /// it to every peer.
    pub fn share_security_event(
        &self,
        event_type: &str,
        severity: Severity,
        description: &str,
    ) -> Result<SharedEvent, KioskError> {
        if !is_shareable_event(event_type) {
            return Err(KioskError::Validation(format!(
                "event type {} is not shareable",
                event_type
            )));
        }
        let event = SecurityEvent {
            event_id: hex::encode(rand::random::<[u8; 12]>()),
            event_type: event_type.to_string(),
            severity,
            source_peer: self.settings.peer_id.clone(),
            description: description.to_string(),
            timestamp: now_secs(),
        };
        let signature = self.keypair.sign_hex(event.signing_payload()?.as_bytes())?;
        self.seen_events.insert(signature.clone(), event.timestamp);
        self.ledger
            .add_transaction(Transaction::SecurityEvent(event.to_transaction()))?;
        self.remember_event(event.clone());
        let peers_notified = self.peers.broadcast(
            &Message::SecurityEvent {
                event: event.clone(),
                signature,
                sender_peer_id: self.settings.peer_id.clone(),
                timestamp: event.timestamp,
            },
            None,
        );
        info!("Shared {} event with {} peers", event.event_type, peers_notified);
        Ok(SharedEvent { event, peers_notified })
    }

    fn receive_transfer(&self, peer_id: &str, transfer: Transfer) -> Result<(), KioskError> {
        let transfer_id = transfer.transfer_id.clone();
        let (accepted, reason) = match self.accept_transfer(peer_id, &transfer) {
            Ok(_) => (true, None),
            Err(e) => {
                warn!("Rejected transfer {} from {}: {}", transfer_id, peer_id, e);
                (false, Some(e.to_string()))
            }
        };
        if accepted {
            let tx = Transaction::TokenTransfer(TokenTransferTx {
                transfer_id: transfer.transfer_id.clone(),
                sender_wallet: transfer.sender_wallet.clone(),
                recipient_wallet: transfer.recipient_wallet.clone(),
                token_ids: transfer.token_ids(),
                timestamp: transfer.timestamp,
            });
            if let Err(e) = self.ledger.add_transaction(tx) {
                warn!("Could not record transfer {}: {}", transfer_id, e);
            }
        }
        self.peers.send(
            peer_id,
            Message::TokenTransferResponse {
                transfer_id,
                accepted,
                reason,
            },
        )
    }

    fn accept_transfer(&self, peer_id: &str, transfer: &Transfer) -> Result<usize, KioskError> {
        if self.node_key(peer_id).as_deref() != Some(transfer.sender_public_key.as_str()) {
            return Err(KioskError::Validation(format!(
                "transfer {} is not signed by peer {}",
                transfer.transfer_id, peer_id
            )));
        }
        self.wallet.receive_transfer(transfer, &self.authority)
    }

    fn resolve_transfer(&self, transfer_id: &str, ack: TransferAck) {
        match self.pending_transfers.lock().remove(transfer_id) {
            Some(waiter) => {
                let _ = waiter.send(ack);
            }
            None => debug!("Response for unknown transfer {}", transfer_id),
        }
    }

    /// Send `token_ids` to the peer serving `recipient_wallet` and wait for
    /// its answer. Tokens come back to this wallet on rejection or timeout.
    pub async fn request_transfer(
        &self,
        recipient_wallet: &str,
        token_ids: &[String],
    ) -> Result<Transfer, KioskError> {
        let peer_id = self.peers.find_by_wallet(recipient_wallet).ok_or_else(|| {
            KioskError::Network(format!("No connected peer serves wallet {}", recipient_wallet))
        })?;
        let transfer = self.wallet.initiate_transfer(recipient_wallet, token_ids)?;
        let transfer_id = transfer.transfer_id.clone();
        let (waiter, reply) = oneshot::channel();
        self.pending_transfers.lock().insert(transfer_id.clone(), waiter);

        let sent = self.peers.send(
            &peer_id,
            Message::TokenTransferRequest {
                transfer_data: transfer.clone(),
            },
        );
        if let Err(e) = sent {
            self.pending_transfers.lock().remove(&transfer_id);
            self.wallet.fail_transfer(&transfer_id, &e.to_string())?;
            return Err(e);
        }

        let outcome = tokio::time::timeout(self.settings.transfer_timeout, reply).await;
        self.pending_transfers.lock().remove(&transfer_id);
        match outcome {
            Ok(Ok(TransferAck { accepted: true, .. })) => {
                self.wallet.complete_transfer(&transfer_id)?;
                info!("Transfer {} accepted by {}", transfer_id, peer_id);
                Ok(self.wallet.transfer(&transfer_id).unwrap_or(transfer))
            }
            Ok(Ok(TransferAck { reason, .. })) => {
                let reason = reason.unwrap_or_else(|| "rejected".to_string());
                self.wallet.fail_transfer(&transfer_id, &reason)?;
                Err(KioskError::Validation(format!(
                    "Transfer {} rejected: {}",
                    transfer_id, reason
                )))
            }
            Ok(Err(_)) => {
                self.wallet.fail_transfer(&transfer_id, "connection closed")?;
                Err(KioskError::Network(format!(
                    "Connection closed before transfer {} was answered",
                    transfer_id
                )))
            }
            Err(_) => {
                self.wallet.fail_transfer(&transfer_id, "timeout")?;
                Err(KioskError::Network(format!("Transfer {} timed out", transfer_id)))
            }
        }
    }

    /// One heartbeat pass over the registry.
    pub fn heartbeat_pass(&self) -> HeartbeatReport {
        let report = self
            .peers
            .heartbeat(Instant::now(), self.settings.heartbeat_interval);
        for peer_id in &report.evicted {
            self.sync.abandon(peer_id);
            warn!("Evicted silent peer {}", peer_id);
        }
        report
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let report = self.heartbeat_pass();
                    if !report.pinged.is_empty() {
                        debug!("Pinged {} idle peers", report.pinged.len());
                    }
                }
            }
        }
        debug!("Heartbeat loop stopped");
    }

    async fn sync_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.settings.sync_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Some(peer_id) = self.peers.random_peer() {
                        if let Err(e) = self.request_sync(&peer_id, self.ledger.height()) {
                            warn!("Periodic sync with {} failed: {}", peer_id, e);
                        }
                    }
                }
            }
        }
        debug!("Sync loop stopped");
    }

    pub fn status(&self) -> NetworkStatus {
        let peers = self.peers.summaries();
        NetworkStatus {
            peer_id: self.settings.peer_id.clone(),
            listen_address: self.local_addr().map(|a| a.to_string()),
            running: self.is_running(),
            peer_count: peers.len(),
            peers,
            blockchain_height: self.ledger.height(),
            last_block_hash: self.ledger.tip().map(|b| b.hash).unwrap_or_default(),
            last_sync: self.last_sync(),
            sync_sessions: self.sync.in_progress(),
            recent_events: self.recent_events.read().iter().cloned().collect(),
            p2p_contributions: self.contributions.count(),
        }
    }
}

impl BlockAnnouncer for PeerNetwork {
    fn announce(&self, block: &Block) {
        self.seen_blocks.insert(block.hash.clone(), now_secs());
        let sent = self.peers.broadcast(
            &Message::NewBlock {
                block: block.clone(),
                timestamp: now_secs(),
            },
            None,
        );
        debug!("Announced block {} to {} peers", block.index, sent);
    }
}

/// Tell the other side why its handshake failed, then close the socket.
async fn reject(stream: &mut TcpStream, reason: String) {
    let sent = tokio::time::timeout(REJECT_WRITE_TIMEOUT, write_message(stream, &Message::Reject { reason })).await;
    if !matches!(sent, Ok(Ok(()))) {
        debug!("Could not deliver handshake reject");
    }
    let _ = stream.shutdown().await;
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Message>, peer_id: String) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            debug!("Write to {} failed: {}", peer_id, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
