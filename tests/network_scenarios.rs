//! Multi-node scenarios over loopback TCP

mod common;

use common::{wait_until, TestNode, SECRET};
use kioskmesh::blockchain::Ledger;
use kioskmesh::crypto::TokenSigningKey;
use kioskmesh::error::KioskError;
use kioskmesh::network::framing::{read_message, write_message};
use kioskmesh::network::{Message, PeerInfo};
use kioskmesh::sync::{apply_session, SyncAssembler};
use kioskmesh::token::TokenAuthority;
use kioskmesh::transaction::{Severity, Transaction, VerificationTx};
use kioskmesh::wallet::TransferStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

const LIMIT: Duration = Duration::from_secs(10);

fn raw_info(peer_id: &str, secret: &str) -> PeerInfo {
    PeerInfo {
        peer_id: peer_id.to_string(),
        hostname: "raw-client".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        blockchain_height: 0,
        last_block_hash: String::new(),
        capabilities: vec![],
        network_secret: secret.to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        public_key: None,
        token_key: None,
        wallet_id: None,
    }
}

/// Open a plain socket and send a handshake; returns the stream and reply.
async fn raw_handshake(addr: &str, info: PeerInfo) -> (TcpStream, Message) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    write_message(&mut stream, &Message::Handshake { info }).await.unwrap();
    let reply = read_message(&mut stream).await.unwrap();
    (stream, reply)
}

fn verification(n: u64) -> Transaction {
    Transaction::Verification(VerificationTx {
        subject: format!("display-{}", n),
        verifier: "kiosk-b".to_string(),
        passed: true,
        timestamp: n as i64,
    })
}

fn grow(ledger: &Ledger, height: u64) {
    while ledger.height() < height {
        ledger.add_transaction(verification(ledger.height())).unwrap();
        ledger.mine_pending().unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_trusted_peers_complete_handshake() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let a = TestNode::start("kiosk-a", &["kiosk-b"]).await;
        let b = TestNode::start("kiosk-b", &["kiosk-a"]).await;

        let info = a.node.network().connect(&b.address()).await.unwrap();
        assert_eq!(info.peer_id, "kiosk-b");
        assert_eq!(info.wallet_id.as_deref(), Some("kiosk-b"));

        assert!(wait_until(LIMIT, || b.node.network().peers().contains("kiosk-a")).await);
        assert!(a.node.network().peers().contains("kiosk-b"));
        assert_eq!(
            b.node.authority().issuer_key("kiosk-a").as_deref(),
            Some(a.node.authority().public_key_pem())
        );
        assert_eq!(
            b.node.network().node_key("kiosk-a"),
            Some(a.node.wallet().public_key_hex())
        );
        assert_eq!(a.node.network_status().peer_count, 1);

        a.node.shutdown().await;
        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_untrusted_peer_or_wrong_secret_is_rejected() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let b = TestNode::start("kiosk-b", &["kiosk-a", "kiosk-d"]).await;
        let stranger = TestNode::start("kiosk-c", &["kiosk-b"]).await;
        let guesser = TestNode::start_with("kiosk-d", &["kiosk-b"], |c| {
            c.network.network_secret = "not-the-secret".to_string();
        })
        .await;

        let err = stranger.node.network().connect(&b.address()).await.unwrap_err();
        assert!(matches!(err, KioskError::Network(_)));
        assert!(err.to_string().contains("not trusted"));
        assert!(guesser.node.network().connect(&b.address()).await.is_err());
        assert!(b.node.network().peers().is_empty());

        // On the wire: a reject, then the socket closes.
        let (mut stream, reply) = raw_handshake(&b.address(), raw_info("kiosk-a", "wrong-secret")).await;
        match reply {
            Message::Reject { reason } => assert!(reason.contains("secret")),
            other => panic!("expected reject, got {:?}", other),
        }
        assert!(read_message(&mut stream).await.is_err());

        b.node.shutdown().await;
        stranger.node.shutdown().await;
        guesser.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_malformed_or_silent_handshake_is_rejected() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let b = TestNode::start_with("kiosk-b", &["kiosk-a"], |c| {
            c.network.connect_timeout_secs = 1;
        })
        .await;

        // Fails message validation: no peer id.
        let (mut stream, reply) = raw_handshake(&b.address(), raw_info("", SECRET)).await;
        match reply {
            Message::Reject { reason } => assert!(reason.contains("peer_id")),
            other => panic!("expected reject, got {:?}", other),
        }
        assert!(read_message(&mut stream).await.is_err());

        // Never sends a handshake.
        let mut silent = TcpStream::connect(&b.address()).await.unwrap();
        match read_message(&mut silent).await.unwrap() {
            Message::Reject { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected reject, got {:?}", other),
        }
        assert!(read_message(&mut silent).await.is_err());
        assert!(b.node.network().peers().is_empty());

        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_sync_request_is_served_in_three_chunks() {
    tokio::time::timeout(Duration::from_secs(60), async {
        let b = TestNode::start("kiosk-b", &["kiosk-a"]).await;
        grow(b.node.ledger(), 25);

        let (mut stream, reply) = raw_handshake(&b.address(), raw_info("kiosk-a", SECRET)).await;
        assert!(matches!(reply, Message::Accept { .. }));
        write_message(
            &mut stream,
            &Message::BlockchainSyncRequest {
                from_height: 0,
                timestamp: chrono::Utc::now().timestamp(),
            },
        )
        .await
        .unwrap();

        let assembler = SyncAssembler::new();
        let mut seen = Vec::new();
        let mut blocks = None;
        while blocks.is_none() {
            match read_message(&mut stream).await.unwrap() {
                Message::BlockchainSyncResponse(chunk) => {
                    assert_eq!((chunk.total_chunks, chunk.total_blocks), (3, 25));
                    seen.push((chunk.chunk_index, chunk.blocks.len()));
                    blocks = assembler.accept_chunk("kiosk-b", chunk);
                }
                Message::Ping { .. } => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, vec![(0, 10), (1, 10), (2, 5)]);

        let local = Ledger::in_memory(2).unwrap();
        let report = apply_session(&local, "kiosk-b", blocks.unwrap(), 3);
        assert_eq!(report.outcome.appended, 24);
        assert_eq!(local.height(), 25);
        assert_eq!(local.tip(), b.node.ledger().tip());

        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_lagging_node_catches_up_on_connect() {
    tokio::time::timeout(Duration::from_secs(60), async {
        let a = TestNode::start("kiosk-a", &["kiosk-b"]).await;
        let b = TestNode::start("kiosk-b", &["kiosk-a"]).await;
        grow(b.node.ledger(), 25);

        a.node.network().connect(&b.address()).await.unwrap();
        assert!(wait_until(LIMIT, || a.node.ledger().height() == 25).await);
        assert!(a.node.ledger().validate());
        assert_eq!(a.node.ledger().tip(), b.node.ledger().tip());
        let report = a.node.network_status().last_sync.unwrap();
        assert_eq!(report.peer_id, "kiosk-b");
        assert_eq!(report.height_after, 25);

        a.node.shutdown().await;
        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_mined_block_is_announced_to_peers() {
    tokio::time::timeout(Duration::from_secs(60), async {
        let a = TestNode::start("kiosk-a", &["kiosk-b"]).await;
        let b = TestNode::start("kiosk-b", &["kiosk-a"]).await;
        a.node.network().connect(&b.address()).await.unwrap();
        assert!(wait_until(LIMIT, || b.node.network().peers().contains("kiosk-a")).await);

        a.node.ledger().add_transaction(verification(1)).unwrap();
        let mined = a.node.mine_once().await.unwrap().unwrap();
        assert!(wait_until(LIMIT, || b.node.ledger().height() == 2).await);
        assert_eq!(b.node.ledger().tip().unwrap().hash, mined.block.hash);

        a.node.shutdown().await;
        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_token_transfer_round_trip() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let a = TestNode::start("kiosk-a", &["kiosk-b"]).await;
        let b = TestNode::start("kiosk-b", &["kiosk-a"]).await;
        a.node.network().connect(&b.address()).await.unwrap();
        assert!(wait_until(LIMIT, || b.node.network().peers().contains("kiosk-a")).await);

        let token = a
            .node
            .generate_token("display-1", &["display".to_string()])
            .unwrap();
        assert!(a.node.wallet().add_token(token.clone()));

        let transfer = a
            .node
            .request_transfer("kiosk-b", &[token.token_id.clone()])
            .await
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Completed);
        assert!(a.node.wallet().find_token(&token.token_id).is_none());
        assert_eq!(b.node.wallet().find_token(&token.token_id), Some(token));
        assert_eq!(b.node.wallet_status().completed_transfers, 1);
        assert!(b
            .node
            .ledger()
            .pending_transactions()
            .iter()
            .any(|tx| matches!(tx, Transaction::TokenTransfer(t) if t.transfer_id == transfer.transfer_id)));

        a.node.shutdown().await;
        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_rejected_transfer_restores_tokens() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let a = TestNode::start("kiosk-a", &["kiosk-b"]).await;
        let b = TestNode::start("kiosk-b", &["kiosk-a"]).await;
        a.node.network().connect(&b.address()).await.unwrap();
        assert!(wait_until(LIMIT, || b.node.network().peers().contains("kiosk-a")).await);

        // Signed by an issuer kiosk-b has never met.
        let foreign = TokenAuthority::new(
            "kiosk-x",
            TokenSigningKey::generate().unwrap(),
            Arc::new(Ledger::in_memory(2).unwrap()),
        )
        .issue("display-9", &[])
        .unwrap();
        a.node.wallet().add_token(foreign.clone());

        let err = a
            .node
            .request_transfer("kiosk-b", &[foreign.token_id.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, KioskError::Validation(_)));
        assert!(a.node.wallet().find_token(&foreign.token_id).is_some());
        assert_eq!(a.node.wallet_status().failed_transfers, 1);
        assert!(b.node.wallet().find_token(&foreign.token_id).is_none());

        // No peer serves this wallet.
        assert!(a
            .node
            .request_transfer("kiosk-z", &[foreign.token_id.clone()])
            .await
            .is_err());

        a.node.shutdown().await;
        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_security_event_gossip_is_deduplicated() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let a = TestNode::start("kiosk-a", &["kiosk-b", "kiosk-c"]).await;
        let b = TestNode::start("kiosk-b", &["kiosk-a", "kiosk-c"]).await;
        let c = TestNode::start("kiosk-c", &["kiosk-a", "kiosk-b"]).await;
        a.node.network().connect(&b.address()).await.unwrap();
        a.node.network().connect(&c.address()).await.unwrap();
        b.node.network().connect(&c.address()).await.unwrap();
        assert!(wait_until(LIMIT, || c.node.network().peers().len() == 2).await);

        let shared = a
            .node
            .share_security_event("intrusion_attempt", Severity::High, "enclosure opened")
            .unwrap();
        assert_eq!(shared.peers_notified, 2);

        for node in [&b, &c] {
            assert!(wait_until(LIMIT, || node.node.network_status().recent_events.len() == 1).await);
        }
        // Give relays time to arrive, then check nothing was recorded twice.
        tokio::time::sleep(Duration::from_millis(300)).await;
        for node in [&b, &c] {
            let events: Vec<_> = node
                .node
                .ledger()
                .pending_transactions()
                .into_iter()
                .filter(|tx| matches!(tx, Transaction::SecurityEvent(_)))
                .collect();
            assert_eq!(events.len(), 1);
            assert_eq!(node.node.network_status().recent_events[0], shared.event);
        }
        assert!(a.node.share_security_event("door_opened", Severity::Low, "").is_err());

        a.node.shutdown().await;
        b.node.shutdown().await;
        c.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_silent_peer_is_evicted() {
    tokio::time::timeout(Duration::from_secs(30), async {
        let b = TestNode::start_with("kiosk-b", &["kiosk-a"], |c| {
            c.network.heartbeat_interval_secs = 1;
        })
        .await;

        let (mut stream, reply) = raw_handshake(&b.address(), raw_info("kiosk-a", SECRET)).await;
        assert!(matches!(reply, Message::Accept { .. }));
        assert!(b.node.network().peers().contains("kiosk-a"));

        // Never answer the pings.
        assert!(wait_until(Duration::from_secs(15), || !b.node.network().peers().contains("kiosk-a")).await);
        let mut pinged = false;
        while let Ok(message) = read_message(&mut stream).await {
            pinged |= matches!(message, Message::Ping { .. });
        }
        assert!(pinged);

        b.node.shutdown().await;
    })
    .await
    .expect("test timed out");
}
