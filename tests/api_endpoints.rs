//! Integration tests for the admin API endpoints
//!
//! Each test opens a node on a throwaway data dir and drives the router
//! through an in-process test server.

mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::StaticProbe;
use kioskmesh::api::build_api_router;
use kioskmesh::attestation::HardwareAttestor;
use kioskmesh::node::Node;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

fn open_node(dir: &TempDir, probe: StaticProbe) -> Arc<Node> {
    let config = common::config("kiosk-lobby", &["kiosk-b"], dir);
    Node::open(config, HardwareAttestor::new(Box::new(probe))).expect("Failed to open node")
}

fn fund(node: &Node, amount: f64) {
    let wallet_id = node.wallet().wallet_id();
    let token = node
        .authority()
        .issue_reward(&wallet_id, amount, 0)
        .expect("Failed to issue funds");
    node.wallet().add_token(token);
}

fn server(node: Arc<Node>) -> TestServer {
    TestServer::new(build_api_router(node)).expect("Failed to create test server")
}

#[tokio::test]
async fn test_status_endpoints() {
    let dir = TempDir::new().unwrap();
    let server = server(open_node(&dir, StaticProbe::kiosk()));

    let response = server.get("/api/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["peer_id"], "kiosk-lobby");
    assert!(json["timestamp"].is_string());

    let response = server.get("/api/status").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["blockchain_height"], 1);
    assert_eq!(json["chain_valid"], true);
    assert_eq!(json["wallet_id"], "kiosk-lobby");
    assert!(json["mining"]["is_mining"].is_boolean());

    let response = server.get("/api/hardware").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["eligible"], true);
    assert_eq!(json["anti_spoofing_passed"], true);
    assert!(json["checks"].as_array().unwrap().len() >= 5);

    let response = server.get("/api/network").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["peer_count"], 0);
    assert_eq!(json["running"], false);
}

#[tokio::test]
async fn test_token_issue_and_validate() {
    let dir = TempDir::new().unwrap();
    let server = server(open_node(&dir, StaticProbe::kiosk()));

    let response = server
        .post("/api/tokens")
        .json(&json!({ "device_id": "display-7", "permissions": ["display", "audio"] }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let token: Value = response.json();
    assert_eq!(token["device_id"], "display-7");
    let token_id = token["token_id"].as_str().unwrap().to_string();

    let response = server.get(&format!("/api/tokens/{}", token_id)).await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["valid"], true);
    assert_eq!(json["token"]["token_id"], token_id.as_str());

    let response = server.get("/api/tokens/no-such-token").await;
    let json: Value = response.json();
    assert_eq!(json["valid"], false);
    assert!(json["reason"].as_str().unwrap().contains("Unknown token"));

    let response = server
        .post("/api/tokens")
        .json(&json!({ "device_id": "  " }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let json: Value = response.json();
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_mine_once_credits_wallet() {
    let dir = TempDir::new().unwrap();
    let server = server(open_node(&dir, StaticProbe::kiosk()));

    let response = server.post("/api/mining/once").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["message"], "Nothing to mine");

    server
        .post("/api/tokens")
        .json(&json!({ "device_id": "display-1" }))
        .await;
    let response = server.post("/api/mining/once").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["block"]["index"], 1);
    assert!(json["reward"]["total"].as_f64().unwrap() > 0.0);

    let response = server.get("/api/wallet").await;
    let wallet: Value = response.json();
    assert_eq!(wallet["token_count"], 1);
    assert!(wallet["balance"].as_f64().unwrap() > 0.0);

    let response = server.get("/api/mining").await;
    let json: Value = response.json();
    assert_eq!(json["blocks_mined"], 1);
    assert_eq!(json["is_mining"], false);
}

#[tokio::test]
async fn test_virtual_machine_cannot_mine() {
    let dir = TempDir::new().unwrap();
    let node = open_node(&dir, StaticProbe::virtual_machine());
    let server = server(Arc::clone(&node));

    let response = server.get("/api/hardware").await;
    let json: Value = response.json();
    assert_eq!(json["eligible"], false);

    let response = server.post("/api/mining/start").await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);
    let response = server.post("/api/mining/once").await;
    assert_eq!(response.status_code(), StatusCode::FORBIDDEN);

    // Staking stays open to ineligible hardware once the wallet holds funds.
    let response = server
        .post("/api/staking")
        .json(&json!({ "amount": 50.0, "tier": "verifier" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    fund(&node, 60.0);
    let response = server
        .post("/api/staking")
        .json(&json!({ "amount": 50.0, "tier": "verifier" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let wallet: Value = server.get("/api/wallet").await.json();
    assert_eq!(wallet["staked_balance"], 60.0);
}

#[tokio::test]
async fn test_event_sharing_respects_allowlist() {
    let dir = TempDir::new().unwrap();
    let server = server(open_node(&dir, StaticProbe::kiosk()));

    let response = server
        .post("/api/events")
        .json(&json!({
            "event_type": "malware_detected",
            "severity": "critical",
            "description": "unsigned binary in /opt/kiosk"
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["peers_notified"], 0);
    assert_eq!(json["event"]["source_peer"], "kiosk-lobby");

    let response = server
        .post("/api/events")
        .json(&json!({ "event_type": "screen_touched", "severity": "low" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server.get("/api/network").await;
    let json: Value = response.json();
    assert_eq!(json["recent_events"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_transfer_and_sync_need_a_connected_peer() {
    let dir = TempDir::new().unwrap();
    let server = server(open_node(&dir, StaticProbe::kiosk()));

    let response = server
        .post("/api/transfers")
        .json(&json!({ "recipient_wallet": "kiosk-b", "token_ids": [] }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .post("/api/transfers")
        .json(&json!({ "recipient_wallet": "kiosk-b", "token_ids": ["t-1"] }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);

    let response = server
        .post("/api/sync")
        .json(&json!({ "peer_id": "kiosk-b" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_staking_and_tasks() {
    let dir = TempDir::new().unwrap();
    let node = open_node(&dir, StaticProbe::kiosk());
    fund(&node, 100.0);
    let server = server(Arc::clone(&node));

    let response = server
        .post("/api/tasks")
        .json(&json!({ "task_type": "peer_audit", "subject": "kiosk-b" }))
        .await;
    assert!(response.status_code().is_client_error());

    let response = server
        .post("/api/staking")
        .json(&json!({ "amount": 10.0, "tier": "validator" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .post("/api/staking")
        .json(&json!({ "amount": 100.0, "tier": "validator" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert_eq!(json["wallet_id"], "kiosk-lobby");

    let response = server
        .post("/api/tasks")
        .json(&json!({ "task_type": "security_alert_validation", "subject": "event-3" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let task: Value = response.json();
    assert_eq!(task["assigned_to"], json!(["kiosk-lobby"]));
    let task_id = task["task_id"].as_str().unwrap();

    let response = server
        .post(&format!("/api/tasks/{}/results", task_id))
        .json(&json!({ "correct": true, "confidence": 0.5 }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let json: Value = response.json();
    assert!((json["reward"].as_f64().unwrap() - 1.0).abs() < 1e-9);

    let task: Value = server.get(&format!("/api/tasks/{}", task_id)).await.json();
    assert_eq!(task["status"], "completed");
    let wallet: Value = server.get("/api/wallet").await.json();
    assert!((wallet["balance"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    assert_eq!(wallet["staked_balance"], 100.0);

    let response = server.post("/api/staking/unstake").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let wallet: Value = server.get("/api/wallet").await.json();
    assert_eq!(wallet["staked_balance"], 0.0);
    assert!(wallet["balance"].as_f64().unwrap() >= 101.0);

    let response = server.get("/api/tasks/no-such-task").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
