//! HTTP admin API for a kiosk node
//!
//! JSON endpoints over the programmatic [`Node`] API, meant for the local
//! admin console and display engine.

use axum::{
    extract::{Path, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use crate::error::KioskError;
use crate::incentives::{StakeTier, TaskType};
use crate::node::Node;
use crate::token::Token;
use crate::transaction::Severity;

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Node(KioskError),
    InvalidInput(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Node(e) => {
                let status = match &e {
                    KioskError::Validation(_) => StatusCode::BAD_REQUEST,
                    KioskError::Consistency(_) => StatusCode::CONFLICT,
                    KioskError::Attestation(_) => StatusCode::FORBIDDEN,
                    KioskError::Network(_) => StatusCode::BAD_GATEWAY,
                    KioskError::Persistence(_)
                    | KioskError::Crypto(_)
                    | KioskError::Config(_)
                    | KioskError::Bind(_)
                    | KioskError::KeyMaterial(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<KioskError> for ApiError {
    fn from(err: KioskError) -> Self {
        ApiError::Node(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize, Deserialize)]
pub struct SuccessResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize)]
pub struct IssueTokenRequest {
    pub device_id: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct TokenValidation {
    pub valid: bool,
    pub token: Option<Token>,
    pub reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct SyncRequest {
    pub peer_id: String,
    pub from_height: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct ShareEventRequest {
    pub event_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
}

#[derive(Serialize, Deserialize)]
pub struct TransferRequest {
    pub recipient_wallet: String,
    pub token_ids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct StakeRequest {
    pub amount: f64,
    pub tier: StakeTier,
}

#[derive(Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    pub subject: String,
}

#[derive(Serialize, Deserialize)]
pub struct TaskResultRequest {
    pub correct: bool,
    pub confidence: f64,
}

// ============================================================================
// Middleware
// ============================================================================

async fn logging_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    if status.is_server_error() {
        warn!("{} {} -> {} ({:?})", method, path, status, started.elapsed());
    } else {
        debug!("{} {} -> {} ({:?})", method, path, status, started.elapsed());
    }
    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints
pub fn build_api_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/hardware", get(verify_hardware))
        .route("/tokens", post(issue_token))
        .route("/tokens/:id", get(validate_token))
        .route("/mining", get(get_mining_status))
        .route("/mining/start", post(start_mining))
        .route("/mining/stop", post(stop_mining))
        .route("/mining/once", post(mine_once))
        .route("/network", get(get_network_status))
        .route("/sync", post(request_sync))
        .route("/events", post(share_event))
        .route("/transfers", post(request_transfer))
        .route("/wallet", get(get_wallet_status))
        .route("/staking", post(stake))
        .route("/staking/unstake", post(unstake))
        .route("/tasks", post(create_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/results", post(submit_task_result))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(node);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the admin API on `addr` until `shutdown` resolves.
pub async fn run_api_server<F>(node: Arc<Node>, addr: SocketAddr, shutdown: F) -> Result<(), KioskError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_api_router(node);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| KioskError::Bind(format!("Admin API cannot listen on {}: {}", addr, e)))?;
    info!("Admin API listening on http://{}/api", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| KioskError::Network(format!("Admin API failed: {}", e)))
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check(State(node): State<Arc<Node>>) -> impl IntoResponse {
    let network = node.network_status();
    Json(serde_json::json!({
        "status": if network.running { "healthy" } else { "idle" },
        "peer_id": network.peer_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn get_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.status())
}

async fn verify_hardware(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.verify_hardware())
}

async fn issue_token(
    State(node): State<Arc<Node>>,
    Json(req): Json<IssueTokenRequest>,
) -> Result<(StatusCode, Json<Token>), ApiError> {
    if req.device_id.trim().is_empty() {
        return Err(ApiError::InvalidInput("device_id is required".to_string()));
    }
    let token = node.generate_token(&req.device_id, &req.permissions)?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn validate_token(State(node): State<Arc<Node>>, Path(token_id): Path<String>) -> impl IntoResponse {
    let validation = match node.validate_token(&token_id) {
        Ok(token) => TokenValidation {
            valid: true,
            token: Some(token),
            reason: None,
        },
        Err(e) => TokenValidation {
            valid: false,
            token: None,
            reason: Some(e.to_string()),
        },
    };
    Json(validation)
}

async fn get_mining_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.mining_status())
}

async fn start_mining(State(node): State<Arc<Node>>) -> Result<Json<SuccessResponse>, ApiError> {
    node.start_mining()?;
    Ok(Json(SuccessResponse {
        message: "Mining started".to_string(),
    }))
}

async fn stop_mining(State(node): State<Arc<Node>>) -> Result<Json<SuccessResponse>, ApiError> {
    node.stop_mining().await?;
    Ok(Json(SuccessResponse {
        message: "Mining stopped".to_string(),
    }))
}

async fn mine_once(State(node): State<Arc<Node>>) -> Result<Response, ApiError> {
    match node.mine_once().await? {
        Some(mined) => Ok(Json(mined).into_response()),
        None => Ok(Json(SuccessResponse {
            message: "Nothing to mine".to_string(),
        })
        .into_response()),
    }
}

async fn get_network_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.network_status())
}

async fn request_sync(
    State(node): State<Arc<Node>>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let from_height = req.from_height.unwrap_or_else(|| node.ledger().height());
    node.request_sync(&req.peer_id, from_height)?;
    Ok(Json(SuccessResponse {
        message: format!("Sync requested from {} at height {}", req.peer_id, from_height),
    }))
}

async fn share_event(
    State(node): State<Arc<Node>>,
    Json(req): Json<ShareEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let shared = node.share_security_event(&req.event_type, req.severity, &req.description)?;
    Ok(Json(shared))
}

async fn request_transfer(
    State(node): State<Arc<Node>>,
    Json(req): Json<TransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.token_ids.is_empty() {
        return Err(ApiError::InvalidInput("token_ids must not be empty".to_string()));
    }
    let transfer = node.request_transfer(&req.recipient_wallet, &req.token_ids).await?;
    Ok(Json(transfer))
}

async fn get_wallet_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.wallet_status())
}

async fn stake(
    State(node): State<Arc<Node>>,
    Json(req): Json<StakeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.stake(req.amount, req.tier)?))
}

async fn unstake(State(node): State<Arc<Node>>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(node.unstake()?))
}

async fn create_task(
    State(node): State<Arc<Node>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = node.create_verification_task(req.task_type, &req.subject)?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(State(node): State<Arc<Node>>, Path(task_id): Path<String>) -> impl IntoResponse {
    match node.task(&task_id) {
        Some(task) => (StatusCode::OK, Json(serde_json::to_value(task).unwrap_or_default())),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Unknown task {}", task_id) })),
        ),
    }
}

async fn submit_task_result(
    State(node): State<Arc<Node>>,
    Path(task_id): Path<String>,
    Json(req): Json<TaskResultRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reward = node.submit_task_result(&task_id, req.correct, req.confidence)?;
    Ok(Json(serde_json::json!({ "task_id": task_id, "reward": reward })))
}
