//! # HTTP API
//!
//! The axum router devices and operators talk to.
//!
//! ## Endpoints
//!
//! | Method | Path                          | Description                        |
//! |--------|-------------------------------|------------------------------------|
//! | GET    | `/health`                     | Liveness probe                     |
//! | GET    | `/status`                     | Authority status summary           |
//! | POST   | `/v1/sync/open`               | Open a device sync session         |
//! | POST   | `/v1/sync/exchange`           | Submit a batch, receive outcomes   |
//! | GET    | `/v1/wallets/:id`             | Wallet state                       |
//! | GET    | `/v1/wallets/:id/history`     | Accepted transactions, in order    |
//! | GET    | `/v1/transactions/:key`       | Stored outcome for a key           |
//!
//! Provisioning has no HTTP endpoint; use the `provision` subcommand.

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use harvest_protocol::ledger::{AuthorityError, DecisionRecord, LedgerEntry};
use harvest_protocol::sync::http::{EXCHANGE_PATH, OPEN_PATH};
use harvest_protocol::sync::{
    ErrorBody, ExchangeRequest, ExchangeResponse, ServiceError, SessionOpenRequest,
    SessionOpenResponse, SyncService,
};
use harvest_protocol::transaction::{IdempotencyKey, TransactionKind, WalletId};
use harvest_protocol::wallet::{Wallet, WalletStatus};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub service: Arc<SyncService>,
    pub metrics: SharedMetrics,
    pub started_at: DateTime<Utc>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route(OPEN_PATH, post(open_handler))
        .route(EXCHANGE_PATH, post(exchange_handler))
        .route("/v1/wallets/:id", get(wallet_handler))
        .route("/v1/wallets/:id/history", get(history_handler))
        .route("/v1/transactions/:key", get(transaction_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Every failure a handler can return, rendered as [`ErrorBody`].
#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

impl From<AuthorityError> for ApiError {
    fn from(err: AuthorityError) -> Self {
        ApiError::Service(ServiceError::Authority(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, retryable) = match self {
            ApiError::Service(e) => {
                let status = match &e {
                    ServiceError::UnsupportedProtocol { .. }
                    | ServiceError::WalletMismatch { .. }
                    | ServiceError::BatchTooLarge { .. } => StatusCode::BAD_REQUEST,
                    ServiceError::UnknownWallet(_) => StatusCode::NOT_FOUND,
                    ServiceError::UnknownSession(_) => StatusCode::CONFLICT,
                    ServiceError::Authority(AuthorityError::Contention(_))
                    | ServiceError::Authority(AuthorityError::Db(_)) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    ServiceError::Authority(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    tracing::error!(error = %e, "request failed");
                }
                (status, e.to_string(), e.is_retryable())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, false),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, false),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg, true)
            }
        };
        (status, Json(ErrorBody { error, retryable })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub protocol: String,
    pub wallets: usize,
    pub decisions: usize,
    pub open_sessions: usize,
    pub uptime_seconds: i64,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletResponse {
    pub id: WalletId,
    pub owner: String,
    pub credit_limit: u64,
    pub spent: u64,
    pub balance: u64,
    pub status: WalletStatus,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<Wallet> for WalletResponse {
    fn from(w: Wallet) -> Self {
        Self {
            balance: w.balance(),
            id: w.id,
            owner: w.owner,
            credit_limit: w.credit_limit,
            spent: w.spent,
            status: w.status,
            revision: w.revision,
            updated_at: w.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntryResponse {
    pub revision: u64,
    pub key: IdempotencyKey,
    pub kind: TransactionKind,
    pub amount: u64,
    pub spent_after: u64,
    pub applied_at: DateTime<Utc>,
    pub hash: String,
}

impl From<LedgerEntry> for HistoryEntryResponse {
    fn from(e: LedgerEntry) -> Self {
        Self {
            hash: e.hash_hex(),
            revision: e.revision,
            key: e.transaction.key,
            kind: e.transaction.kind,
            amount: e.transaction.amount,
            spent_after: e.spent_after,
            applied_at: e.applied_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`. Does not touch the store.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db = state.service.authority().db();
    let wallets = db.wallet_count();
    state.metrics.wallets_provisioned.set(wallets as i64);
    let now = Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        protocol: harvest_protocol::config::PROTOCOL_VERSION.to_string(),
        wallets,
        decisions: db.decision_count(),
        open_sessions: state.service.open_sessions(),
        uptime_seconds: (now - state.started_at).num_seconds(),
        timestamp: now.to_rfc3339(),
    })
}

/// `POST /v1/sync/open`.
async fn open_handler(
    State(state): State<AppState>,
    Json(req): Json<SessionOpenRequest>,
) -> Result<Json<SessionOpenResponse>, ApiError> {
    let service = state.service.clone();
    let resp = tokio::task::spawn_blocking(move || service.open(req))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    state.metrics.sessions_opened_total.inc();
    Ok(Json(resp))
}

/// `POST /v1/sync/exchange`. Sled writes and the per-wallet lock block,
/// so the batch is decided on the blocking pool.
async fn exchange_handler(
    State(state): State<AppState>,
    Json(req): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    let service = state.service.clone();
    let started = Instant::now();
    let resp = tokio::task::spawn_blocking(move || service.exchange(req))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    state
        .metrics
        .submit_latency_seconds
        .observe(started.elapsed().as_secs_f64());

    for result in &resp.results {
        if result.replayed {
            state.metrics.duplicate_replays_total.inc();
        } else if result.outcome.is_accepted() {
            state.metrics.submissions_accepted_total.inc();
        } else {
            state.metrics.submissions_rejected_total.inc();
        }
    }
    Ok(Json(resp))
}

fn parse_wallet_id(raw: &str) -> Result<WalletId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid wallet id: {raw}")))
}

/// `GET /v1/wallets/:id`.
async fn wallet_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<WalletResponse>, ApiError> {
    let id = parse_wallet_id(&id)?;
    match state.service.authority().wallet(&id)? {
        Some(wallet) => Ok(Json(wallet.into())),
        None => Err(ApiError::NotFound(format!("wallet not found: {id}"))),
    }
}

/// `GET /v1/wallets/:id/history`.
async fn history_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Vec<HistoryEntryResponse>>, ApiError> {
    let id = parse_wallet_id(&id)?;
    let authority = state.service.authority();
    if authority.wallet(&id)?.is_none() {
        return Err(ApiError::NotFound(format!("wallet not found: {id}")));
    }
    let entries = authority.history(&id)?;
    Ok(Json(entries.into_iter().map(Into::into).collect()))
}

/// `GET /v1/transactions/:key`.
async fn transaction_handler(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<DecisionRecord>, ApiError> {
    let parsed: IdempotencyKey = key
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid idempotency key: {key}")))?;
    match state.service.authority().outcome(&parsed)? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::NotFound(format!("no decision for {parsed}"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use harvest_protocol::device::SyncCursor;
    use harvest_protocol::ledger::WalletLedgerAuthority;
    use harvest_protocol::transaction::{DeviceId, Transaction, TransactionBuilder};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let authority = Arc::new(WalletLedgerAuthority::open_temporary().expect("temp authority"));
        AppState {
            version: "0.1.0-test".into(),
            service: Arc::new(SyncService::new(authority)),
            metrics: Arc::new(crate::metrics::NodeMetrics::new().unwrap()),
            started_at: Utc::now(),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn post_json<T: Serialize>(router: &Router, path: &str, body: &T) -> (StatusCode, Vec<u8>) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, body)
    }

    async fn open(router: &Router, wallet: WalletId) -> SessionOpenResponse {
        let (status, body) = post_json(
            router,
            OPEN_PATH,
            &SessionOpenRequest::new(DeviceId::new("phone-1"), wallet, SyncCursor::default()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    async fn exchange(
        router: &Router,
        session: &SessionOpenResponse,
        txs: Vec<Transaction>,
    ) -> ExchangeResponse {
        let req = ExchangeRequest {
            session_id: session.session_id,
            device_id: DeviceId::new("phone-1"),
            wallet_id: session.snapshot.wallet_id,
            cursor: SyncCursor::default(),
            transactions: txs,
        };
        let (status, body) = post_json(router, EXCHANGE_PATH, &req).await;
        assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
        serde_json::from_slice(&body).unwrap()
    }

    // -- 1. Liveness and status ---------------------------------------------

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_state());
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_counts_wallets_and_decisions() {
        let state = test_state();
        let authority = state.service.authority().clone();
        let w = authority.provision_wallet("m", 10).unwrap();
        authority
            .submit(&TransactionBuilder::new(w.id, TransactionKind::Debit, 1).build())
            .unwrap();
        let router = create_router(state);

        let (status, body) = get(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.wallets, 1);
        assert_eq!(resp.decisions, 1);
        assert_eq!(resp.version, "0.1.0-test");
    }

    // -- 2. Sync round trip -------------------------------------------------

    #[tokio::test]
    async fn sync_round_trip_over_http_handlers() {
        let state = test_state();
        let metrics = state.metrics.clone();
        let wallet = state.service.authority().provision_wallet("m", 100).unwrap();
        let router = create_router(state);

        let session = open(&router, wallet.id).await;
        assert_eq!(session.snapshot.balance, 100);

        let tx = TransactionBuilder::new(wallet.id, TransactionKind::Debit, 20).build();
        let first = exchange(&router, &session, vec![tx.clone()]).await;
        assert!(first.results[0].outcome.is_accepted());
        assert_eq!(first.snapshot.spent, 20);

        // Retry of the same key: same outcome, no second debit.
        let again = exchange(&router, &session, vec![tx.clone()]).await;
        assert!(again.results[0].replayed);
        assert_eq!(again.results[0].outcome, first.results[0].outcome);
        assert_eq!(again.snapshot.spent, 20);

        assert_eq!(metrics.sessions_opened_total.get(), 1);
        assert_eq!(metrics.submissions_accepted_total.get(), 1);
        assert_eq!(metrics.duplicate_replays_total.get(), 1);

        let (status, body) = get(&router, &format!("/v1/transactions/{}", tx.key)).await;
        assert_eq!(status, StatusCode::OK);
        let record: DecisionRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(record.wallet_id, wallet.id);
    }

    #[tokio::test]
    async fn exchange_with_unknown_session_is_retryable_conflict() {
        let state = test_state();
        let wallet = state.service.authority().provision_wallet("m", 100).unwrap();
        let router = create_router(state);
        let req = ExchangeRequest {
            session_id: uuid_like(),
            device_id: DeviceId::new("phone-1"),
            wallet_id: wallet.id,
            cursor: SyncCursor::default(),
            transactions: vec![],
        };
        let (status, body) = post_json(&router, EXCHANGE_PATH, &req).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(err.retryable);
    }

    fn uuid_like() -> harvest_protocol::sync::SessionId {
        harvest_protocol::sync::SessionId::nil()
    }

    #[tokio::test]
    async fn oversized_exchange_is_400() {
        let state = test_state();
        let wallet = state.service.authority().provision_wallet("m", 10_000).unwrap();
        let router = create_router(state);
        let session = open(&router, wallet.id).await;
        let req = ExchangeRequest {
            session_id: session.session_id,
            device_id: DeviceId::new("phone-1"),
            wallet_id: wallet.id,
            cursor: SyncCursor::default(),
            transactions: (0..=harvest_protocol::config::MAX_EXCHANGE_BATCH)
                .map(|_| TransactionBuilder::new(wallet.id, TransactionKind::Debit, 1).build())
                .collect(),
        };
        let (status, body) = post_json(&router, EXCHANGE_PATH, &req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn open_for_unknown_wallet_is_404() {
        let router = create_router(test_state());
        let (status, body) = post_json(
            &router,
            OPEN_PATH,
            &SessionOpenRequest::new(DeviceId::new("d"), WalletId::new(), SyncCursor::default()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ErrorBody = serde_json::from_slice(&body).unwrap();
        assert!(!err.retryable);
    }

    // -- 3. Read API --------------------------------------------------------

    #[tokio::test]
    async fn wallet_and_history_endpoints() {
        let state = test_state();
        let authority = state.service.authority().clone();
        let w = authority.provision_wallet("member-7", 100).unwrap();
        for amount in [10, 15] {
            authority
                .submit(&TransactionBuilder::new(w.id, TransactionKind::Debit, amount).build())
                .unwrap();
        }
        let router = create_router(state);

        let (status, body) = get(&router, &format!("/v1/wallets/{}", w.id)).await;
        assert_eq!(status, StatusCode::OK);
        let wallet: WalletResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(wallet.owner, "member-7");
        assert_eq!(wallet.spent, 25);
        assert_eq!(wallet.balance, 75);
        assert_eq!(wallet.revision, 2);

        let (status, body) = get(&router, &format!("/v1/wallets/{}/history", w.id)).await;
        assert_eq!(status, StatusCode::OK);
        let history: Vec<HistoryEntryResponse> = serde_json::from_slice(&body).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].revision, 1);
        assert_eq!(history[1].spent_after, 25);
        assert_eq!(history[1].hash.len(), 64);
    }

    #[tokio::test]
    async fn read_endpoints_validate_ids() {
        let router = create_router(test_state());
        let (status, _) = get(&router, "/v1/wallets/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&router, &format!("/v1/wallets/{}", WalletId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&router, &format!("/v1/wallets/{}/history", WalletId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&router, &format!("/v1/transactions/{}", IdempotencyKey::generate())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
