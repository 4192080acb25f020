//! Control API
//!
//! - GET  /health                     - liveness, uptime
//! - GET  /metrics                    - Prometheus metrics
//! - GET  /api/tx-hashes              - all records keyed by event id
//! - GET  /api/tx-hashes/{eventId}    - one record
//! - POST /api/process-deposit        - relay a source-chain deposit tx
//! - POST /api/process-withdrawal     - relay a destination-chain burn tx
//! - GET  /api/stuck                  - records waiting for reconciliation
//! - POST /api/reconcile              - resolve a stuck record
//!
//! No authentication: bind it inside a trusted network only.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::{ErrorClass, RelayEngine, RelayError, RelayOutcome};
use crate::types::{parse_hash32, Direction, ProcessedRecord};

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<RelayEngine>) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since start
    pub uptime: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProcessRequest {
    pub tx_hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReconcileRequest {
    pub event_id: String,
    pub destination_tx_hash: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    class: Option<&'static str>,
    retryable: bool,
    needs_reconciliation: bool,
}

/// Error response; the status comes from the engine's classification
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    class: Option<ErrorClass>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            class: Some(ErrorClass::InputInvalid),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            class: Some(ErrorClass::Internal),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            class: Some(ErrorClass::NotFound),
        }
    }
}

fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::InputInvalid | ErrorClass::ChainSemantic => StatusCode::BAD_REQUEST,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Conflict => StatusCode::CONFLICT,
        ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::PostCommit | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        let class = e.class();
        Self {
            status: status_for(class),
            message: e.to_string(),
            class: Some(class),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("invalid request body: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            class: self.class.map(|c| c.as_str()),
            retryable: matches!(
                self.class,
                Some(ErrorClass::ChainSemantic | ErrorClass::Transient)
            ),
            needs_reconciliation: self.class == Some(ErrorClass::PostCommit),
        };
        (self.status, Json(body)).into_response()
    }
}

fn parse_hash_field(field: &str, raw: &str) -> Result<alloy::primitives::B256, ApiError> {
    parse_hash32(raw.trim()).map_err(|e| ApiError::bad_request(format!("{}: {}", field, e)))
}

/// Health check endpoint handler
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
    })
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn list_tx_hashes(State(state): State<AppState>) -> Json<BTreeMap<String, ProcessedRecord>> {
    Json(state.engine.store().records().await)
}

async fn get_tx_hashes(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<ProcessedRecord>, ApiError> {
    let id = parse_hash_field("eventId", &event_id)?;
    state
        .engine
        .store()
        .get_tx_hashes(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no record for event {}", event_id)))
}

async fn process(
    state: &AppState,
    direction: Direction,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<RelayOutcome>, ApiError> {
    let Json(request) = payload?;
    let tx_hash = parse_hash_field("txHash", &request.tx_hash)?;
    info!(%direction, %tx_hash, "Processing request received");

    // Run the relay on its own task so a client disconnect cannot cancel it
    // between the processed mark and the destination record
    let engine = state.engine.clone();
    let relay = tokio::spawn(async move { engine.process(direction, tx_hash, None).await });

    match relay.await {
        Ok(Ok(outcome)) => Ok(Json(outcome)),
        Ok(Err(e)) => {
            warn!(%direction, %tx_hash, class = e.class().as_str(), error = %e, "Processing request failed");
            Err(e.into())
        }
        Err(e) => {
            error!(%direction, %tx_hash, error = %e, "Relay task panicked");
            Err(ApiError::internal(format!("relay task failed: {}", e)))
        }
    }
}

async fn process_deposit(
    State(state): State<AppState>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<RelayOutcome>, ApiError> {
    process(&state, Direction::Deposit, payload).await
}

async fn process_withdrawal(
    State(state): State<AppState>,
    payload: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<RelayOutcome>, ApiError> {
    process(&state, Direction::Burn, payload).await
}

async fn list_stuck(State(state): State<AppState>) -> Json<Vec<ProcessedRecord>> {
    Json(state.engine.store().stuck_records().await)
}

async fn reconcile(
    State(state): State<AppState>,
    payload: Result<Json<ReconcileRequest>, JsonRejection>,
) -> Result<Json<ProcessedRecord>, ApiError> {
    let Json(request) = payload?;
    let event_id = parse_hash_field("eventId", &request.event_id)?;
    let destination_tx_hash = parse_hash_field("destinationTxHash", &request.destination_tx_hash)?;

    let record = state.engine.reconcile(event_id, destination_tx_hash).await?;
    Ok(Json(record))
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/tx-hashes", get(list_tx_hashes))
        .route("/api/tx-hashes/{event_id}", get(get_tx_hashes))
        .route("/api/process-deposit", post(process_deposit))
        .route("/api/process-withdrawal", post(process_withdrawal))
        .route("/api/stuck", get(list_stuck))
        .route("/api/reconcile", post(reconcile))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` flips to true.
///
/// In-flight requests are drained before this returns.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            info!("API server shutting down");
        })
        .await?;
    Ok(())
}

/// Start the API server
pub async fn start_api_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    info!("  /health           - Health check");
    info!("  /metrics          - Prometheus metrics");
    info!("  /api/tx-hashes    - Processed records");
    info!("  /api/stuck        - Records needing reconciliation");
    serve(listener, state, shutdown).await
}
