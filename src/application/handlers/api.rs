use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::application::services::trade_dispatcher::{ExecutionPolicy, ExecutionReport, TradeDispatcher};
use crate::auth::{require_auth, ApiKeys};
use crate::domain::entities::connection_status::ConnectionStatus;
use crate::domain::entities::decision::DecisionAudit;
use crate::domain::entities::execution::TradeExecution;
use crate::domain::entities::trade_request::{TradeRequest, TradeStatus};
use crate::domain::errors::{DispatchError, ErrorKind, ErrorSeverity, GatewayError, StoreError};
use crate::domain::repositories::trade_store::{ConnectionStatusStore, DecisionLog, TradeRequestStore};
use crate::rate_limit::{rate_limit_middleware, GlobalRateLimiter};

const MAX_BODY_BYTES: usize = 16 * 1024;
const MAX_DECISIONS: usize = 500;

/// Shared handles for the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<TradeDispatcher>,
    pub requests: Arc<dyn TradeRequestStore>,
    pub connections: Arc<dyn ConnectionStatusStore>,
    pub decisions: Arc<dyn DecisionLog>,
}

/// Error response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "ERR_NOT_FOUND", message)
    }

    fn status_for(kind: ErrorKind) -> StatusCode {
        match kind {
            ErrorKind::Connection | ErrorKind::PriceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::ConfirmationExpired => StatusCode::GONE,
            ErrorKind::ConfirmationReplayRejected => StatusCode::CONFLICT,
            ErrorKind::SafetyHalt => StatusCode::LOCKED,
            ErrorKind::BrokerRejectedOrder => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Notification => StatusCode::BAD_GATEWAY,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "API error: {}", self.message);
        }
        (
            self.status,
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::NotFound { .. } => Self::not_found(error.to_string()),
            StoreError::InvalidTransition { .. }
            | StoreError::StatusConflict { .. }
            | StoreError::DuplicateFill { .. } => {
                Self::new(StatusCode::CONFLICT, "ERR_CONFLICT", error.to_string())
            }
            _ => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Storage.error_code(),
                error.to_string(),
            ),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Store(e) | DispatchError::Gateway(GatewayError::Store(e)) => e.into(),
            DispatchError::Gateway(GatewayError::RequestNotFound { trade_id }) => {
                Self::not_found(format!("Trade request not found: {}", trade_id))
            }
            DispatchError::Gateway(
                e @ (GatewayError::DuplicateSubmission { .. } | GatewayError::NotApproved { .. }),
            ) => Self::new(StatusCode::CONFLICT, "ERR_CONFLICT", e.to_string()),
            other => {
                let kind = other.kind();
                if kind.severity() == ErrorSeverity::Critical {
                    tracing::error!(code = kind.error_code(), "Operator request failed: {}", other);
                }
                Self::new(Self::status_for(kind), kind.error_code(), other.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub execution_policy: ExecutionPolicy,
    pub pending_confirmations: usize,
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    pub account_mode: String,
    pub connected: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct PendingConfirmation {
    pub trade_id: String,
    pub summary: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TradeRequestDetail {
    pub request: TradeRequest,
    pub executions: Vec<TradeExecution>,
}

#[derive(Debug, Serialize)]
pub struct DecisionEntry {
    pub id: i64,
    #[serde(flatten)]
    pub audit: DecisionAudit,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// Build the API router. `/health` is public; everything else needs an API key.
pub fn router(state: ApiState, keys: Arc<ApiKeys>, limiter: GlobalRateLimiter) -> Router {
    let protected = Router::new()
        .route("/connections", get(list_connections))
        .route("/confirmations", get(list_pending_confirmations))
        .route("/trade-requests", get(list_trade_requests))
        .route("/trade-requests/:trade_id", get(get_trade_request))
        .route("/trade-requests/:trade_id/reject", post(reject_trade_request))
        .route("/trade-requests/:trade_id/archive", post(archive_trade_request))
        .route("/trade-requests/:trade_id/resubmit", post(resubmit_trade_request))
        .route("/approvals/:code", post(approve_by_code))
        .route("/decisions", get(list_decisions))
        .route_layer(middleware::from_fn_with_state(keys, require_auth));

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<ApiState>) -> ApiResult<HealthResponse> {
    let statuses = state.connections.list_connection_statuses().await?;
    let all_connected = !statuses.is_empty() && statuses.iter().all(|s| s.connected);

    Ok(Json(HealthResponse {
        status: if all_connected { "ok" } else { "degraded" },
        execution_policy: state.dispatcher.policy(),
        pending_confirmations: state.dispatcher.approvals().pending_count().await,
        connections: statuses
            .into_iter()
            .map(|s| ConnectionSummary {
                account_mode: s.account_mode.to_string(),
                connected: s.connected,
                last_checked: s.last_checked,
            })
            .collect(),
    }))
}

async fn list_connections(State(state): State<ApiState>) -> ApiResult<Vec<ConnectionStatus>> {
    Ok(Json(state.connections.list_connection_statuses().await?))
}

async fn list_pending_confirmations(State(state): State<ApiState>) -> Json<Vec<PendingConfirmation>> {
    let pending = state
        .dispatcher
        .approvals()
        .pending()
        .await
        .into_iter()
        .map(|record| PendingConfirmation {
            summary: record.details().summary(),
            trade_id: record.trade_id,
            requested_at: record.requested_at,
            expires_at: record.expires_at,
        })
        .collect();
    Json(pending)
}

async fn list_trade_requests(
    State(state): State<ApiState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Vec<TradeRequest>> {
    let status = match query.status.as_deref() {
        None => TradeStatus::Pending,
        Some(raw) => raw
            .parse::<TradeStatus>()
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, ErrorKind::Validation.error_code(), e))?,
    };
    Ok(Json(state.requests.list_by_status(status).await?))
}

async fn get_trade_request(
    State(state): State<ApiState>,
    Path(trade_id): Path<String>,
) -> ApiResult<TradeRequestDetail> {
    let request = state
        .requests
        .get_request(&trade_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Trade request not found: {}", trade_id)))?;
    let executions = state.requests.executions_for(&trade_id).await?;
    Ok(Json(TradeRequestDetail { request, executions }))
}

async fn reject_trade_request(
    State(state): State<ApiState>,
    Path(trade_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    if state.dispatcher.reject(&trade_id).await? {
        tracing::info!(trade_id = %trade_id, "Trade rejected via API");
        Ok(Json(json!({ "trade_id": trade_id, "status": TradeStatus::Rejected })))
    } else {
        Err(ApiError::new(
            StatusCode::CONFLICT,
            "ERR_CONFLICT",
            format!("No pending confirmation for {}", trade_id),
        ))
    }
}

async fn archive_trade_request(
    State(state): State<ApiState>,
    Path(trade_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.requests.archive(&trade_id).await?;
    Ok(Json(json!({ "trade_id": trade_id, "archived": true })))
}

async fn resubmit_trade_request(
    State(state): State<ApiState>,
    Path(trade_id): Path<String>,
) -> ApiResult<ExecutionReport> {
    Ok(Json(state.dispatcher.resubmit(&trade_id).await?))
}

async fn approve_by_code(
    State(state): State<ApiState>,
    Path(code): Path<String>,
) -> ApiResult<ExecutionReport> {
    match state.dispatcher.approve_by_code(&code).await? {
        Some(report) => Ok(Json(report)),
        None => {
            tracing::warn!("Approval attempted with an unknown or consumed code");
            Err(ApiError::not_found("No pending confirmation for that code"))
        }
    }
}

async fn list_decisions(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<DecisionEntry>> {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_DECISIONS);
    let entries = state
        .decisions
        .recent_decisions(limit)
        .await?
        .into_iter()
        .map(|(id, audit)| DecisionEntry { id, audit })
        .collect();
    Ok(Json(entries))
}
