//! Database Models
//!
//! Row shapes for the control plane tables and their conversion into
//! domain entities. Conversion failures surface as `StoreError::Corrupt`.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::domain::entities::confirmation::ConfirmationRecord;
use crate::domain::entities::connection_status::ConnectionStatus;
use crate::domain::entities::decision::{DecisionAudit, ReasoningDecision, Stage};
use crate::domain::entities::execution::{BrokerOrderState, TradeExecution};
use crate::domain::entities::trade_request::{TradeDetails, TradeRequest};
use crate::domain::errors::StoreError;

fn corrupt(table: &str, key: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{} {}: {}", table, key, detail))
}

/// trade_requests row
#[derive(Debug, Clone, FromRow)]
pub struct TradeRequestRow {
    pub trade_id: String,
    pub approval_code: String,
    pub symbol: String,
    pub action: String,
    pub quantity: f64,
    pub order_type: String,
    pub limit_price: Option<f64>,
    pub account_mode: String,
    pub details_json: String,
    pub status: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub forecast_id: Option<i64>,
    pub archived: bool,
}

impl TryFrom<TradeRequestRow> for TradeRequest {
    type Error = StoreError;

    fn try_from(row: TradeRequestRow) -> Result<Self, Self::Error> {
        let details: TradeDetails = serde_json::from_str(&row.details_json)
            .map_err(|e| corrupt("trade_requests", &row.trade_id, e))?;
        let status = row
            .status
            .parse()
            .map_err(|e: String| corrupt("trade_requests", &row.trade_id, e))?;

        Ok(TradeRequest {
            trade_id: row.trade_id,
            approval_code: row.approval_code,
            details,
            status,
            requested_at: row.requested_at,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
            archived: row.archived,
        })
    }
}

/// trade_executions row
#[derive(Debug, Clone, FromRow)]
pub struct TradeExecutionRow {
    pub id: i64,
    pub trade_id: String,
    pub order_id: Option<String>,
    pub execution_price: Option<f64>,
    pub status: String,
    pub broker_response: Option<String>,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl TryFrom<TradeExecutionRow> for TradeExecution {
    type Error = StoreError;

    fn try_from(row: TradeExecutionRow) -> Result<Self, Self::Error> {
        let broker_response = row
            .broker_response
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("trade_executions", &row.id.to_string(), e))?;

        Ok(TradeExecution {
            id: row.id,
            trade_id: row.trade_id,
            order_id: row.order_id,
            execution_price: row.execution_price,
            status: BrokerOrderState::from_broker(&row.status),
            broker_response,
            error_message: row.error_message,
            attempted_at: row.attempted_at,
        })
    }
}

/// confirmations row
#[derive(Debug, Clone, FromRow)]
pub struct ConfirmationRow {
    pub trade_id: String,
    pub approval_code: String,
    pub details_json: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: String,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_via: Option<String>,
}

impl TryFrom<ConfirmationRow> for ConfirmationRecord {
    type Error = StoreError;

    fn try_from(row: ConfirmationRow) -> Result<Self, Self::Error> {
        let details: TradeDetails = serde_json::from_str(&row.details_json)
            .map_err(|e| corrupt("confirmations", &row.trade_id, e))?;
        let status = row
            .status
            .parse()
            .map_err(|e: String| corrupt("confirmations", &row.trade_id, e))?;
        let approved_via = row
            .approved_via
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: String| corrupt("confirmations", &row.trade_id, e))?;

        Ok(ConfirmationRecord::restore(
            row.trade_id,
            row.approval_code,
            details,
            row.requested_at,
            row.expires_at,
            status,
            row.approved_at,
            approved_via,
        ))
    }
}

/// connection_status row
#[derive(Debug, Clone, FromRow)]
pub struct ConnectionStatusRow {
    pub account_mode: String,
    pub connected: bool,
    pub host: String,
    pub port: i64,
    pub client_id: i64,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_connected: Option<DateTime<Utc>>,
    pub reconnect_attempts: i64,
    pub last_error: Option<String>,
}

impl TryFrom<ConnectionStatusRow> for ConnectionStatus {
    type Error = StoreError;

    fn try_from(row: ConnectionStatusRow) -> Result<Self, Self::Error> {
        let key = row.account_mode.clone();
        Ok(ConnectionStatus {
            account_mode: row
                .account_mode
                .parse()
                .map_err(|e: String| corrupt("connection_status", &key, e))?,
            connected: row.connected,
            host: row.host,
            port: u16::try_from(row.port).map_err(|e| corrupt("connection_status", &key, e))?,
            client_id: u32::try_from(row.client_id)
                .map_err(|e| corrupt("connection_status", &key, e))?,
            last_checked: row.last_checked,
            last_connected: row.last_connected,
            reconnect_attempts: u32::try_from(row.reconnect_attempts)
                .map_err(|e| corrupt("connection_status", &key, e))?,
            last_error: row.last_error,
        })
    }
}

/// decision_audit row
#[derive(Debug, Clone, FromRow)]
pub struct DecisionAuditRow {
    pub id: i64,
    pub symbol: String,
    pub account_mode: String,
    pub outcome: String,
    pub stage_reached: String,
    pub reason: Option<String>,
    pub forecast_json: Option<String>,
    pub reasoning_decision: Option<String>,
    pub confidence: Option<f64>,
    pub rationale: Option<String>,
    pub safety_issues_json: String,
    pub trade_id: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl TryFrom<DecisionAuditRow> for (i64, DecisionAudit) {
    type Error = StoreError;

    fn try_from(row: DecisionAuditRow) -> Result<Self, Self::Error> {
        let key = row.id.to_string();
        let stage_reached: Stage = serde_json::from_value(serde_json::Value::String(
            row.stage_reached.clone(),
        ))
        .map_err(|e| corrupt("decision_audit", &key, e))?;
        let forecast = row
            .forecast_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("decision_audit", &key, e))?;
        let reasoning_decision = row
            .reasoning_decision
            .as_deref()
            .map(str::parse::<ReasoningDecision>)
            .transpose()
            .map_err(|e| corrupt("decision_audit", &key, e))?;
        let safety_issues: Vec<String> = serde_json::from_str(&row.safety_issues_json)
            .map_err(|e| corrupt("decision_audit", &key, e))?;

        Ok((
            row.id,
            DecisionAudit {
                symbol: row.symbol,
                account_mode: row
                    .account_mode
                    .parse()
                    .map_err(|e: String| corrupt("decision_audit", &key, e))?,
                outcome_kind: row.outcome,
                stage_reached,
                reason: row.reason,
                forecast,
                reasoning_decision,
                confidence: row.confidence,
                rationale: row.rationale,
                safety_issues,
                trade_id: row.trade_id,
                decided_at: row.decided_at,
            },
        ))
    }
}
