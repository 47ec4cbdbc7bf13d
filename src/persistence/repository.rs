//! Database Repository
//!
//! `SqliteStore` implements the persistence ports on top of a sqlx pool.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, warn};

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::confirmation::{ConfirmationRecord, ConfirmationStatus};
use crate::domain::entities::connection_status::ConnectionStatus;
use crate::domain::entities::decision::DecisionAudit;
use crate::domain::entities::execution::{BrokerOrderState, NewTradeExecution, TradeExecution};
use crate::domain::entities::trade_request::{TradeRequest, TradeStatus};
use crate::domain::errors::StoreError;
use crate::domain::repositories::trade_store::{
    ConnectionStatusStore, DecisionLog, StoreResult, TradeRequestStore,
};

fn query_error(context: &str, e: sqlx::Error) -> StoreError {
    error!("{}: {}", context, e);
    DatabaseError::QueryError(format!("{}: {}", context, e)).into()
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

/// SQLite-backed store for every persistence port
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn current_status(&self, trade_id: &str) -> StoreResult<Option<TradeStatus>> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM trade_requests WHERE trade_id = ?1")
                .bind(trade_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| query_error("Failed to read trade status", e))?;

        status
            .map(|(s,)| s.parse().map_err(StoreError::Corrupt))
            .transpose()
    }
}

#[async_trait]
impl TradeRequestStore for SqliteStore {
    async fn create_request(&self, request: &TradeRequest) -> StoreResult<()> {
        let details = &request.details;
        sqlx::query(
            r#"
            INSERT INTO trade_requests (
                trade_id, approval_code, symbol, action, quantity, order_type,
                limit_price, account_mode, details_json, status,
                requested_at, expires_at, updated_at, forecast_id, archived
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&request.trade_id)
        .bind(&request.approval_code)
        .bind(&details.symbol)
        .bind(details.action.to_string())
        .bind(details.quantity)
        .bind(details.order_type.to_string())
        .bind(details.limit_price)
        .bind(details.account_mode.name())
        .bind(to_json(details)?)
        .bind(request.status.as_str())
        .bind(request.requested_at)
        .bind(request.expires_at)
        .bind(request.updated_at)
        .bind(request.forecast_id())
        .bind(request.archived)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to create trade request", e))?;

        debug!("Created trade request {} ({})", request.trade_id, request.status);
        Ok(())
    }

    async fn get_request(&self, trade_id: &str) -> StoreResult<Option<TradeRequest>> {
        let row = sqlx::query_as::<_, TradeRequestRow>(
            "SELECT * FROM trade_requests WHERE trade_id = ?1",
        )
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get trade request", e))?;

        row.map(TradeRequest::try_from).transpose()
    }

    async fn find_by_approval_code(&self, approval_code: &str) -> StoreResult<Option<TradeRequest>> {
        let row = sqlx::query_as::<_, TradeRequestRow>(
            "SELECT * FROM trade_requests WHERE approval_code = ?1 ORDER BY requested_at DESC LIMIT 1",
        )
        .bind(approval_code.trim().to_uppercase())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("Failed to find trade request by code", e))?;

        row.map(TradeRequest::try_from).transpose()
    }

    async fn transition(&self, trade_id: &str, from: TradeStatus, to: TradeStatus) -> StoreResult<()> {
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                trade_id: trade_id.to_string(),
                from,
                to,
            });
        }

        let rows_affected = sqlx::query(
            "UPDATE trade_requests SET status = ?1, updated_at = ?2 WHERE trade_id = ?3 AND status = ?4",
        )
        .bind(to.as_str())
        .bind(Utc::now())
        .bind(trade_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to update trade status", e))?
        .rows_affected();

        if rows_affected == 1 {
            debug!("Trade {} moved {} -> {}", trade_id, from, to);
            return Ok(());
        }

        match self.current_status(trade_id).await? {
            None => Err(StoreError::NotFound {
                entity: "trade request",
                id: trade_id.to_string(),
            }),
            Some(actual) => Err(StoreError::StatusConflict {
                trade_id: trade_id.to_string(),
                expected: from,
                actual,
            }),
        }
    }

    async fn list_by_status(&self, status: TradeStatus) -> StoreResult<Vec<TradeRequest>> {
        let rows = sqlx::query_as::<_, TradeRequestRow>(
            "SELECT * FROM trade_requests WHERE status = ?1 AND archived = 0 ORDER BY requested_at ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to list trade requests", e))?;

        rows.into_iter().map(TradeRequest::try_from).collect()
    }

    async fn archive(&self, trade_id: &str) -> StoreResult<()> {
        let rows_affected = sqlx::query(
            "UPDATE trade_requests SET archived = 1, updated_at = ?1 WHERE trade_id = ?2",
        )
        .bind(Utc::now())
        .bind(trade_id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to archive trade request", e))?
        .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::NotFound {
                entity: "trade request",
                id: trade_id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_execution(&self, execution: &NewTradeExecution) -> StoreResult<i64> {
        let broker_response = execution.broker_response.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO trade_executions (
                trade_id, order_id, execution_price, status,
                broker_response, error_message, attempted_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&execution.trade_id)
        .bind(&execution.order_id)
        .bind(execution.execution_price)
        .bind(execution.status.as_str())
        .bind(broker_response)
        .bind(&execution.error_message)
        .bind(execution.attempted_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                debug!(
                    "Recorded {} execution for {}",
                    execution.status, execution.trade_id
                );
                Ok(done.last_insert_rowid())
            }
            Err(e) if execution.status == BrokerOrderState::Filled && is_unique_violation(&e) => {
                warn!("Second fill rejected for trade {}", execution.trade_id);
                Err(StoreError::DuplicateFill {
                    trade_id: execution.trade_id.clone(),
                })
            }
            Err(e) => Err(query_error("Failed to record execution", e)),
        }
    }

    async fn executions_for(&self, trade_id: &str) -> StoreResult<Vec<TradeExecution>> {
        let rows = sqlx::query_as::<_, TradeExecutionRow>(
            "SELECT * FROM trade_executions WHERE trade_id = ?1 ORDER BY id ASC",
        )
        .bind(trade_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to list executions", e))?;

        rows.into_iter().map(TradeExecution::try_from).collect()
    }

    async fn save_confirmation(&self, record: &ConfirmationRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO confirmations (
                trade_id, approval_code, details_json, requested_at,
                expires_at, status, approved_at, approved_via
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(trade_id) DO UPDATE SET
                status = excluded.status,
                approved_at = excluded.approved_at,
                approved_via = excluded.approved_via
            "#,
        )
        .bind(&record.trade_id)
        .bind(&record.approval_code)
        .bind(to_json(record.details())?)
        .bind(record.requested_at)
        .bind(record.expires_at)
        .bind(record.status().as_str())
        .bind(record.approved_at())
        .bind(record.approved_via().map(|v| v.as_str()))
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to save confirmation", e))?;

        Ok(())
    }

    async fn load_pending_confirmations(&self) -> StoreResult<Vec<ConfirmationRecord>> {
        let rows = sqlx::query_as::<_, ConfirmationRow>(
            "SELECT * FROM confirmations WHERE status = ?1 ORDER BY requested_at ASC",
        )
        .bind(ConfirmationStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to load pending confirmations", e))?;

        rows.into_iter().map(ConfirmationRecord::try_from).collect()
    }
}

#[async_trait]
impl ConnectionStatusStore for SqliteStore {
    async fn save_connection_status(&self, status: &ConnectionStatus) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO connection_status (
                account_mode, connected, host, port, client_id,
                last_checked, last_connected, reconnect_attempts, last_error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(account_mode) DO UPDATE SET
                connected = excluded.connected,
                host = excluded.host,
                port = excluded.port,
                client_id = excluded.client_id,
                last_checked = excluded.last_checked,
                last_connected = excluded.last_connected,
                reconnect_attempts = excluded.reconnect_attempts,
                last_error = excluded.last_error
            "#,
        )
        .bind(status.account_mode.name())
        .bind(status.connected)
        .bind(&status.host)
        .bind(i64::from(status.port))
        .bind(i64::from(status.client_id))
        .bind(status.last_checked)
        .bind(status.last_connected)
        .bind(i64::from(status.reconnect_attempts))
        .bind(&status.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to save connection status", e))?;

        Ok(())
    }

    async fn load_connection_status(&self, mode: AccountMode) -> StoreResult<Option<ConnectionStatus>> {
        let row = sqlx::query_as::<_, ConnectionStatusRow>(
            "SELECT * FROM connection_status WHERE account_mode = ?1",
        )
        .bind(mode.name())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("Failed to load connection status", e))?;

        row.map(ConnectionStatus::try_from).transpose()
    }

    async fn list_connection_statuses(&self) -> StoreResult<Vec<ConnectionStatus>> {
        let rows = sqlx::query_as::<_, ConnectionStatusRow>(
            "SELECT * FROM connection_status ORDER BY account_mode ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to list connection statuses", e))?;

        rows.into_iter().map(ConnectionStatus::try_from).collect()
    }
}

#[async_trait]
impl DecisionLog for SqliteStore {
    async fn record_decision(&self, audit: &DecisionAudit) -> StoreResult<i64> {
        let forecast_json = audit.forecast.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO decision_audit (
                symbol, account_mode, outcome, stage_reached, reason, forecast_json,
                reasoning_decision, confidence, rationale, safety_issues_json,
                trade_id, decided_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&audit.symbol)
        .bind(audit.account_mode.name())
        .bind(&audit.outcome_kind)
        .bind(audit.stage_reached.as_str())
        .bind(&audit.reason)
        .bind(forecast_json)
        .bind(audit.reasoning_decision.map(|d| d.as_str()))
        .bind(audit.confidence)
        .bind(&audit.rationale)
        .bind(to_json(&audit.safety_issues)?)
        .bind(&audit.trade_id)
        .bind(audit.decided_at)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to record decision", e))?;

        Ok(result.last_insert_rowid())
    }

    async fn link_trade(&self, audit_id: i64, trade_id: &str) -> StoreResult<()> {
        let rows_affected = sqlx::query("UPDATE decision_audit SET trade_id = ?1 WHERE id = ?2")
            .bind(trade_id)
            .bind(audit_id)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("Failed to link decision to trade", e))?
            .rows_affected();

        if rows_affected == 0 {
            return Err(StoreError::NotFound {
                entity: "decision audit",
                id: audit_id.to_string(),
            });
        }
        Ok(())
    }

    async fn recent_decisions(&self, limit: usize) -> StoreResult<Vec<(i64, DecisionAudit)>> {
        let rows = sqlx::query_as::<_, DecisionAuditRow>(
            "SELECT * FROM decision_audit ORDER BY id DESC LIMIT ?1",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to list decisions", e))?;

        rows.into_iter().map(<(i64, DecisionAudit)>::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::confirmation::ApprovalVia;
    use crate::domain::entities::decision::{ReasoningDecision, Stage};
    use crate::domain::entities::execution::SubmissionResult;
    use crate::domain::entities::trade_request::{OrderType, TradeAction, TradeDetails};
    use crate::persistence::init_database;
    use chrono::Duration;

    async fn store() -> SqliteStore {
        SqliteStore::new(init_database("sqlite::memory:").await.unwrap())
    }

    fn request(trade_id: &str, code: &str) -> TradeRequest {
        let details = TradeDetails::new(
            "MSFT",
            TradeAction::Buy,
            2.0,
            OrderType::Limit,
            Some(400.0),
            AccountMode::Paper,
        )
        .unwrap()
        .with_forecast_id(42);
        let now = Utc::now();
        TradeRequest::new_pending(
            trade_id.to_string(),
            code.to_string(),
            details,
            now,
            now + Duration::minutes(15),
        )
    }

    #[tokio::test]
    async fn test_create_and_get_request() {
        let store = store().await;
        let req = request("AAAAAAAAAAAA", "ABCDEF");
        store.create_request(&req).await.unwrap();

        let loaded = store.get_request("AAAAAAAAAAAA").await.unwrap().unwrap();
        assert_eq!(loaded.details, req.details);
        assert_eq!(loaded.status, TradeStatus::Pending);
        assert_eq!(loaded.forecast_id(), Some(42));

        let by_code = store.find_by_approval_code("abcdef").await.unwrap().unwrap();
        assert_eq!(by_code.trade_id, "AAAAAAAAAAAA");

        assert!(store.get_request("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = store().await;
        store.create_request(&request("T1", "C1")).await.unwrap();

        store
            .transition("T1", TradeStatus::Pending, TradeStatus::Approved)
            .await
            .unwrap();
        store
            .transition("T1", TradeStatus::Approved, TradeStatus::Submitted)
            .await
            .unwrap();

        let second = store
            .transition("T1", TradeStatus::Approved, TradeStatus::Submitted)
            .await;
        assert_eq!(
            second,
            Err(StoreError::StatusConflict {
                trade_id: "T1".to_string(),
                expected: TradeStatus::Approved,
                actual: TradeStatus::Submitted,
            })
        );
    }

    #[tokio::test]
    async fn test_transition_rejects_backward_edges() {
        let store = store().await;
        store.create_request(&request("T1", "C1")).await.unwrap();

        let result = store
            .transition("T1", TradeStatus::Submitted, TradeStatus::Approved)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));

        let missing = store
            .transition("NOPE", TradeStatus::Pending, TradeStatus::Approved)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_by_status_skips_archived() {
        let store = store().await;
        store.create_request(&request("T1", "C1")).await.unwrap();
        store.create_request(&request("T2", "C2")).await.unwrap();
        store.archive("T2").await.unwrap();

        let pending = store.list_by_status(TradeStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trade_id, "T1");

        let archived = store.get_request("T2").await.unwrap().unwrap();
        assert!(archived.archived);
    }

    #[tokio::test]
    async fn test_only_one_fill_per_trade() {
        let store = store().await;
        store.create_request(&request("T1", "C1")).await.unwrap();

        let rejected = SubmissionResult::rejected("margin");
        store
            .record_execution(&NewTradeExecution::from_result("T1", &rejected, None, Utc::now()))
            .await
            .unwrap();

        let filled = SubmissionResult {
            success: true,
            order_id: Some("9001".to_string()),
            status: BrokerOrderState::Filled,
            message: "filled".to_string(),
            execution_price: Some(401.2),
        };
        let row = NewTradeExecution::from_result(
            "T1",
            &filled,
            Some(serde_json::json!({"orderId": "9001"})),
            Utc::now(),
        );
        store.record_execution(&row).await.unwrap();

        let again = store.record_execution(&row).await;
        assert_eq!(
            again,
            Err(StoreError::DuplicateFill {
                trade_id: "T1".to_string()
            })
        );

        let rows = store.executions_for("T1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, BrokerOrderState::Rejected);
        assert_eq!(rows[1].execution_price, Some(401.2));
        assert_eq!(
            rows[1].broker_response,
            Some(serde_json::json!({"orderId": "9001"}))
        );
    }

    #[tokio::test]
    async fn test_confirmation_upsert_and_pending_load() {
        let store = store().await;
        let req = request("T1", "C1");
        let mut record = ConfirmationRecord::new(
            req.trade_id.clone(),
            req.approval_code.clone(),
            req.details.clone(),
            req.requested_at,
            req.expires_at,
        );
        store.save_confirmation(&record).await.unwrap();
        assert_eq!(store.load_pending_confirmations().await.unwrap().len(), 1);

        record.approve(ApprovalVia::ReplyMatch, Utc::now());
        store.save_confirmation(&record).await.unwrap();
        assert!(store.load_pending_confirmations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connection_status_one_row_per_mode() {
        let store = store().await;
        let mut status = ConnectionStatus::new(AccountMode::Paper, "127.0.0.1", 7497, 1);
        store.save_connection_status(&status).await.unwrap();

        status.record_check(false, Some("refused".to_string()), Utc::now());
        store.save_connection_status(&status).await.unwrap();

        let all = store.list_connection_statuses().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reconnect_attempts, 1);
        assert_eq!(all[0].last_error.as_deref(), Some("refused"));
        assert!(store
            .load_connection_status(AccountMode::Live)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_decision_audit_link_trade() {
        let store = store().await;
        let mut audit = DecisionAudit::new("AAPL", AccountMode::Paper, Utc::now());
        audit.outcome_kind = "awaiting_approval".to_string();
        audit.stage_reached = Stage::Audit;
        audit.reasoning_decision = Some(ReasoningDecision::Approve);
        audit.confidence = Some(0.8);
        audit.safety_issues = vec![];

        let id = store.record_decision(&audit).await.unwrap();
        store.link_trade(id, "T1").await.unwrap();

        let recent = store.recent_decisions(5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].0, id);
        assert_eq!(recent[0].1.trade_id.as_deref(), Some("T1"));
        assert_eq!(recent[0].1.reasoning_decision, Some(ReasoningDecision::Approve));

        assert!(store.link_trade(id + 100, "T2").await.is_err());
    }
}
