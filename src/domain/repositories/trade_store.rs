//! Persistence port for the trade request state machine.
//!
//! Implementations must make `transition` a compare-and-set on the status
//! column: concurrent callers racing on the same edge see exactly one
//! success, the rest get `StoreError::StatusConflict`.

use async_trait::async_trait;

use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::confirmation::ConfirmationRecord;
use crate::domain::entities::connection_status::ConnectionStatus;
use crate::domain::entities::decision::DecisionAudit;
use crate::domain::entities::execution::{NewTradeExecution, TradeExecution};
use crate::domain::entities::trade_request::{TradeRequest, TradeStatus};
use crate::domain::errors::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TradeRequestStore: Send + Sync {
    async fn create_request(&self, request: &TradeRequest) -> StoreResult<()>;

    async fn get_request(&self, trade_id: &str) -> StoreResult<Option<TradeRequest>>;

    async fn find_by_approval_code(&self, approval_code: &str) -> StoreResult<Option<TradeRequest>>;

    /// Move `trade_id` from `from` to `to`.
    ///
    /// Fails with `InvalidTransition` when the edge is not allowed and with
    /// `StatusConflict` when the stored status is no longer `from`.
    async fn transition(&self, trade_id: &str, from: TradeStatus, to: TradeStatus) -> StoreResult<()>;

    async fn list_by_status(&self, status: TradeStatus) -> StoreResult<Vec<TradeRequest>>;

    /// Hide a request from active listings. Requests are never deleted.
    async fn archive(&self, trade_id: &str) -> StoreResult<()>;

    /// Append one execution row. A second `Filled` row for the same trade
    /// fails with `DuplicateFill`.
    async fn record_execution(&self, execution: &NewTradeExecution) -> StoreResult<i64>;

    /// Oldest first
    async fn executions_for(&self, trade_id: &str) -> StoreResult<Vec<TradeExecution>>;

    /// Insert or update the confirmation row for `record.trade_id`
    async fn save_confirmation(&self, record: &ConfirmationRecord) -> StoreResult<()>;

    async fn load_pending_confirmations(&self) -> StoreResult<Vec<ConfirmationRecord>>;
}

#[async_trait]
pub trait ConnectionStatusStore: Send + Sync {
    async fn save_connection_status(&self, status: &ConnectionStatus) -> StoreResult<()>;

    async fn load_connection_status(&self, mode: AccountMode) -> StoreResult<Option<ConnectionStatus>>;

    async fn list_connection_statuses(&self) -> StoreResult<Vec<ConnectionStatus>>;
}

#[async_trait]
pub trait DecisionLog: Send + Sync {
    /// Returns the audit row id
    async fn record_decision(&self, audit: &DecisionAudit) -> StoreResult<i64>;

    async fn link_trade(&self, audit_id: i64, trade_id: &str) -> StoreResult<()>;

    /// Newest first
    async fn recent_decisions(&self, limit: usize) -> StoreResult<Vec<(i64, DecisionAudit)>>;
}
