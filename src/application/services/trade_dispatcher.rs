//! Stage 7 hand-off: routes approved candidates either straight to the
//! execution gateway or through human confirmation, and turns confirmed
//! approvals into gateway executions.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::services::execution_gateway::ExecutionGateway;
use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::confirmation::ApprovedTrade;
use crate::domain::entities::execution::{BrokerOrderState, SubmissionResult};
use crate::domain::entities::trade_request::{TradeDetails, TradeRequest, TradeStatus};
use crate::domain::errors::{DispatchError, GatewayError};
use crate::domain::repositories::trade_store::TradeRequestStore;
use crate::domain::services::approval_broker::{fresh_identifiers, ApprovalBroker};
use crate::domain::services::pipeline::{HandoffError, HandoffReceipt, TradeHandoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Submit immediately, no human in the loop
    Automated,
    /// Send a confirmation and wait for an approval
    ApprovalRequired,
}

impl std::str::FromStr for ExecutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "automated" | "auto" => Ok(ExecutionPolicy::Automated),
            "approval" | "approval_required" | "manual" => Ok(ExecutionPolicy::ApprovalRequired),
            other => Err(format!("Unknown execution policy: {}", other)),
        }
    }
}

/// Result of executing one approved trade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub trade_id: String,
    pub status: TradeStatus,
    pub result: SubmissionResult,
}

/// What one approval worker pass did
#[derive(Debug, Default)]
pub struct ApprovalPass {
    pub settled: Option<ExecutionReport>,
    pub expired: usize,
    pub retried: Vec<ExecutionReport>,
    /// Set when the reply scan failed; the sweep and retry still ran
    pub reply_error: Option<DispatchError>,
}

pub struct TradeDispatcher {
    policy: ExecutionPolicy,
    approvals: Arc<ApprovalBroker>,
    gateways: HashMap<AccountMode, Arc<ExecutionGateway>>,
    store: Arc<dyn TradeRequestStore>,
}

impl TradeDispatcher {
    pub fn new(
        policy: ExecutionPolicy,
        approvals: Arc<ApprovalBroker>,
        gateways: Vec<Arc<ExecutionGateway>>,
        store: Arc<dyn TradeRequestStore>,
    ) -> Self {
        let gateways = gateways
            .into_iter()
            .map(|gateway| (gateway.account_mode(), gateway))
            .collect();
        Self {
            policy,
            approvals,
            gateways,
            store,
        }
    }

    pub fn policy(&self) -> ExecutionPolicy {
        self.policy
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    pub fn gateway(&self, mode: AccountMode) -> Result<&Arc<ExecutionGateway>, DispatchError> {
        self.gateways.get(&mode).ok_or(DispatchError::NoGateway(mode))
    }

    /// Match one inbound reply and execute the trade it approves
    pub async fn process_replies(&self) -> Result<Option<ExecutionReport>, DispatchError> {
        match self.approvals.check_for_reply().await? {
            Some(approved) => self.execute_approved(&approved).await.map(Some),
            None => Ok(None),
        }
    }

    /// One tick of the approval worker: match a reply, expire stale
    /// confirmations, then retry approved requests.
    pub async fn run_approval_pass(&self) -> Result<ApprovalPass, DispatchError> {
        let (settled, reply_error) = match self.process_replies().await {
            Ok(report) => (report, None),
            Err(e) => (None, Some(e)),
        };
        let expired = self.approvals.sweep_expired().await;
        let retried = self.retry_approved().await?;

        Ok(ApprovalPass {
            settled,
            expired,
            retried,
            reply_error,
        })
    }

    /// Approve by code (operator API) and execute
    pub async fn approve_by_code(&self, code: &str) -> Result<Option<ExecutionReport>, DispatchError> {
        match self.approvals.verify_approval(code).await? {
            Some(approved) => self.execute_approved(&approved).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn reject(&self, trade_id: &str) -> Result<bool, DispatchError> {
        Ok(self.approvals.reject(trade_id).await?)
    }

    /// Retry a failed request on its account's gateway
    pub async fn resubmit(&self, trade_id: &str) -> Result<ExecutionReport, DispatchError> {
        let request = self
            .store
            .get_request(trade_id)
            .await?
            .ok_or_else(|| GatewayError::RequestNotFound {
                trade_id: trade_id.to_string(),
            })?;
        let result = self
            .gateway(request.details.account_mode)?
            .resubmit(trade_id)
            .await?;
        Ok(ExecutionReport {
            trade_id: trade_id.to_string(),
            status: settled_status(&result),
            result,
        })
    }

    /// Pick up approved requests whose execution never happened, e.g.
    /// because the broker was unreachable at approval time.
    pub async fn retry_approved(&self) -> Result<Vec<ExecutionReport>, DispatchError> {
        let mut reports = Vec::new();
        for request in self.store.list_by_status(TradeStatus::Approved).await? {
            match self.execute(&request.trade_id, &request.details).await {
                Ok(report) => reports.push(report),
                Err(DispatchError::Gateway(GatewayError::NotConnected { mode })) => {
                    warn!("{} broker still unreachable, trade {} stays approved", mode, request.trade_id);
                }
                Err(DispatchError::Gateway(GatewayError::DuplicateSubmission { .. })) => {}
                Err(e) => error!("Retrying approved trade {} failed: {}", request.trade_id, e),
            }
        }
        Ok(reports)
    }

    async fn execute_approved(&self, approved: &ApprovedTrade) -> Result<ExecutionReport, DispatchError> {
        info!(
            "Trade {} approved via {}, executing",
            approved.trade_id,
            approved.approved_via.as_str()
        );
        self.execute(&approved.trade_id, &approved.details).await
    }

    async fn execute(&self, trade_id: &str, details: &TradeDetails) -> Result<ExecutionReport, DispatchError> {
        let gateway = self.gateway(details.account_mode)?;
        let result = gateway.execute_request(trade_id).await?;
        Ok(ExecutionReport {
            trade_id: trade_id.to_string(),
            status: settled_status(&result),
            result,
        })
    }

    async fn hand_off_automated(&self, details: TradeDetails) -> Result<HandoffReceipt, DispatchError> {
        let gateway = self.gateway(details.account_mode)?.clone();

        let (trade_id, approval_code) = fresh_identifiers();
        let now = Utc::now();
        let request = TradeRequest::new_pending(
            trade_id.clone(),
            approval_code,
            details,
            now,
            now + self.approvals.config().confirmation_window,
        );
        self.store.create_request(&request).await?;
        self.store
            .transition(&trade_id, TradeStatus::Pending, TradeStatus::Approved)
            .await?;
        info!("Trade {} auto-approved: {}", trade_id, request.details.summary());

        let result = gateway.execute_request(&trade_id).await?;
        Ok(HandoffReceipt::Executed {
            status: settled_status(&result),
            trade_id,
        })
    }
}

/// Request status implied by a submission result
fn settled_status(result: &SubmissionResult) -> TradeStatus {
    match result.status {
        BrokerOrderState::Filled => TradeStatus::Filled,
        BrokerOrderState::Rejected => TradeStatus::Failed,
        _ => TradeStatus::Submitted,
    }
}

#[async_trait]
impl TradeHandoff for TradeDispatcher {
    async fn hand_off(&self, details: TradeDetails) -> Result<HandoffReceipt, HandoffError> {
        let outcome = match self.policy {
            ExecutionPolicy::Automated => self.hand_off_automated(details).await,
            ExecutionPolicy::ApprovalRequired => self
                .approvals
                .request_confirmation(details)
                .await
                .map(|trade_id| HandoffReceipt::AwaitingApproval { trade_id })
                .map_err(DispatchError::from),
        };

        outcome.map_err(|e| HandoffError {
            kind: e.kind(),
            message: e.to_string(),
        })
    }
}
