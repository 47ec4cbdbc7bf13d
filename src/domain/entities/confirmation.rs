use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::trade_request::TradeDetails;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Pending => "pending",
            ConfirmationStatus::Approved => "approved",
            ConfirmationStatus::Rejected => "rejected",
            ConfirmationStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConfirmationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConfirmationStatus::Pending),
            "approved" => Ok(ConfirmationStatus::Approved),
            "rejected" => Ok(ConfirmationStatus::Rejected),
            "expired" => Ok(ConfirmationStatus::Expired),
            other => Err(format!("Unknown confirmation status: {}", other)),
        }
    }
}

/// How an approval was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVia {
    ExplicitCode,
    ReplyMatch,
}

impl ApprovalVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalVia::ExplicitCode => "explicit_code",
            ApprovalVia::ReplyMatch => "reply_match",
        }
    }
}

impl FromStr for ApprovalVia {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "explicit_code" => Ok(ApprovalVia::ExplicitCode),
            "reply_match" => Ok(ApprovalVia::ReplyMatch),
            other => Err(format!("Unknown approval channel: {}", other)),
        }
    }
}

/// In-flight confirmation for a pending trade request.
///
/// The detail snapshot is fixed at issue time. Once `status` leaves
/// `Pending` every mutator is a no-op returning `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub trade_id: String,
    pub approval_code: String,
    details: TradeDetails,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    status: ConfirmationStatus,
    approved_at: Option<DateTime<Utc>>,
    approved_via: Option<ApprovalVia>,
}

impl ConfirmationRecord {
    pub fn new(
        trade_id: String,
        approval_code: String,
        details: TradeDetails,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id,
            approval_code,
            details,
            requested_at,
            expires_at,
            status: ConfirmationStatus::Pending,
            approved_at: None,
            approved_via: None,
        }
    }

    /// Rebuild a record from storage
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        trade_id: String,
        approval_code: String,
        details: TradeDetails,
        requested_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        status: ConfirmationStatus,
        approved_at: Option<DateTime<Utc>>,
        approved_via: Option<ApprovalVia>,
    ) -> Self {
        Self {
            trade_id,
            approval_code,
            details,
            requested_at,
            expires_at,
            status,
            approved_at,
            approved_via,
        }
    }

    pub fn details(&self) -> &TradeDetails {
        &self.details
    }

    pub fn status(&self) -> ConfirmationStatus {
        self.status
    }

    pub fn approved_at(&self) -> Option<DateTime<Utc>> {
        self.approved_at
    }

    pub fn approved_via(&self) -> Option<ApprovalVia> {
        self.approved_via
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConfirmationStatus::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Pending and still inside its window
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && !self.is_expired_at(now)
    }

    pub fn approve(&mut self, via: ApprovalVia, now: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ConfirmationStatus::Approved;
        self.approved_at = Some(now);
        self.approved_via = Some(via);
        true
    }

    pub fn reject(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ConfirmationStatus::Rejected;
        true
    }

    pub fn expire(&mut self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = ConfirmationStatus::Expired;
        true
    }
}

/// Snapshot handed out on a successful approval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovedTrade {
    pub trade_id: String,
    pub approval_code: String,
    pub details: TradeDetails,
    pub approved_at: DateTime<Utc>,
    pub approved_via: ApprovalVia,
}
