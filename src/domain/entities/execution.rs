use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Broker order states after normalisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerOrderState {
    Submitted,
    PreSubmitted,
    PendingSubmit,
    PartiallyFilled,
    Filled,
    Rejected,
}

impl BrokerOrderState {
    /// Map a raw broker status string. Cancelled and inactive orders count as
    /// rejected; anything unrecognised is treated as still in flight.
    pub fn from_broker(raw: &str) -> Self {
        let normalized: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "submitted" => BrokerOrderState::Submitted,
            "presubmitted" => BrokerOrderState::PreSubmitted,
            "pendingsubmit" | "apipending" | "pending" => BrokerOrderState::PendingSubmit,
            "partiallyfilled" | "partial" => BrokerOrderState::PartiallyFilled,
            "filled" => BrokerOrderState::Filled,
            "rejected" | "cancelled" | "canceled" | "apicancelled" | "inactive" => {
                BrokerOrderState::Rejected
            }
            _ => {
                warn!("Unrecognised broker order status '{}', treating as PendingSubmit", raw);
                BrokerOrderState::PendingSubmit
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerOrderState::Submitted => "Submitted",
            BrokerOrderState::PreSubmitted => "PreSubmitted",
            BrokerOrderState::PendingSubmit => "PendingSubmit",
            BrokerOrderState::PartiallyFilled => "PartiallyFilled",
            BrokerOrderState::Filled => "Filled",
            BrokerOrderState::Rejected => "Rejected",
        }
    }

    /// Everything except an outright rejection is a successful submission
    pub fn is_success(&self) -> bool {
        !matches!(self, BrokerOrderState::Rejected)
    }

    /// Settled states stop the post-submission poll
    pub fn is_settled(&self) -> bool {
        matches!(self, BrokerOrderState::Filled | BrokerOrderState::Rejected)
    }
}

impl std::fmt::Display for BrokerOrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one submission attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub status: BrokerOrderState,
    pub message: String,
    pub execution_price: Option<f64>,
}

impl SubmissionResult {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            status: BrokerOrderState::Rejected,
            message: message.into(),
            execution_price: None,
        }
    }
}

/// Execution row about to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewTradeExecution {
    pub trade_id: String,
    pub order_id: Option<String>,
    pub execution_price: Option<f64>,
    pub status: BrokerOrderState,
    pub broker_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl NewTradeExecution {
    pub fn from_result(
        trade_id: &str,
        result: &SubmissionResult,
        broker_response: Option<serde_json::Value>,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            order_id: result.order_id.clone(),
            execution_price: result.execution_price,
            status: result.status,
            broker_response,
            error_message: if result.success {
                None
            } else {
                Some(result.message.clone())
            },
            attempted_at,
        }
    }
}

/// Stored execution row, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeExecution {
    pub id: i64,
    pub trade_id: String,
    pub order_id: Option<String>,
    pub execution_price: Option<f64>,
    pub status: BrokerOrderState,
    pub broker_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_status_mapping() {
        assert_eq!(BrokerOrderState::from_broker("Submitted"), BrokerOrderState::Submitted);
        assert_eq!(
            BrokerOrderState::from_broker("PreSubmitted"),
            BrokerOrderState::PreSubmitted
        );
        assert_eq!(
            BrokerOrderState::from_broker("partially_filled"),
            BrokerOrderState::PartiallyFilled
        );
        assert_eq!(BrokerOrderState::from_broker("FILLED"), BrokerOrderState::Filled);
        assert_eq!(BrokerOrderState::from_broker("ApiCancelled"), BrokerOrderState::Rejected);
        assert_eq!(BrokerOrderState::from_broker("Inactive"), BrokerOrderState::Rejected);
        assert_eq!(
            BrokerOrderState::from_broker("SomethingNew"),
            BrokerOrderState::PendingSubmit
        );
    }

    #[test]
    fn test_only_rejected_is_failure() {
        for state in [
            BrokerOrderState::Submitted,
            BrokerOrderState::PreSubmitted,
            BrokerOrderState::PendingSubmit,
            BrokerOrderState::PartiallyFilled,
            BrokerOrderState::Filled,
        ] {
            assert!(state.is_success());
        }
        assert!(!BrokerOrderState::Rejected.is_success());
    }

    #[test]
    fn test_failed_result_carries_error_message() {
        let result = SubmissionResult::rejected("insufficient margin");
        let row = NewTradeExecution::from_result("T1", &result, None, Utc::now());
        assert_eq!(row.error_message.as_deref(), Some("insufficient margin"));
        assert_eq!(row.status, BrokerOrderState::Rejected);
        assert!(row.order_id.is_none());
    }
}
