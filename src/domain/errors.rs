use std::fmt;
use thiserror::Error;

use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::trade_request::TradeStatus;
use crate::domain::repositories::broker_client::BrokerError;

/// Failure classes of the control plane. Every concrete error maps onto one
/// of these so callers can branch on kind instead of matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Broker session unavailable; retried with bounded backoff
    Connection,
    /// Rejected before touching the broker, never retried
    Validation,
    /// Confirmation window elapsed
    ConfirmationExpired,
    /// Reply predates the request it claims to approve
    ConfirmationReplayRejected,
    /// Safety gate raised HALT_TRADING
    SafetyHalt,
    /// Broker refused the order
    BrokerRejectedOrder,
    /// No pre-trade market price
    PriceUnavailable,
    /// Notification channel failure
    Notification,
    /// Persistence failure
    Storage,
}

impl ErrorKind {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ErrorKind::ConfirmationExpired => ErrorSeverity::Minor,
            ErrorKind::PriceUnavailable => ErrorSeverity::Minor,
            ErrorKind::Validation => ErrorSeverity::Moderate,
            ErrorKind::Connection => ErrorSeverity::Moderate,
            ErrorKind::BrokerRejectedOrder => ErrorSeverity::Moderate,
            ErrorKind::Notification => ErrorSeverity::Critical,
            ErrorKind::ConfirmationReplayRejected => ErrorSeverity::Critical,
            ErrorKind::SafetyHalt => ErrorSeverity::Critical,
            ErrorKind::Storage => ErrorSeverity::Critical,
        }
    }

    /// Only connection loss is retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connection)
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "ERR_CONNECTION",
            ErrorKind::Validation => "ERR_VALIDATION",
            ErrorKind::ConfirmationExpired => "ERR_CONFIRMATION_EXPIRED",
            ErrorKind::ConfirmationReplayRejected => "ERR_CONFIRMATION_REPLAY",
            ErrorKind::SafetyHalt => "ERR_SAFETY_HALT",
            ErrorKind::BrokerRejectedOrder => "ERR_BROKER_REJECTED",
            ErrorKind::PriceUnavailable => "ERR_PRICE_UNAVAILABLE",
            ErrorKind::Notification => "ERR_NOTIFICATION",
            ErrorKind::Storage => "ERR_STORAGE",
        }
    }
}

/// Severity levels for control plane errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected lifecycle event
    Minor,
    /// Indicates a problem with a single trade
    Moderate,
    /// Requires operator attention
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Minor => write!(f, "Minor"),
            ErrorSeverity::Moderate => write!(f, "Moderate"),
            ErrorSeverity::Critical => write!(f, "Critical"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Symbol must not be empty")]
    EmptySymbol,

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(f64),

    #[error("Limit order for {symbol} requires a limit price")]
    MissingLimitPrice { symbol: String },

    #[error("Invalid limit price: {0}")]
    InvalidLimitPrice(f64),

    #[error("Invalid action: {0} (expected BUY or SELL)")]
    InvalidAction(String),

    #[error("Invalid order type: {0} (expected MARKET or LIMIT)")]
    InvalidOrderType(String),

    #[error("Confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid status transition for {trade_id}: {from} -> {to}")]
    InvalidTransition {
        trade_id: String,
        from: TradeStatus,
        to: TradeStatus,
    },

    #[error("Status conflict for {trade_id}: expected {expected}, found {actual}")]
    StatusConflict {
        trade_id: String,
        expected: TradeStatus,
        actual: TradeStatus,
    },

    #[error("Trade {trade_id} already has a filled execution")]
    DuplicateFill { trade_id: String },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Broker session for {mode} account is not connected")]
    NotConnected { mode: AccountMode },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("No market price available for {symbol}")]
    PriceUnavailable { symbol: String },

    #[error("Instrument not found: {symbol}")]
    InstrumentNotFound { symbol: String },

    #[error("Duplicate submission for {trade_id}: status is already {status}")]
    DuplicateSubmission { trade_id: String, status: TradeStatus },

    #[error("Trade {trade_id} is {status}, not eligible for submission")]
    NotApproved { trade_id: String, status: TradeStatus },

    #[error("Trade request not found: {trade_id}")]
    RequestNotFound { trade_id: String },

    #[error("Trade {trade_id} is for the {actual} account, this gateway serves {expected}")]
    WrongAccount {
        trade_id: String,
        expected: AccountMode,
        actual: AccountMode,
    },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::NotConnected { .. } => ErrorKind::Connection,
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::PriceUnavailable { .. } => ErrorKind::PriceUnavailable,
            GatewayError::InstrumentNotFound { .. } => ErrorKind::Validation,
            GatewayError::DuplicateSubmission { .. } => ErrorKind::Validation,
            GatewayError::NotApproved { .. } => ErrorKind::Validation,
            GatewayError::RequestNotFound { .. } => ErrorKind::Validation,
            GatewayError::WrongAccount { .. } => ErrorKind::Validation,
            GatewayError::Broker(e) if e.is_connection_failure() => ErrorKind::Connection,
            GatewayError::Broker(BrokerError::OrderRejected(_)) => ErrorKind::BrokerRejectedOrder,
            GatewayError::Broker(_) => ErrorKind::Connection,
            GatewayError::Store(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfirmationError {
    #[error("Notification could not be delivered: {0}")]
    NotificationFailed(String),

    #[error("Confirmation {trade_id} expired")]
    Expired { trade_id: String },

    #[error("Reply {message_id} predates confirmation {trade_id} by {delta_secs}s")]
    ReplayRejected {
        trade_id: String,
        message_id: String,
        delta_secs: i64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ConfirmationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfirmationError::NotificationFailed(_) => ErrorKind::Notification,
            ConfirmationError::Expired { .. } => ErrorKind::ConfirmationExpired,
            ConfirmationError::ReplayRejected { .. } => ErrorKind::ConfirmationReplayRejected,
            ConfirmationError::Store(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Trading halted by safety gate: {reason}")]
    SafetyHalt { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SafetyHalt { .. } => ErrorKind::SafetyHalt,
            PipelineError::Store(_) => ErrorKind::Storage,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No execution gateway configured for the {0} account")]
    NoGateway(AccountMode),

    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::NoGateway(_) => ErrorKind::Validation,
            DispatchError::Confirmation(e) => e.kind(),
            DispatchError::Gateway(e) => e.kind(),
            DispatchError::Store(_) => ErrorKind::Storage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_retryable() {
        let retryable: Vec<ErrorKind> = [
            ErrorKind::Connection,
            ErrorKind::Validation,
            ErrorKind::ConfirmationExpired,
            ErrorKind::ConfirmationReplayRejected,
            ErrorKind::SafetyHalt,
            ErrorKind::BrokerRejectedOrder,
            ErrorKind::PriceUnavailable,
            ErrorKind::Notification,
            ErrorKind::Storage,
        ]
        .into_iter()
        .filter(|k| k.is_retryable())
        .collect();

        assert_eq!(retryable, vec![ErrorKind::Connection]);
    }

    #[test]
    fn test_replay_rejection_is_critical() {
        let error = ConfirmationError::ReplayRejected {
            trade_id: "ABC".to_string(),
            message_id: "SM1".to_string(),
            delta_secs: -120,
        };
        assert_eq!(error.kind(), ErrorKind::ConfirmationReplayRejected);
        assert_eq!(error.kind().severity(), ErrorSeverity::Critical);
    }

    #[test]
    fn test_gateway_error_kinds() {
        let missing_price = GatewayError::PriceUnavailable {
            symbol: "AAPL".to_string(),
        };
        assert_eq!(missing_price.kind(), ErrorKind::PriceUnavailable);

        let refused = GatewayError::Broker(BrokerError::ConnectionRefused("127.0.0.1:7497".to_string()));
        assert_eq!(refused.kind(), ErrorKind::Connection);

        let rejected = GatewayError::Broker(BrokerError::OrderRejected("margin".to_string()));
        assert_eq!(rejected.kind(), ErrorKind::BrokerRejectedOrder);

        let invalid = GatewayError::from(ValidationError::EmptySymbol);
        assert_eq!(invalid.kind(), ErrorKind::Validation);
        assert!(!invalid.kind().is_retryable());
    }

    #[test]
    fn test_error_codes_unique() {
        let kinds = [
            ErrorKind::Connection,
            ErrorKind::Validation,
            ErrorKind::ConfirmationExpired,
            ErrorKind::ConfirmationReplayRejected,
            ErrorKind::SafetyHalt,
            ErrorKind::BrokerRejectedOrder,
            ErrorKind::PriceUnavailable,
            ErrorKind::Notification,
            ErrorKind::Storage,
        ];
        let mut codes = vec![];
        for kind in kinds {
            let code = kind.error_code();
            assert!(!codes.contains(&code), "Duplicate error code: {}", code);
            codes.push(code);
        }
    }

    #[test]
    fn test_validation_error_display() {
        let error = ValidationError::MissingLimitPrice {
            symbol: "MSFT".to_string(),
        };
        assert_eq!(error.to_string(), "Limit order for MSFT requires a limit price");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Minor < ErrorSeverity::Moderate);
        assert!(ErrorSeverity::Moderate < ErrorSeverity::Critical);
    }
}
