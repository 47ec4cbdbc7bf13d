use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::account_mode::AccountMode;
use crate::domain::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for TradeAction {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            other => Err(ValidationError::InvalidAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

impl FromStr for OrderType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "MARKET" | "MKT" => Ok(OrderType::Market),
            "LIMIT" | "LMT" => Ok(OrderType::Limit),
            other => Err(ValidationError::InvalidOrderType(other.to_string())),
        }
    }
}

/// Trade parameters, validated once at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDetails {
    pub symbol: String,
    pub action: TradeAction,
    pub quantity: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub account_mode: AccountMode,
    pub confidence: Option<f64>,
    pub rationale: Option<String>,
    pub forecast_id: Option<i64>,
}

impl TradeDetails {
    pub fn new(
        symbol: &str,
        action: TradeAction,
        quantity: f64,
        order_type: OrderType,
        limit_price: Option<f64>,
        account_mode: AccountMode,
    ) -> Result<Self, ValidationError> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(ValidationError::EmptySymbol);
        }

        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(ValidationError::InvalidQuantity(quantity));
        }

        let limit_price = match order_type {
            OrderType::Limit => match limit_price {
                Some(price) if price.is_finite() && price > 0.0 => Some(price),
                Some(price) => return Err(ValidationError::InvalidLimitPrice(price)),
                None => return Err(ValidationError::MissingLimitPrice { symbol }),
            },
            // Market orders never carry a limit
            OrderType::Market => None,
        };

        Ok(Self {
            symbol,
            action,
            quantity,
            order_type,
            limit_price,
            account_mode,
            confidence: None,
            rationale: None,
            forecast_id: None,
        })
    }

    /// Shorthand for a market order
    pub fn market(
        symbol: &str,
        action: TradeAction,
        quantity: f64,
        account_mode: AccountMode,
    ) -> Result<Self, ValidationError> {
        Self::new(symbol, action, quantity, OrderType::Market, None, account_mode)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Result<Self, ValidationError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationError::InvalidConfidence(confidence));
        }
        self.confidence = Some(confidence);
        Ok(self)
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn with_forecast_id(mut self, forecast_id: i64) -> Self {
        self.forecast_id = Some(forecast_id);
        self
    }

    /// One-line human readable description, used in confirmation messages.
    pub fn summary(&self) -> String {
        let price = match (self.order_type, self.limit_price) {
            (OrderType::Limit, Some(limit)) => format!(" @ {:.2}", limit),
            _ => String::new(),
        };
        format!(
            "{} {} {} {}{} [{}]",
            self.action, self.quantity, self.symbol, self.order_type, price, self.account_mode
        )
    }
}

/// Trade request lifecycle.
///
/// pending -> {approved, rejected, expired}; approved -> submitted;
/// submitted -> {filled, failed}; failed -> submitted (explicit resubmission).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Submitted,
    Filled,
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Approved => "approved",
            TradeStatus::Rejected => "rejected",
            TradeStatus::Expired => "expired",
            TradeStatus::Submitted => "submitted",
            TradeStatus::Filled => "filled",
            TradeStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        use TradeStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Approved, Submitted)
                | (Submitted, Filled)
                | (Submitted, Failed)
                | (Failed, Submitted)
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TradeStatus::Pending),
            "approved" => Ok(TradeStatus::Approved),
            "rejected" => Ok(TradeStatus::Rejected),
            "expired" => Ok(TradeStatus::Expired),
            "submitted" => Ok(TradeStatus::Submitted),
            "filled" => Ok(TradeStatus::Filled),
            "failed" => Ok(TradeStatus::Failed),
            other => Err(format!("Unknown trade status: {}", other)),
        }
    }
}

/// Persisted trade request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub trade_id: String,
    /// Never rendered in API output; only the SMS carries it
    #[serde(skip_serializing)]
    pub approval_code: String,
    pub details: TradeDetails,
    pub status: TradeStatus,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
}

impl TradeRequest {
    pub fn new_pending(
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
            status: TradeStatus::Pending,
            requested_at,
            expires_at,
            updated_at: requested_at,
            archived: false,
        }
    }

    pub fn forecast_id(&self) -> Option<i64> {
        self.details.forecast_id
    }
}
