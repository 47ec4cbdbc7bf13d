//! External decision inputs: market data, forecast, trust and reasoning.
//!
//! The scoring behind each oracle lives outside this crate; only the
//! contracts are defined here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::decision::ReasoningDecision;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OracleError {
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub timestamp: DateTime<Utc>,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    #[serde(default)]
    pub forecast_id: Option<i64>,
    pub point: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustAssessment {
    pub trust_score: f64,
    pub is_trusted: bool,
    #[serde(default)]
    pub rejection_reasons: Vec<String>,
    pub drift_score: f64,
    pub coherence_score: f64,
    pub model_reliability: f64,
}

/// Context passed to the reasoning oracle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningContext {
    pub symbol: String,
    pub account_mode: AccountMode,
    pub last_price: f64,
    pub volatility: f64,
    pub forecast: Forecast,
    pub trust_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningVerdict {
    pub decision: ReasoningDecision,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Oldest bar first
    async fn price_history(&self, symbol: &str, lookback: usize) -> Result<Vec<PriceBar>, OracleError>;
}

#[async_trait]
pub trait ForecastOracle: Send + Sync {
    async fn forecast(
        &self,
        symbol: &str,
        price_series: &[f64],
        horizon: usize,
    ) -> Result<Forecast, OracleError>;
}

#[async_trait]
pub trait TrustOracle: Send + Sync {
    async fn evaluate(&self, forecast: &Forecast, input: &[f64]) -> Result<TrustAssessment, OracleError>;
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn decide(&self, context: &ReasoningContext) -> Result<ReasoningVerdict, OracleError>;
}
