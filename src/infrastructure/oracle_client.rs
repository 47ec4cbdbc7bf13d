//! HTTP client for the external decision services (price history,
//! forecasting, trust scoring and the reasoning model).

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::domain::entities::decision::ReasoningDecision;
use crate::domain::repositories::oracles::{
    Forecast, ForecastOracle, MarketDataSource, OracleError, PriceBar, ReasoningContext,
    ReasoningOracle, ReasoningVerdict, TrustAssessment, TrustOracle,
};

#[derive(Debug, Serialize)]
struct ForecastRequest<'a> {
    symbol: &'a str,
    prices: &'a [f64],
    horizon: usize,
}

#[derive(Debug, Serialize)]
struct TrustRequest<'a> {
    forecast: &'a Forecast,
    input: &'a [f64],
}

/// Reasoning answer before the decision word is normalised
#[derive(Debug, Deserialize)]
struct RawVerdict {
    decision: String,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

impl TryFrom<RawVerdict> for ReasoningVerdict {
    type Error = OracleError;

    fn try_from(raw: RawVerdict) -> Result<Self, Self::Error> {
        let decision: ReasoningDecision = raw.decision.parse().map_err(OracleError::InvalidResponse)?;
        if !raw.confidence.is_finite() {
            return Err(OracleError::InvalidResponse(format!(
                "non-finite confidence {}",
                raw.confidence
            )));
        }
        Ok(ReasoningVerdict {
            decision,
            confidence: raw.confidence,
            rationale: raw.rationale,
        })
    }
}

pub struct OracleClient {
    client: Client,
    base_url: String,
}

impl OracleClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn read<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, OracleError> {
        let response = request
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OracleError::Unavailable(format!("{} - {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))
    }
}

fn check_forecast(forecast: Forecast) -> Result<Forecast, OracleError> {
    let values = [forecast.point, forecast.lower_bound, forecast.upper_bound];
    if values.iter().any(|v| !v.is_finite()) {
        return Err(OracleError::InvalidResponse(format!(
            "non-finite forecast {:?}",
            values
        )));
    }
    if forecast.lower_bound > forecast.upper_bound {
        return Err(OracleError::InvalidResponse(format!(
            "forecast bounds inverted ({} > {})",
            forecast.lower_bound, forecast.upper_bound
        )));
    }
    Ok(forecast)
}

#[async_trait]
impl MarketDataSource for OracleClient {
    async fn price_history(&self, symbol: &str, lookback: usize) -> Result<Vec<PriceBar>, OracleError> {
        let url = format!("{}/v1/prices/{}", self.base_url, symbol);
        let mut bars: Vec<PriceBar> = self
            .read(self.client.get(url).query(&[("lookback", lookback)]))
            .await?;
        bars.retain(|bar| bar.close.is_finite() && bar.close > 0.0);
        bars.sort_by_key(|bar| bar.timestamp);
        debug!("Fetched {} bars for {}", bars.len(), symbol);
        Ok(bars)
    }
}

#[async_trait]
impl ForecastOracle for OracleClient {
    async fn forecast(
        &self,
        symbol: &str,
        price_series: &[f64],
        horizon: usize,
    ) -> Result<Forecast, OracleError> {
        let url = format!("{}/v1/forecast", self.base_url);
        let body = ForecastRequest {
            symbol,
            prices: price_series,
            horizon,
        };
        check_forecast(self.read(self.client.post(url).json(&body)).await?)
    }
}

#[async_trait]
impl TrustOracle for OracleClient {
    async fn evaluate(&self, forecast: &Forecast, input: &[f64]) -> Result<TrustAssessment, OracleError> {
        let url = format!("{}/v1/trust", self.base_url);
        self.read(self.client.post(url).json(&TrustRequest { forecast, input }))
            .await
    }
}

#[async_trait]
impl ReasoningOracle for OracleClient {
    async fn decide(&self, context: &ReasoningContext) -> Result<ReasoningVerdict, OracleError> {
        let url = format!("{}/v1/reasoning", self.base_url);
        let raw: RawVerdict = self.read(self.client.post(url).json(context)).await?;
        raw.try_into()
    }
}
