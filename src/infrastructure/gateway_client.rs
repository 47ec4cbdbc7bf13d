//! REST broker gateway client.
//!
//! The gateway fronts one brokerage session per client id. Opening a session
//! for a client id that is already attached answers HTTP 409.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::domain::entities::trade_request::{OrderType, TradeAction};
use crate::domain::repositories::broker_client::{
    BrokerClient, BrokerEndpoint, BrokerError, BrokerResult, Instrument, OrderAck, OrderReport,
    OrderTicket,
};

const USER_AGENT: &str = concat!("tradegate/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct GatewayClientConfig {
    pub base_url: String,
    pub endpoint: BrokerEndpoint,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct SessionRequest {
    client_id: u32,
}

#[derive(Debug, Deserialize)]
struct SessionState {
    connected: bool,
}

#[derive(Debug, Serialize, PartialEq)]
struct GatewayOrder {
    conid: i64,
    symbol: String,
    side: &'static str,
    quantity: f64,
    order_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<f64>,
    client_order_ref: String,
    time_in_force: &'static str,
}

impl GatewayOrder {
    fn from_ticket(ticket: &OrderTicket) -> Self {
        Self {
            conid: ticket.instrument.conid,
            symbol: ticket.instrument.symbol.clone(),
            side: match ticket.action {
                TradeAction::Buy => "BUY",
                TradeAction::Sell => "SELL",
            },
            quantity: ticket.quantity,
            order_type: match ticket.order_type {
                OrderType::Market => "MKT",
                OrderType::Limit => "LMT",
            },
            limit_price: ticket.limit_price,
            client_order_ref: ticket.client_order_ref.clone(),
            time_in_force: "DAY",
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    filled_quantity: Option<f64>,
    #[serde(default)]
    avg_fill_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MarketSnapshot {
    #[serde(default)]
    last: Option<f64>,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
}

impl MarketSnapshot {
    /// Last trade, or the bid/ask midpoint when there is none
    fn price(&self) -> Option<f64> {
        let positive = |p: &f64| p.is_finite() && *p > 0.0;
        match (self.last.filter(positive), self.bid.filter(positive), self.ask.filter(positive)) {
            (Some(last), _, _) => Some(last),
            (None, Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }
}

pub struct GatewayClient {
    client: Client,
    config: GatewayClientConfig,
    token: Option<Zeroizing<String>>,
}

impl GatewayClient {
    pub fn new(config: GatewayClientConfig, token: Option<Zeroizing<String>>) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BrokerError::Protocol(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("X-Client-Id", self.config.endpoint.client_id.to_string());
        match &self.token {
            Some(token) => request.bearer_auth(token.as_str()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> BrokerResult<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, error: reqwest::Error) -> BrokerError {
        if error.is_timeout() {
            BrokerError::Timeout(format!("{}: {}", self.config.endpoint, error))
        } else if error.is_connect() {
            BrokerError::ConnectionRefused(self.config.endpoint.to_string())
        } else {
            BrokerError::Protocol(error.to_string())
        }
    }

    async fn json_body(response: Response) -> BrokerResult<Value> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BrokerError::Http {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| BrokerError::Protocol(format!("Invalid gateway response: {}", e)))
    }

    fn decode<T: for<'de> Deserialize<'de>>(value: &Value) -> BrokerResult<T> {
        serde_json::from_value(value.clone())
            .map_err(|e| BrokerError::Protocol(format!("Unexpected gateway payload: {}", e)))
    }
}

#[async_trait]
impl BrokerClient for GatewayClient {
    fn endpoint(&self) -> &BrokerEndpoint {
        &self.config.endpoint
    }

    async fn open_session(&self) -> BrokerResult<()> {
        let request = self.client.post(self.url("/v1/session")).json(&SessionRequest {
            client_id: self.config.endpoint.client_id,
        });
        let response = self.send(request).await?;

        match response.status() {
            StatusCode::CONFLICT => Err(BrokerError::ClientIdInUse(self.config.endpoint.client_id)),
            status if status.is_success() => {
                info!("Broker gateway session opened at {}", self.config.endpoint);
                Ok(())
            }
            status => Err(BrokerError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn close_session(&self) -> BrokerResult<()> {
        let request = self
            .client
            .delete(self.url("/v1/session"))
            .query(&[("client_id", self.config.endpoint.client_id)]);
        let response = self.send(request).await?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(BrokerError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn is_connected(&self) -> bool {
        let request = self
            .client
            .get(self.url("/v1/session"))
            .query(&[("client_id", self.config.endpoint.client_id)]);
        let response = match self.send(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Session check failed: {}", e);
                return false;
            }
        };
        match Self::json_body(response).await {
            Ok(value) => Self::decode::<SessionState>(&value)
                .map(|s| s.connected)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn resolve_instrument(&self, symbol: &str) -> BrokerResult<Option<Instrument>> {
        let path = format!("/v1/instruments/{}", symbol);
        let response = self.send(self.client.get(self.url(&path))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = Self::json_body(response).await?;
        Self::decode(&value).map(Some)
    }

    async fn market_price(&self, instrument: &Instrument) -> BrokerResult<Option<f64>> {
        let path = format!("/v1/marketdata/{}", instrument.conid);
        let response = self.send(self.client.get(self.url(&path))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = Self::json_body(response).await?;
        Ok(Self::decode::<MarketSnapshot>(&value)?.price())
    }

    async fn place_order(&self, ticket: &OrderTicket) -> BrokerResult<OrderAck> {
        let order = GatewayOrder::from_ticket(ticket);
        let response = self
            .send(self.client.post(self.url("/v1/orders")).json(&order))
            .await?;

        let value = match Self::json_body(response).await {
            Ok(value) => value,
            // The gateway refuses invalid orders with a client error and a reason
            Err(BrokerError::Http { status, body }) if (400..500).contains(&status) && status != 409 => {
                return Err(BrokerError::OrderRejected(body));
            }
            Err(e) => return Err(e),
        };

        let parsed: OrderResponse = Self::decode(&value)?;
        Ok(OrderAck {
            order_id: parsed.order_id,
            status: parsed.status,
            reason: parsed.reason,
            raw: value,
        })
    }

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderReport> {
        let path = format!("/v1/orders/{}", order_id);
        let response = self.send(self.client.get(self.url(&path))).await?;
        let value = Self::json_body(response).await?;
        let parsed: OrderResponse = Self::decode(&value)?;

        Ok(OrderReport {
            order_id: parsed.order_id,
            status: parsed.status,
            filled_quantity: parsed.filled_quantity.unwrap_or(0.0),
            avg_fill_price: parsed.avg_fill_price,
            reason: parsed.reason,
            raw: value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket(order_type: OrderType, limit_price: Option<f64>) -> OrderTicket {
        OrderTicket {
            instrument: Instrument {
                conid: 265598,
                symbol: "AAPL".to_string(),
                exchange: "SMART".to_string(),
                currency: "USD".to_string(),
            },
            action: TradeAction::Sell,
            quantity: 5.0,
            order_type,
            limit_price,
            client_order_ref: "0A1B2C3D4E5F".to_string(),
        }
    }

    #[test]
    fn test_order_body_matches_gateway_format() {
        let body = serde_json::to_value(GatewayOrder::from_ticket(&ticket(OrderType::Limit, Some(187.5))))
            .unwrap();
        assert_eq!(
            body,
            json!({
                "conid": 265598,
                "symbol": "AAPL",
                "side": "SELL",
                "quantity": 5.0,
                "order_type": "LMT",
                "limit_price": 187.5,
                "client_order_ref": "0A1B2C3D4E5F",
                "time_in_force": "DAY"
            })
        );

        let market = serde_json::to_value(GatewayOrder::from_ticket(&ticket(OrderType::Market, None))).unwrap();
        assert!(market.get("limit_price").is_none());
        assert_eq!(market["order_type"], "MKT");
    }

    #[test]
    fn test_snapshot_price_prefers_last_trade() {
        let snapshot: MarketSnapshot =
            serde_json::from_value(json!({"last": 101.0, "bid": 100.0, "ask": 100.5})).unwrap();
        assert_eq!(snapshot.price(), Some(101.0));

        let snapshot: MarketSnapshot = serde_json::from_value(json!({"bid": 100.0, "ask": 101.0})).unwrap();
        assert_eq!(snapshot.price(), Some(100.5));

        let snapshot: MarketSnapshot = serde_json::from_value(json!({"last": 0.0, "bid": 100.0})).unwrap();
        assert_eq!(snapshot.price(), None);
    }

    #[test]
    fn test_order_status_payload_decodes() {
        let value = json!({
            "order_id": "4711",
            "status": "Filled",
            "filled_quantity": 5.0,
            "avg_fill_price": 187.42
        });
        let parsed: OrderResponse = GatewayClient::decode(&value).unwrap();
        assert_eq!(parsed.order_id, "4711");
        assert_eq!(parsed.avg_fill_price, Some(187.42));
        assert!(parsed.reason.is_none());
    }
}
