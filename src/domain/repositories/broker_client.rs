//! Broker session port.
//!
//! A `BrokerClient` is one stateful session keyed by host, port and client
//! id. Opening a second session under the same client id is refused by the
//! broker, so callers must serialize access (see `ExecutionGateway`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::trade_request::{OrderType, TradeAction};

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Connection refused by {0}")]
    ConnectionRefused(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Client id {0} is already in use")]
    ClientIdInUse(u32),

    #[error("No open broker session")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl BrokerError {
    /// Failures that a reconnect may cure
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionRefused(_)
                | BrokerError::Timeout(_)
                | BrokerError::ClientIdInUse(_)
                | BrokerError::NotConnected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub client_id: u32,
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (client {})", self.host, self.port, self.client_id)
    }
}

/// Tradable contract as known to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub conid: i64,
    pub symbol: String,
    pub exchange: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderTicket {
    pub instrument: Instrument,
    pub action: TradeAction,
    pub quantity: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    /// Our trade id, echoed back by the broker
    pub client_order_ref: String,
}

/// Broker acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
    pub reason: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderReport {
    pub order_id: String,
    pub status: String,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub reason: Option<String>,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn endpoint(&self) -> &BrokerEndpoint;

    /// Open the session. Fails with `ClientIdInUse` if another session holds the id.
    async fn open_session(&self) -> BrokerResult<()>;

    async fn close_session(&self) -> BrokerResult<()>;

    /// Live check against the broker, not a cached flag
    async fn is_connected(&self) -> bool;

    async fn resolve_instrument(&self, symbol: &str) -> BrokerResult<Option<Instrument>>;

    /// Last traded price, `None` when the broker has no quote
    async fn market_price(&self, instrument: &Instrument) -> BrokerResult<Option<f64>>;

    async fn place_order(&self, ticket: &OrderTicket) -> BrokerResult<OrderAck>;

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderReport>;
}
