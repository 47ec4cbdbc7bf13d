//! Hand-written mock ports shared by unit and scenario tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::domain::entities::decision::ReasoningDecision;
use crate::domain::repositories::broker_client::{
    BrokerClient, BrokerEndpoint, BrokerError, BrokerResult, Instrument, OrderAck, OrderReport,
    OrderTicket,
};
use crate::domain::repositories::notification::{
    InboundMessage, NotificationError, NotificationService,
};
use crate::domain::repositories::oracles::{
    Forecast, ForecastOracle, MarketDataSource, OracleError, PriceBar, ReasoningContext,
    ReasoningOracle, ReasoningVerdict, TrustAssessment, TrustOracle,
};
use crate::persistence::init_database;
use crate::persistence::repository::SqliteStore;

pub async fn memory_store() -> Arc<SqliteStore> {
    let pool = init_database("sqlite::memory:")
        .await
        .expect("in-memory database");
    Arc::new(SqliteStore::new(pool))
}

/// Notification channel recording outbound messages and serving scripted replies
#[derive(Default)]
pub struct MockNotifier {
    sent: Mutex<Vec<String>>,
    inbound: Mutex<Vec<InboundMessage>>,
    fail: AtomicBool,
    fail_inbound: AtomicBool,
    send_delay: Mutex<std::time::Duration>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inbound(&self, fail: bool) {
        self.fail_inbound.store(fail, Ordering::SeqCst);
    }

    /// Hold every send for `delay` before it completes
    pub fn delay_sends(&self, delay: std::time::Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub async fn push_reply(&self, id: &str, body: &str, sent_at: DateTime<Utc>) {
        self.inbound.lock().unwrap().push(InboundMessage {
            id: id.to_string(),
            body: body.to_string(),
            from: "+15550001111".to_string(),
            sent_at,
        });
    }
}

#[async_trait]
impl NotificationService for MockNotifier {
    async fn send(&self, message: &str) -> Result<(), NotificationError> {
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotificationError::Transport("provider unreachable".to_string()));
        }
        self.sent.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn list_recent_inbound(&self, limit: usize) -> Result<Vec<InboundMessage>, NotificationError> {
        if self.fail_inbound.load(Ordering::SeqCst) {
            return Err(NotificationError::Transport("inbound listing unavailable".to_string()));
        }
        let mut messages = self.inbound.lock().unwrap().clone();
        messages.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        messages.truncate(limit);
        Ok(messages)
    }
}

/// Scriptable broker session
pub struct MockBroker {
    endpoint: BrokerEndpoint,
    session_open: AtomicBool,
    open_failures: Mutex<VecDeque<BrokerError>>,
    open_calls: AtomicUsize,
    resolve_calls: AtomicUsize,
    prices: Mutex<HashMap<String, f64>>,
    unknown_symbols: Mutex<HashSet<String>>,
    placed: Mutex<Vec<OrderTicket>>,
    ack_status: Mutex<String>,
    status_script: Mutex<VecDeque<String>>,
    reject_reason: Mutex<Option<String>>,
    fill_price: Mutex<Option<f64>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            endpoint: BrokerEndpoint {
                host: "127.0.0.1".to_string(),
                port: 7497,
                client_id: 1,
            },
            session_open: AtomicBool::new(false),
            open_failures: Mutex::new(VecDeque::new()),
            open_calls: AtomicUsize::new(0),
            resolve_calls: AtomicUsize::new(0),
            prices: Mutex::new(HashMap::new()),
            unknown_symbols: Mutex::new(HashSet::new()),
            placed: Mutex::new(Vec::new()),
            ack_status: Mutex::new("Submitted".to_string()),
            status_script: Mutex::new(VecDeque::new()),
            reject_reason: Mutex::new(None),
            fill_price: Mutex::new(None),
        }
    }

    /// Simulate the session dropping or coming back
    pub fn set_connected(&self, connected: bool) {
        self.session_open.store(connected, Ordering::SeqCst);
    }

    pub fn fail_next_opens(&self, errors: Vec<BrokerError>) {
        self.open_failures.lock().unwrap().extend(errors);
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(symbol.to_string(), price);
    }

    pub fn mark_unknown(&self, symbol: &str) {
        self.unknown_symbols.lock().unwrap().insert(symbol.to_string());
    }

    /// Statuses returned by successive `order_status` calls; the last one sticks
    pub fn script_statuses(&self, statuses: &[&str]) {
        let mut script = self.status_script.lock().unwrap();
        script.clear();
        script.extend(statuses.iter().map(|s| s.to_string()));
    }

    pub fn reject_orders(&self, reason: Option<&str>) {
        *self.reject_reason.lock().unwrap() = reason.map(str::to_string);
    }

    pub fn set_fill_price(&self, price: f64) {
        *self.fill_price.lock().unwrap() = Some(price);
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn placed_orders(&self) -> Vec<OrderTicket> {
        self.placed.lock().unwrap().clone()
    }

    fn require_session(&self) -> BrokerResult<()> {
        if self.session_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn next_status(&self) -> String {
        let mut script = self.status_script.lock().unwrap();
        match script.len() {
            0 => self.ack_status.lock().unwrap().clone(),
            1 => script[0].clone(),
            _ => script.pop_front().unwrap_or_default(),
        }
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    async fn open_session(&self) -> BrokerResult<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.open_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if self.session_open.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::ClientIdInUse(self.endpoint.client_id));
        }
        Ok(())
    }

    async fn close_session(&self) -> BrokerResult<()> {
        self.session_open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }

    async fn resolve_instrument(&self, symbol: &str) -> BrokerResult<Option<Instrument>> {
        self.require_session()?;
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.unknown_symbols.lock().unwrap().contains(symbol) {
            return Ok(None);
        }
        let conid = symbol.bytes().map(i64::from).sum::<i64>() + 1000;
        Ok(Some(Instrument {
            conid,
            symbol: symbol.to_string(),
            exchange: "SMART".to_string(),
            currency: "USD".to_string(),
        }))
    }

    async fn market_price(&self, instrument: &Instrument) -> BrokerResult<Option<f64>> {
        self.require_session()?;
        Ok(self.prices.lock().unwrap().get(&instrument.symbol).copied())
    }

    async fn place_order(&self, ticket: &OrderTicket) -> BrokerResult<OrderAck> {
        self.require_session()?;
        if let Some(reason) = self.reject_reason.lock().unwrap().clone() {
            return Err(BrokerError::OrderRejected(reason));
        }
        let mut placed = self.placed.lock().unwrap();
        placed.push(ticket.clone());
        let order_id = (1000 + placed.len()).to_string();
        let status = self.ack_status.lock().unwrap().clone();
        let reason = if status.eq_ignore_ascii_case("rejected") {
            Some("rejected by mock broker".to_string())
        } else {
            None
        };
        Ok(OrderAck {
            raw: serde_json::json!({"orderId": order_id, "status": status}),
            order_id,
            status,
            reason,
        })
    }

    async fn order_status(&self, order_id: &str) -> BrokerResult<OrderReport> {
        self.require_session()?;
        let status = self.next_status();
        let filled = status.eq_ignore_ascii_case("filled");
        Ok(OrderReport {
            order_id: order_id.to_string(),
            raw: serde_json::json!({"orderId": order_id, "status": status}),
            filled_quantity: if filled { 1.0 } else { 0.0 },
            avg_fill_price: if filled {
                *self.fill_price.lock().unwrap()
            } else {
                None
            },
            reason: None,
            status,
        })
    }
}

/// Price history served from a fixed close series
pub struct StaticMarketData {
    closes: Vec<f64>,
}

impl StaticMarketData {
    pub fn new(closes: Vec<f64>) -> Self {
        Self { closes }
    }
}

#[async_trait]
impl MarketDataSource for StaticMarketData {
    async fn price_history(&self, _symbol: &str, lookback: usize) -> Result<Vec<PriceBar>, OracleError> {
        let closes = &self.closes;
        let start = closes.len().saturating_sub(lookback);
        let now = Utc::now();
        let count = closes.len() - start;
        Ok(closes[start..]
            .iter()
            .enumerate()
            .map(|(i, close)| PriceBar {
                timestamp: now - ChronoDuration::minutes((count - i) as i64),
                close: *close,
                volume: None,
            })
            .collect())
    }
}

pub struct StaticForecast {
    pub result: Result<Forecast, OracleError>,
}

impl StaticForecast {
    pub fn point(point: f64) -> Self {
        Self {
            result: Ok(Forecast {
                forecast_id: Some(7),
                point,
                lower_bound: point * 0.98,
                upper_bound: point * 1.02,
            }),
        }
    }
}

#[async_trait]
impl ForecastOracle for StaticForecast {
    async fn forecast(&self, _symbol: &str, _series: &[f64], _horizon: usize) -> Result<Forecast, OracleError> {
        self.result.clone()
    }
}

/// Trust assessments served in call order, then `fallback`
pub struct ScriptedTrust {
    queue: Mutex<VecDeque<TrustAssessment>>,
    fallback: TrustAssessment,
}

impl ScriptedTrust {
    pub fn always(assessment: TrustAssessment) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: assessment,
        }
    }

    pub fn then(self, assessment: TrustAssessment) -> Self {
        self.queue.lock().unwrap().push_back(assessment);
        self
    }
}

pub fn trusted() -> TrustAssessment {
    TrustAssessment {
        trust_score: 0.9,
        is_trusted: true,
        rejection_reasons: vec![],
        drift_score: 0.05,
        coherence_score: 0.9,
        model_reliability: 0.9,
    }
}

#[async_trait]
impl TrustOracle for ScriptedTrust {
    async fn evaluate(&self, _forecast: &Forecast, _input: &[f64]) -> Result<TrustAssessment, OracleError> {
        let next = self.queue.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

pub struct StaticReasoning {
    verdict: ReasoningVerdict,
    calls: AtomicUsize,
}

impl StaticReasoning {
    pub fn new(decision: ReasoningDecision, confidence: f64) -> Self {
        Self {
            verdict: ReasoningVerdict {
                decision,
                confidence,
                rationale: "scripted".to_string(),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningOracle for StaticReasoning {
    async fn decide(&self, _context: &ReasoningContext) -> Result<ReasoningVerdict, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.clone())
    }
}

/// Gently rising series with low realized volatility
pub fn calm_series(len: usize) -> Vec<f64> {
    (0..len).map(|i| 100.0 + i as f64 * 0.1).collect()
}
