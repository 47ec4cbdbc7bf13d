//! Broker session owner for one account mode.
//!
//! Every session operation (connect, instrument lookup, market data, order
//! placement, status polling) runs behind one async mutex, so the pipeline,
//! the reply poller, the health monitor and the reconciler never interleave
//! calls on the same broker connection.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::execution::{BrokerOrderState, NewTradeExecution, SubmissionResult};
use crate::domain::entities::trade_request::{OrderType, TradeDetails, TradeStatus};
use crate::domain::errors::{GatewayError, StoreError, ValidationError};
use crate::domain::repositories::broker_client::{
    BrokerClient, BrokerEndpoint, BrokerError, Instrument, OrderTicket,
};
use crate::domain::repositories::trade_store::TradeRequestStore;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `n * retry_backoff`
    pub retry_backoff: Duration,
    pub connect_timeout: Duration,
    pub price_timeout: Duration,
    /// How long to poll order status after placement
    pub settle_window: Duration,
    pub settle_poll_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            price_timeout: Duration::from_secs(3),
            settle_window: Duration::from_secs(3),
            settle_poll_interval: Duration::from_millis(500),
        }
    }
}

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub filled: usize,
    pub failed: usize,
}

#[derive(Default)]
struct SessionState {
    instruments: HashMap<String, Instrument>,
    last_error: Option<String>,
}

/// Failure of one submission attempt, before or after reaching the broker
struct AttemptFailure {
    error: GatewayError,
    raw: Option<Value>,
}

impl From<GatewayError> for AttemptFailure {
    fn from(error: GatewayError) -> Self {
        Self { error, raw: None }
    }
}

pub struct ExecutionGateway {
    account_mode: AccountMode,
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn TradeRequestStore>,
    config: GatewayConfig,
    session: Mutex<SessionState>,
}

impl ExecutionGateway {
    pub fn new(
        account_mode: AccountMode,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn TradeRequestStore>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            account_mode,
            broker,
            store,
            config,
            session: Mutex::new(SessionState::default()),
        }
    }

    pub fn account_mode(&self) -> AccountMode {
        self.account_mode
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        self.broker.endpoint()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Last connection failure message, cleared on a successful connect
    pub async fn last_error(&self) -> Option<String> {
        self.session.lock().await.last_error.clone()
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Open the broker session, retrying with linear backoff.
    ///
    /// Returns true immediately when a session is already open. Returns
    /// false only after `max_retries` attempts have failed.
    pub async fn connect(&self, max_retries: u32, backoff: Duration) -> bool {
        let mut session = self.session.lock().await;
        self.connect_locked(&mut session, max_retries, backoff).await
    }

    /// `connect` with the configured retry policy
    pub async fn ensure_connected(&self) -> bool {
        self.connect(self.config.max_retries, self.config.retry_backoff)
            .await
    }

    async fn connect_locked(
        &self,
        session: &mut MutexGuard<'_, SessionState>,
        max_retries: u32,
        backoff: Duration,
    ) -> bool {
        if self.broker.is_connected().await {
            return true;
        }

        let endpoint = self.broker.endpoint().clone();
        let attempts = max_retries.max(1);

        for attempt in 1..=attempts {
            info!(
                "Connecting to {} broker at {} (attempt {}/{})",
                self.account_mode, endpoint, attempt, attempts
            );

            let outcome = match timeout(self.config.connect_timeout, self.broker.open_session()).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(format!(
                    "no answer within {:?}",
                    self.config.connect_timeout
                ))),
            };

            match outcome {
                Ok(()) => {
                    // Instrument ids are only trusted for the session that resolved them
                    session.instruments.clear();
                    session.last_error = None;
                    info!("✅ Connected to {} broker at {}", self.account_mode, endpoint);
                    return true;
                }
                Err(e) => {
                    log_connect_failure(&endpoint, &e);
                    session.last_error = Some(e.to_string());
                }
            }

            if attempt < attempts {
                let delay = backoff * attempt;
                debug!("Retrying {} broker connection in {:?}", self.account_mode, delay);
                sleep(delay).await;
            }
        }

        error!(
            "❌ Could not connect to {} broker at {} after {} attempts",
            self.account_mode, endpoint, attempts
        );
        false
    }

    /// Live check of the broker session
    pub async fn is_connected(&self) -> bool {
        let _session = self.session.lock().await;
        self.broker.is_connected().await
    }

    /// Close the session. Failures are logged and swallowed.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        session.instruments.clear();
        if let Err(e) = self.broker.close_session().await {
            warn!("Error closing {} broker session: {}", self.account_mode, e);
        } else {
            info!("Disconnected from {} broker", self.account_mode);
        }
    }

    // ========================================================================
    // Instruments and market data
    // ========================================================================

    /// Resolve a symbol to a broker instrument, cached per session.
    pub async fn resolve_instrument(&self, symbol: &str) -> Result<Option<Instrument>, GatewayError> {
        let mut session = self.session.lock().await;
        self.resolve_locked(&mut session, symbol).await
    }

    async fn resolve_locked(
        &self,
        session: &mut MutexGuard<'_, SessionState>,
        symbol: &str,
    ) -> Result<Option<Instrument>, GatewayError> {
        if !self.broker.is_connected().await {
            return Err(GatewayError::NotConnected {
                mode: self.account_mode,
            });
        }

        let symbol = symbol.trim().to_uppercase();
        if let Some(instrument) = session.instruments.get(&symbol) {
            return Ok(Some(instrument.clone()));
        }

        let resolved = self.broker.resolve_instrument(&symbol).await?;
        match &resolved {
            Some(instrument) => {
                debug!("Resolved {} to conid {}", symbol, instrument.conid);
                session.instruments.insert(symbol, instrument.clone());
            }
            None => warn!("Broker does not know instrument {}", symbol),
        }
        Ok(resolved)
    }

    /// Best-effort last price. Any failure yields None.
    pub async fn get_market_price(&self, symbol: &str, wait: Duration) -> Option<f64> {
        let mut session = self.session.lock().await;
        let instrument = match self.resolve_locked(&mut session, symbol).await {
            Ok(Some(instrument)) => instrument,
            Ok(None) => return None,
            Err(e) => {
                debug!("No market price for {}: {}", symbol, e);
                return None;
            }
        };
        self.price_locked(&instrument, wait).await
    }

    async fn price_locked(&self, instrument: &Instrument, wait: Duration) -> Option<f64> {
        match timeout(wait, self.broker.market_price(instrument)).await {
            Ok(Ok(Some(price))) if price.is_finite() && price > 0.0 => Some(price),
            Ok(Ok(Some(price))) => {
                warn!("Ignoring invalid market price {} for {}", price, instrument.symbol);
                None
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!("Market data request for {} failed: {}", instrument.symbol, e);
                None
            }
            Err(_) => {
                warn!("Market data for {} timed out after {:?}", instrument.symbol, wait);
                None
            }
        }
    }

    // ========================================================================
    // Order submission
    // ========================================================================

    /// Place one order and wait briefly for it to settle.
    ///
    /// Broker rejections come back as `Ok` with `success == false`; failures
    /// before the order reaches the broker are errors. Either way exactly one
    /// execution row is recorded for the attempt.
    pub async fn submit_order(
        &self,
        trade_id: &str,
        details: &TradeDetails,
    ) -> Result<SubmissionResult, GatewayError> {
        let attempted_at = Utc::now();
        let mut session = self.session.lock().await;
        let outcome = self.place_locked(&mut session, trade_id, details).await;
        drop(session);

        match outcome {
            Ok((result, raw)) => {
                self.record_attempt(NewTradeExecution::from_result(trade_id, &result, raw, attempted_at))
                    .await;
                Ok(result)
            }
            Err(failure) => {
                let row = NewTradeExecution::from_result(
                    trade_id,
                    &SubmissionResult::rejected(failure.error.to_string()),
                    failure.raw,
                    attempted_at,
                );
                self.record_attempt(row).await;
                Err(failure.error)
            }
        }
    }

    async fn place_locked(
        &self,
        session: &mut MutexGuard<'_, SessionState>,
        trade_id: &str,
        details: &TradeDetails,
    ) -> Result<(SubmissionResult, Option<Value>), AttemptFailure> {
        if !details.quantity.is_finite() || details.quantity <= 0.0 {
            return Err(GatewayError::from(ValidationError::InvalidQuantity(details.quantity)).into());
        }
        let limit_price = match details.order_type {
            OrderType::Limit => match details.limit_price {
                Some(price) => Some(price),
                None => {
                    return Err(GatewayError::from(ValidationError::MissingLimitPrice {
                        symbol: details.symbol.clone(),
                    })
                    .into())
                }
            },
            OrderType::Market => None,
        };

        let instrument = self
            .resolve_locked(session, &details.symbol)
            .await?
            .ok_or_else(|| GatewayError::InstrumentNotFound {
                symbol: details.symbol.clone(),
            })?;

        let market_price = self.price_locked(&instrument, self.config.price_timeout).await;
        match (details.order_type, market_price) {
            (OrderType::Limit, None) => {
                return Err(GatewayError::PriceUnavailable {
                    symbol: details.symbol.clone(),
                }
                .into())
            }
            (OrderType::Market, None) => {
                warn!(
                    "No pre-trade price for {}, submitting market order anyway",
                    details.symbol
                );
            }
            (_, Some(price)) => debug!("Pre-trade price for {}: {}", details.symbol, price),
        }

        let ticket = OrderTicket {
            instrument,
            action: details.action,
            quantity: details.quantity,
            order_type: details.order_type,
            limit_price,
            client_order_ref: trade_id.to_string(),
        };

        info!(
            "Placing {} order for trade {}: {}",
            self.account_mode,
            trade_id,
            details.summary()
        );

        let ack = match self.broker.place_order(&ticket).await {
            Ok(ack) => ack,
            Err(BrokerError::OrderRejected(reason)) => {
                warn!("Broker rejected trade {}: {}", trade_id, reason);
                return Ok((SubmissionResult::rejected(reason), None));
            }
            Err(e) => {
                error!("Order placement for trade {} failed: {}", trade_id, e);
                return Err(GatewayError::Broker(e).into());
            }
        };

        let mut state = BrokerOrderState::from_broker(&ack.status);
        let mut reason = ack.reason.clone();
        let mut fill_price = None;
        let mut raw = ack.raw.clone();

        let deadline = Instant::now() + self.config.settle_window;
        while !state.is_settled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.config.settle_poll_interval.min(deadline - now)).await;

            match self.broker.order_status(&ack.order_id).await {
                Ok(report) => {
                    state = BrokerOrderState::from_broker(&report.status);
                    fill_price = report.avg_fill_price.or(fill_price);
                    reason = report.reason.or(reason);
                    raw = report.raw;
                }
                Err(e) => warn!("Status poll for order {} failed: {}", ack.order_id, e),
            }
        }

        let message = match state {
            BrokerOrderState::Rejected => reason.unwrap_or_else(|| "Rejected by broker".to_string()),
            other => format!("Order {} {}", ack.order_id, other),
        };

        if state.is_success() {
            info!("Trade {} order {} is {}", trade_id, ack.order_id, state);
        } else {
            warn!("Trade {} order {} rejected: {}", trade_id, ack.order_id, message);
        }

        Ok((
            SubmissionResult {
                success: state.is_success(),
                order_id: Some(ack.order_id),
                status: state,
                message,
                execution_price: fill_price,
            },
            Some(raw),
        ))
    }

    async fn record_attempt(&self, execution: NewTradeExecution) {
        // The broker already saw the order; losing the row must not hide the result
        if let Err(e) = self.store.record_execution(&execution).await {
            error!(
                "Failed to record execution attempt for trade {}: {}",
                execution.trade_id, e
            );
        }
    }

    // ========================================================================
    // Trade request execution
    // ========================================================================

    /// Submit an approved request at most once.
    pub async fn execute_request(&self, trade_id: &str) -> Result<SubmissionResult, GatewayError> {
        self.submit_from(trade_id, TradeStatus::Approved).await
    }

    /// Try a failed request again
    pub async fn resubmit(&self, trade_id: &str) -> Result<SubmissionResult, GatewayError> {
        self.submit_from(trade_id, TradeStatus::Failed).await
    }

    async fn submit_from(
        &self,
        trade_id: &str,
        from: TradeStatus,
    ) -> Result<SubmissionResult, GatewayError> {
        let request = self
            .store
            .get_request(trade_id)
            .await?
            .ok_or_else(|| GatewayError::RequestNotFound {
                trade_id: trade_id.to_string(),
            })?;

        // A request only ever runs on the session of its own account
        if request.details.account_mode != self.account_mode {
            warn!(
                "Trade {} is for the {} account, refused by the {} gateway",
                trade_id, request.details.account_mode, self.account_mode
            );
            return Err(GatewayError::WrongAccount {
                trade_id: trade_id.to_string(),
                expected: self.account_mode,
                actual: request.details.account_mode,
            });
        }

        // Leave the request untouched when there is no session to submit on
        if !self.ensure_connected().await {
            return Err(GatewayError::NotConnected {
                mode: self.account_mode,
            });
        }

        match self
            .store
            .transition(trade_id, from, TradeStatus::Submitted)
            .await
        {
            Ok(()) => {}
            Err(StoreError::StatusConflict { actual, .. }) => {
                return Err(match actual {
                    TradeStatus::Submitted | TradeStatus::Filled | TradeStatus::Failed => {
                        warn!(
                            "Duplicate submission refused for trade {} (already {})",
                            trade_id, actual
                        );
                        GatewayError::DuplicateSubmission {
                            trade_id: trade_id.to_string(),
                            status: actual,
                        }
                    }
                    other => GatewayError::NotApproved {
                        trade_id: trade_id.to_string(),
                        status: other,
                    },
                });
            }
            Err(e) => return Err(e.into()),
        }

        match self.submit_order(trade_id, &request.details).await {
            Ok(result) => {
                let next = match result.status {
                    BrokerOrderState::Filled => Some(TradeStatus::Filled),
                    BrokerOrderState::Rejected => Some(TradeStatus::Failed),
                    _ => None,
                };
                if let Some(next) = next {
                    self.store
                        .transition(trade_id, TradeStatus::Submitted, next)
                        .await?;
                }
                Ok(result)
            }
            Err(e) => {
                if let Err(store_err) = self
                    .store
                    .transition(trade_id, TradeStatus::Submitted, TradeStatus::Failed)
                    .await
                {
                    error!(
                        "Could not mark trade {} failed after submission error: {}",
                        trade_id, store_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Poll the broker for requests still sitting in `submitted` and settle
    /// the ones that have filled or been rejected.
    pub async fn reconcile_submitted(&self) -> Result<ReconcileSummary, GatewayError> {
        let submitted = self.store.list_by_status(TradeStatus::Submitted).await?;
        let mut summary = ReconcileSummary::default();

        for request in submitted
            .into_iter()
            .filter(|r| r.details.account_mode == self.account_mode)
        {
            let executions = self.store.executions_for(&request.trade_id).await?;
            let Some(order_id) = executions.iter().rev().find_map(|e| e.order_id.clone()) else {
                warn!("Submitted trade {} has no broker order id", request.trade_id);
                continue;
            };

            let report = {
                let _session = self.session.lock().await;
                if !self.broker.is_connected().await {
                    debug!("Skipping reconciliation, {} broker not connected", self.account_mode);
                    return Ok(summary);
                }
                self.broker.order_status(&order_id).await
            };
            summary.checked += 1;

            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    warn!("Status lookup for order {} failed: {}", order_id, e);
                    continue;
                }
            };

            let next = match BrokerOrderState::from_broker(&report.status) {
                BrokerOrderState::Filled => TradeStatus::Filled,
                BrokerOrderState::Rejected => TradeStatus::Failed,
                _ => continue,
            };

            match self
                .store
                .transition(&request.trade_id, TradeStatus::Submitted, next)
                .await
            {
                Ok(()) => {
                    info!("Reconciled trade {} to {}", request.trade_id, next);
                    if next == TradeStatus::Filled {
                        summary.filled += 1;
                    } else {
                        summary.failed += 1;
                    }
                }
                // Settled concurrently by the submitting task
                Err(StoreError::StatusConflict { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(summary)
    }
}

fn log_connect_failure(endpoint: &BrokerEndpoint, error: &BrokerError) {
    match error {
        BrokerError::ConnectionRefused(_) => error!(
            "Connection refused by {}: is the broker gateway running with the API enabled on port {}?",
            endpoint, endpoint.port
        ),
        BrokerError::Timeout(detail) => warn!(
            "Connection to {} timed out ({}): check the network path and gateway load",
            endpoint, detail
        ),
        BrokerError::ClientIdInUse(id) => error!(
            "Client id {} is already in use at {}: another session holds it, configure a different client id",
            id, endpoint
        ),
        other => error!("Broker connection to {} failed: {}", endpoint, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    use crate::domain::entities::trade_request::{TradeAction, TradeRequest};
    use crate::domain::errors::ErrorKind;
    use crate::domain::test_support::{memory_store, MockBroker};
    use crate::persistence::repository::SqliteStore;

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            max_retries: 3,
            retry_backoff: Duration::from_millis(5),
            connect_timeout: Duration::from_millis(200),
            price_timeout: Duration::from_millis(100),
            settle_window: Duration::from_millis(60),
            settle_poll_interval: Duration::from_millis(10),
        }
    }

    async fn setup() -> (ExecutionGateway, Arc<MockBroker>, Arc<SqliteStore>) {
        let broker = Arc::new(MockBroker::new());
        let store = memory_store().await;
        let gateway = ExecutionGateway::new(
            AccountMode::Paper,
            broker.clone(),
            store.clone(),
            fast_config(),
        );
        (gateway, broker, store)
    }

    async fn approved_request(store: &SqliteStore, trade_id: &str, details: TradeDetails) {
        let now = Utc::now();
        let request = TradeRequest::new_pending(
            trade_id.to_string(),
            "ABC234".to_string(),
            details,
            now,
            now + ChronoDuration::minutes(15),
        );
        store.create_request(&request).await.unwrap();
        store
            .transition(trade_id, TradeStatus::Pending, TradeStatus::Approved)
            .await
            .unwrap();
    }

    fn aapl() -> TradeDetails {
        TradeDetails::market("AAPL", TradeAction::Buy, 10.0, AccountMode::Paper).unwrap()
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (gateway, broker, _) = setup().await;
        assert!(gateway.connect(3, Duration::from_millis(1)).await);
        assert!(gateway.connect(3, Duration::from_millis(1)).await);
        assert_eq!(broker.open_calls(), 1);
        assert!(gateway.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let (gateway, broker, _) = setup().await;
        broker.fail_next_opens(vec![
            BrokerError::ConnectionRefused("127.0.0.1:7497".to_string()),
            BrokerError::Timeout("slow".to_string()),
        ]);
        assert!(gateway.connect(3, Duration::from_millis(1)).await);
        assert_eq!(broker.open_calls(), 3);
        assert!(gateway.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_retries() {
        let (gateway, broker, _) = setup().await;
        broker.fail_next_opens(vec![BrokerError::ClientIdInUse(1); 5]);
        assert!(!gateway.connect(2, Duration::from_millis(1)).await);
        assert_eq!(broker.open_calls(), 2);
        assert!(gateway
            .last_error()
            .await
            .unwrap()
            .contains("already in use"));
    }

    #[tokio::test]
    async fn test_resolve_fails_fast_when_disconnected() {
        let (gateway, broker, _) = setup().await;
        let result = gateway.resolve_instrument("AAPL").await;
        assert!(matches!(result, Err(GatewayError::NotConnected { .. })));
        assert_eq!(broker.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn test_instruments_cached_per_session() {
        let (gateway, broker, _) = setup().await;
        assert!(gateway.ensure_connected().await);
        assert!(gateway.resolve_instrument("AAPL").await.unwrap().is_some());
        assert!(gateway.resolve_instrument("aapl").await.unwrap().is_some());
        assert_eq!(broker.resolve_calls(), 1);

        // a new session resolves again
        gateway.disconnect().await;
        assert!(gateway.ensure_connected().await);
        gateway.resolve_instrument("AAPL").await.unwrap();
        assert_eq!(broker.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn test_market_price_is_best_effort() {
        let (gateway, broker, _) = setup().await;
        assert_eq!(gateway.get_market_price("AAPL", Duration::from_millis(50)).await, None);

        gateway.ensure_connected().await;
        broker.set_price("AAPL", 187.5);
        assert_eq!(
            gateway.get_market_price("AAPL", Duration::from_millis(50)).await,
            Some(187.5)
        );
    }

    #[tokio::test]
    async fn test_limit_order_without_price_is_fatal() {
        let (gateway, broker, store) = setup().await;
        let details = TradeDetails::new(
            "MSFT",
            TradeAction::Sell,
            5.0,
            OrderType::Limit,
            Some(410.5),
            AccountMode::Paper,
        )
        .unwrap();
        approved_request(&store, "A00000000001", details.clone()).await;
        gateway.ensure_connected().await;

        let result = gateway.submit_order("A00000000001", &details).await;
        assert!(matches!(result, Err(GatewayError::PriceUnavailable { .. })));
        assert!(broker.placed_orders().is_empty());

        let rows = store.executions_for("A00000000001").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, BrokerOrderState::Rejected);
    }

    #[tokio::test]
    async fn test_market_order_without_price_proceeds() {
        let (gateway, broker, store) = setup().await;
        approved_request(&store, "A00000000002", aapl()).await;
        gateway.ensure_connected().await;

        let result = gateway.submit_order("A00000000002", &aapl()).await.unwrap();
        assert!(result.success);
        assert_eq!(broker.placed_orders().len(), 1);
        assert_eq!(broker.placed_orders()[0].client_order_ref, "A00000000002");
    }

    #[tokio::test]
    async fn test_submission_settles_to_filled() {
        let (gateway, broker, store) = setup().await;
        approved_request(&store, "A00000000003", aapl()).await;
        broker.script_statuses(&["PreSubmitted", "Filled"]);
        broker.set_fill_price(187.25);

        let result = gateway.execute_request("A00000000003").await.unwrap();
        assert!(result.success);
        assert_eq!(result.status, BrokerOrderState::Filled);
        assert_eq!(result.execution_price, Some(187.25));

        let stored = store.get_request("A00000000003").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Filled);
        let rows = store.executions_for("A00000000003").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, BrokerOrderState::Filled);
    }

    #[tokio::test]
    async fn test_unsettled_order_stays_submitted() {
        let (gateway, broker, store) = setup().await;
        approved_request(&store, "A00000000004", aapl()).await;
        broker.script_statuses(&["PreSubmitted"]);

        let result = gateway.execute_request("A00000000004").await.unwrap();
        assert!(result.success);
        assert_eq!(result.status, BrokerOrderState::PreSubmitted);
        let stored = store.get_request("A00000000004").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Submitted);

        // later the broker reports the fill
        broker.script_statuses(&["Filled"]);
        let summary = gateway.reconcile_submitted().await.unwrap();
        assert_eq!(summary, ReconcileSummary { checked: 1, filled: 1, failed: 0 });
        let stored = store.get_request("A00000000004").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Filled);
    }

    #[tokio::test]
    async fn test_broker_rejection_marks_failed_and_resubmit() {
        let (gateway, broker, store) = setup().await;
        approved_request(&store, "A00000000005", aapl()).await;
        broker.reject_orders(Some("insufficient buying power"));

        let result = gateway.execute_request("A00000000005").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.message, "insufficient buying power");
        let stored = store.get_request("A00000000005").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Failed);

        broker.reject_orders(None);
        broker.script_statuses(&["Filled"]);
        let retried = gateway.resubmit("A00000000005").await.unwrap();
        assert!(retried.success);
        assert_eq!(store.executions_for("A00000000005").await.unwrap().len(), 2);
        let stored = store.get_request("A00000000005").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Filled);
    }

    #[tokio::test]
    async fn test_second_execute_is_duplicate() {
        let (gateway, broker, store) = setup().await;
        approved_request(&store, "A00000000006", aapl()).await;

        gateway.execute_request("A00000000006").await.unwrap();
        let again = gateway.execute_request("A00000000006").await;
        assert!(matches!(again, Err(GatewayError::DuplicateSubmission { .. })));
        assert_eq!(broker.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_request_is_not_executed() {
        let (gateway, broker, store) = setup().await;
        let now = Utc::now();
        let request = TradeRequest::new_pending(
            "A00000000007".to_string(),
            "XYZ789".to_string(),
            aapl(),
            now,
            now + ChronoDuration::minutes(15),
        );
        store.create_request(&request).await.unwrap();

        let result = gateway.execute_request("A00000000007").await;
        assert!(matches!(
            result,
            Err(GatewayError::NotApproved { status: TradeStatus::Pending, .. })
        ));
        assert!(broker.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_live_request_refused_by_paper_gateway() {
        let (gateway, broker, store) = setup().await;
        let live = TradeDetails::market("AAPL", TradeAction::Buy, 10.0, AccountMode::Live).unwrap();
        approved_request(&store, "A00000000011", live).await;

        let result = gateway.execute_request("A00000000011").await;
        match result {
            Err(e @ GatewayError::WrongAccount { .. }) => {
                assert_eq!(e.kind(), ErrorKind::Validation);
            }
            other => panic!("expected a wrong-account refusal, got {:?}", other),
        }

        assert!(broker.placed_orders().is_empty());
        let stored = store.get_request("A00000000011").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Approved);
        assert!(store.executions_for("A00000000011").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_without_connection_keeps_request_approved() {
        let (gateway, broker, store) = setup().await;
        approved_request(&store, "A00000000008", aapl()).await;
        broker.fail_next_opens(vec![BrokerError::ConnectionRefused("gw".to_string()); 3]);

        let result = gateway.execute_request("A00000000008").await;
        assert!(matches!(result, Err(GatewayError::NotConnected { .. })));
        let stored = store.get_request("A00000000008").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Approved);
    }

    #[tokio::test]
    async fn test_unknown_instrument_fails_request() {
        let (gateway, broker, store) = setup().await;
        let details = TradeDetails::market("ZZZZ", TradeAction::Buy, 1.0, AccountMode::Paper).unwrap();
        approved_request(&store, "A00000000009", details).await;
        broker.mark_unknown("ZZZZ");

        let result = gateway.execute_request("A00000000009").await;
        assert!(matches!(result, Err(GatewayError::InstrumentNotFound { .. })));
        let stored = store.get_request("A00000000009").await.unwrap().unwrap();
        assert_eq!(stored.status, TradeStatus::Failed);
        assert_eq!(store.executions_for("A00000000009").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_never_fails() {
        let (gateway, _, _) = setup().await;
        gateway.disconnect().await;
        gateway.ensure_connected().await;
        gateway.disconnect().await;
        assert!(!gateway.is_connected().await);
    }
}
