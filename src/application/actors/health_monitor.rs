//! Connection Health Monitor Actor
//!
//! Periodically checks one broker session, reconnects it when it has dropped
//! and persists the resulting `ConnectionStatus`. One actor runs per account
//! mode. It is the only component that keeps retrying forever; everything
//! else gives up after a bounded number of attempts.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::application::services::execution_gateway::ExecutionGateway;
use crate::domain::entities::connection_status::ConnectionStatus;
use crate::domain::repositories::trade_store::ConnectionStatusStore;

/// Channel capacity for health monitor messages
const HEALTH_CHANNEL_CAPACITY: usize = 100;

/// Messages that can be sent to the health monitor
#[derive(Debug)]
pub enum HealthMessage {
    /// Run a check immediately instead of waiting for the next tick
    CheckNow {
        reply: mpsc::Sender<ConnectionStatus>,
    },

    /// Get the status from the last check
    GetStatus {
        reply: mpsc::Sender<ConnectionStatus>,
    },

    /// Shutdown the actor
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub auto_reconnect: bool,
    /// Connect attempts per check
    pub reconnect_retries: u32,
    pub reconnect_backoff: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            auto_reconnect: true,
            reconnect_retries: 3,
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

pub struct ConnectionHealthMonitor {
    gateway: Arc<ExecutionGateway>,
    store: Arc<dyn ConnectionStatusStore>,
    config: HealthMonitorConfig,
    status: ConnectionStatus,
}

impl ConnectionHealthMonitor {
    pub fn new(
        gateway: Arc<ExecutionGateway>,
        store: Arc<dyn ConnectionStatusStore>,
        config: HealthMonitorConfig,
    ) -> Self {
        let endpoint = gateway.endpoint();
        let status = ConnectionStatus::new(
            gateway.account_mode(),
            &endpoint.host,
            endpoint.port,
            endpoint.client_id,
        );
        Self {
            gateway,
            store,
            config,
            status,
        }
    }

    /// Spawn the monitor loop
    pub fn spawn(
        gateway: Arc<ExecutionGateway>,
        store: Arc<dyn ConnectionStatusStore>,
        config: HealthMonitorConfig,
    ) -> mpsc::Sender<HealthMessage> {
        let (tx, rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);

        let monitor = Self::new(gateway, store, config);
        let mode = monitor.status.account_mode;

        tokio::spawn(async move {
            monitor.run(rx).await;
        });

        info!("ConnectionHealthMonitor spawned for {} account", mode);
        tx
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Pick up the counters persisted by a previous run
    async fn restore(&mut self) {
        match self.store.load_connection_status(self.status.account_mode).await {
            Ok(Some(saved)) => {
                self.status.reconnect_attempts = saved.reconnect_attempts;
                self.status.last_connected = saved.last_connected;
                self.status.last_checked = saved.last_checked;
                self.status.last_error = saved.last_error;
            }
            Ok(None) => {}
            Err(e) => warn!(
                "Could not load saved {} connection status: {}",
                self.status.account_mode, e
            ),
        }
    }

    /// One liveness check, reconnecting if needed. The result is persisted.
    pub async fn check_once(&mut self) -> ConnectionStatus {
        let mode = self.status.account_mode;
        let mut connected = self.gateway.is_connected().await;

        if !connected && self.config.auto_reconnect {
            warn!("{} broker session is down, reconnecting", mode);
            connected = self
                .gateway
                .connect(self.config.reconnect_retries, self.config.reconnect_backoff)
                .await;
        }

        let error = if connected {
            None
        } else {
            Some(
                self.gateway
                    .last_error()
                    .await
                    .unwrap_or_else(|| "not connected".to_string()),
            )
        };

        let was_connected = self.status.connected;
        self.status.record_check(connected, error, Utc::now());

        match (was_connected, connected) {
            (false, true) => info!("✅ {} broker session healthy", mode),
            (true, false) => error!("❌ {} broker session lost", mode),
            (false, false) => debug!(
                "{} broker still unreachable ({} failed checks)",
                mode, self.status.reconnect_attempts
            ),
            (true, true) => debug!("{} broker session healthy", mode),
        }

        if let Err(e) = self.store.save_connection_status(&self.status).await {
            error!("Failed to persist {} connection status: {}", mode, e);
        }

        self.status.clone()
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<HealthMessage>) {
        info!(
            "ConnectionHealthMonitor started for {} account (every {:?})",
            self.status.account_mode, self.config.check_interval
        );
        self.restore().await;

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                msg = rx.recv() => match msg {
                    Some(HealthMessage::CheckNow { reply }) => {
                        debug!("ConnectionHealthMonitor received CheckNow");
                        let status = self.check_once().await;
                        if let Err(e) = reply.send(status).await {
                            error!("Failed to send CheckNow reply: {:?}", e);
                        }
                    }
                    Some(HealthMessage::GetStatus { reply }) => {
                        if let Err(e) = reply.send(self.status.clone()).await {
                            error!("Failed to send GetStatus reply: {:?}", e);
                        }
                    }
                    Some(HealthMessage::Shutdown) => {
                        info!("ConnectionHealthMonitor received Shutdown");
                        break;
                    }
                    None => break,
                },
            }
        }

        info!("ConnectionHealthMonitor stopped for {} account", self.status.account_mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::application::services::execution_gateway::GatewayConfig;
    use crate::domain::entities::account_mode::AccountMode;
    use crate::domain::repositories::broker_client::BrokerError;
    use crate::domain::test_support::{memory_store, MockBroker};
    use crate::persistence::repository::SqliteStore;

    async fn setup() -> (ConnectionHealthMonitor, Arc<MockBroker>, Arc<SqliteStore>) {
        let broker = Arc::new(MockBroker::new());
        let store = memory_store().await;
        let gateway = Arc::new(ExecutionGateway::new(
            AccountMode::Paper,
            broker.clone(),
            store.clone(),
            GatewayConfig::default(),
        ));
        let monitor = ConnectionHealthMonitor::new(
            gateway,
            store.clone(),
            HealthMonitorConfig {
                check_interval: Duration::from_secs(3600),
                auto_reconnect: true,
                reconnect_retries: 1,
                reconnect_backoff: Duration::from_millis(1),
            },
        );
        (monitor, broker, store)
    }

    #[tokio::test]
    async fn test_failures_accumulate_then_reset_on_reconnect() {
        let (mut monitor, broker, store) = setup().await;
        broker.fail_next_opens(vec![
            BrokerError::ConnectionRefused("127.0.0.1:7497".to_string());
            3
        ]);

        for _ in 0..3 {
            let status = monitor.check_once().await;
            assert!(!status.connected);
        }
        assert_eq!(monitor.status().reconnect_attempts, 3);
        assert!(monitor.status().last_error.as_deref().unwrap().contains("refused"));

        let status = monitor.check_once().await;
        assert!(status.connected);
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_connected.is_some());

        let saved = store
            .load_connection_status(AccountMode::Paper)
            .await
            .unwrap()
            .unwrap();
        assert!(saved.connected);
        assert_eq!(saved.reconnect_attempts, 0);
        assert_eq!(saved.port, 7497);
    }

    #[tokio::test]
    async fn test_dropped_session_is_reopened() {
        let (mut monitor, broker, _) = setup().await;
        assert!(monitor.check_once().await.connected);

        broker.set_connected(false);
        let status = monitor.check_once().await;
        assert!(status.connected);
        assert_eq!(broker.open_calls(), 2);
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let (mut monitor, broker, _) = setup().await;
        monitor.config.auto_reconnect = false;

        let status = monitor.check_once().await;
        assert!(!status.connected);
        assert_eq!(status.last_error.as_deref(), Some("not connected"));
        assert_eq!(broker.open_calls(), 0);
    }

    #[tokio::test]
    async fn test_actor_answers_messages() {
        let broker = Arc::new(MockBroker::new());
        let store = memory_store().await;
        let gateway = Arc::new(ExecutionGateway::new(
            AccountMode::Paper,
            broker.clone(),
            store.clone(),
            GatewayConfig::default(),
        ));
        let tx = ConnectionHealthMonitor::spawn(
            gateway,
            store.clone(),
            HealthMonitorConfig {
                check_interval: Duration::from_secs(3600),
                ..HealthMonitorConfig::default()
            },
        );

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        tx.send(HealthMessage::CheckNow { reply: reply_tx }).await.unwrap();
        let status = reply_rx.recv().await.unwrap();
        assert!(status.connected);

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        tx.send(HealthMessage::GetStatus { reply: reply_tx }).await.unwrap();
        assert!(reply_rx.recv().await.unwrap().connected);

        tx.send(HealthMessage::Shutdown).await.unwrap();
        tx.closed().await;
    }
}
