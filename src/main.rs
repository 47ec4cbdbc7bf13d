use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use tradegate::application::actors::health_monitor::{ConnectionHealthMonitor, HealthMessage};
use tradegate::application::handlers::api::{self, ApiState};
use tradegate::application::services::execution_gateway::ExecutionGateway;
use tradegate::application::services::trade_dispatcher::TradeDispatcher;
use tradegate::auth::ApiKeys;
use tradegate::config::TradingConfig;
use tradegate::domain::entities::account_mode::AccountMode;
use tradegate::domain::repositories::broker_client::BrokerEndpoint;
use tradegate::domain::services::approval_broker::ApprovalBroker;
use tradegate::domain::services::pipeline::{PipelineCoordinator, PipelinePorts};
use tradegate::domain::services::safety_gate::SafetyGate;
use tradegate::infrastructure::gateway_client::{GatewayClient, GatewayClientConfig};
use tradegate::infrastructure::oracle_client::OracleClient;
use tradegate::infrastructure::twilio_client::{TwilioClient, TwilioConfig};
use tradegate::persistence::repository::SqliteStore;
use tradegate::persistence::{init_database_with, DatabaseConfig};
use tradegate::rate_limit::create_rate_limiter;
use tradegate::secrets::{ControlPlaneSecrets, SecretConfig};
use tradegate::task_runner::{run_periodic, BackoffConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradegate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tradegate control plane starting...");

    let config = TradingConfig::from_env();
    info!(
        "Policy: {:?}, account modes: {:?}, symbols: {}",
        config.execution_policy,
        config.enabled_modes,
        config.symbols.len()
    );

    let db_config = DatabaseConfig::from_env();
    let pool = init_database_with(&db_config).await?;
    let store = Arc::new(SqliteStore::new(pool));
    info!("✅ Database ready at {}", db_config.url);

    let secrets = ControlPlaneSecrets::load(&SecretConfig::from_env())?;
    let api_keys = Arc::new(ApiKeys::parse(&secrets.api_keys)?);
    info!("Loaded {} operator API key(s)", api_keys.len());

    // One gateway session and one health monitor per account mode
    let mut gateways = Vec::new();
    let mut monitors: HashMap<AccountMode, mpsc::Sender<HealthMessage>> = HashMap::new();
    for mode in &config.enabled_modes {
        let settings = config.broker(*mode);
        let client = GatewayClient::new(
            GatewayClientConfig {
                base_url: settings.base_url.clone(),
                endpoint: BrokerEndpoint {
                    host: settings.host.clone(),
                    port: settings.port,
                    client_id: settings.client_id,
                },
                request_timeout: config.gateway.connect_timeout,
            },
            secrets.gateway_token.clone(),
        )?;
        let gateway = Arc::new(ExecutionGateway::new(
            *mode,
            Arc::new(client),
            store.clone(),
            config.gateway.clone(),
        ));

        if !gateway
            .connect(config.gateway.max_retries, config.gateway.retry_backoff)
            .await
        {
            warn!("❌ {} gateway unavailable at start-up; the health monitor will keep trying", mode);
        }

        let sender = ConnectionHealthMonitor::spawn(gateway.clone(), store.clone(), config.health.clone());
        monitors.insert(*mode, sender);
        gateways.push(gateway);
    }

    let twilio_token = secrets
        .twilio_auth_token
        .clone()
        .unwrap_or_else(|| Zeroizing::new(String::new()));
    if twilio_token.is_empty() {
        warn!("No Twilio auth token configured; confirmation SMS will be refused by the provider");
    }
    let twilio = TwilioClient::new(
        TwilioConfig {
            base_url: config.twilio.base_url.clone(),
            account_sid: config.twilio.account_sid.clone(),
            from_number: config.twilio.from_number.clone(),
            to_number: config.twilio.to_number.clone(),
        },
        twilio_token,
    )?;

    let approvals = Arc::new(ApprovalBroker::new(
        Arc::new(twilio),
        store.clone(),
        config.approval.clone(),
    ));
    match approvals.restore_pending().await {
        Ok(0) => {}
        Ok(count) => info!("Restored {} pending confirmation(s)", count),
        Err(e) => error!("Failed to restore pending confirmations: {}", e),
    }

    let dispatcher = Arc::new(TradeDispatcher::new(
        config.execution_policy,
        approvals.clone(),
        gateways.clone(),
        store.clone(),
    ));

    let oracle = Arc::new(OracleClient::new(&config.oracle.base_url, config.oracle.timeout)?);
    let pipeline = Arc::new(PipelineCoordinator::new(
        PipelinePorts {
            market_data: oracle.clone(),
            forecaster: oracle.clone(),
            trust: oracle.clone(),
            reasoning: oracle,
            decisions: store.clone(),
            handoff: dispatcher.clone(),
        },
        SafetyGate::new(config.safety.clone()),
        config.pipeline.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut workers = Vec::new();

    {
        let pipeline = pipeline.clone();
        let symbols = config.symbols.clone();
        workers.push(tokio::spawn(run_periodic(
            "pipeline",
            config.workers.pipeline,
            BackoffConfig::default(),
            shutdown_tx.subscribe(),
            move || {
                let pipeline = pipeline.clone();
                let symbols = symbols.clone();
                async move {
                    let summary = pipeline.run(&symbols).await.map_err(|e| e.to_string())?;
                    if summary.halted {
                        return Err(format!(
                            "trading halted: {}",
                            summary.halt_reason.unwrap_or_default()
                        ));
                    }
                    Ok(())
                }
            },
        )));
    }

    {
        let dispatcher = dispatcher.clone();
        workers.push(tokio::spawn(run_periodic(
            "approval-replies",
            config.workers.reply_poll,
            BackoffConfig::default(),
            shutdown_tx.subscribe(),
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    let pass = dispatcher.run_approval_pass().await.map_err(|e| e.to_string())?;
                    if let Some(report) = &pass.settled {
                        info!("✅ Approved trade {} settled as {}", report.trade_id, report.status);
                    }
                    if pass.expired > 0 {
                        info!("{} confirmation(s) expired", pass.expired);
                    }
                    for report in &pass.retried {
                        info!("Retried approved trade {} settled as {}", report.trade_id, report.status);
                    }
                    if let Some(e) = pass.reply_error {
                        return Err(format!("reply processing failed: {}", e));
                    }
                    Ok(())
                }
            },
        )));
    }

    for gateway in &gateways {
        let gateway = gateway.clone();
        let name = format!("reconcile-{}", gateway.account_mode());
        let period = config.workers.reconcile;
        let shutdown = shutdown_tx.subscribe();
        workers.push(tokio::spawn(async move {
            run_periodic(&name, period, BackoffConfig::default(), shutdown, move || {
                let gateway = gateway.clone();
                async move {
                    gateway
                        .reconcile_submitted()
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            })
            .await
        }));
    }

    let app = api::router(
        ApiState {
            dispatcher: dispatcher.clone(),
            requests: store.clone(),
            connections: store.clone(),
            decisions: store.clone(),
        },
        api_keys,
        create_rate_limiter(&config.server.rate_limit),
    );

    let addr: SocketAddr = config.server.bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    let shutdown_signal = async move {
        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal"),
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("Received SIGTERM signal");
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    };

    info!("Server started successfully. Press Ctrl+C to stop.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    info!("Server shutting down gracefully...");

    let _ = shutdown_tx.send(());
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task ended abnormally: {}", e);
        }
    }

    for (mode, sender) in monitors {
        if sender.send(HealthMessage::Shutdown).await.is_err() {
            warn!("{} health monitor already stopped", mode);
        }
    }

    for gateway in &gateways {
        gateway.disconnect().await;
    }

    info!("Shutdown complete");
    Ok(())
}
