use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::application::actors::health_monitor::HealthMonitorConfig;
use crate::application::services::execution_gateway::GatewayConfig;
use crate::application::services::trade_dispatcher::ExecutionPolicy;
use crate::domain::entities::account_mode::AccountMode;
use crate::domain::entities::trade_request::OrderType;
use crate::domain::services::approval_broker::ApprovalConfig;
use crate::domain::services::pipeline::PipelineConfig;
use crate::domain::services::safety_gate::SafetyThresholds;
use crate::rate_limit::RateLimiterConfig;

/// Connection settings for one broker gateway session
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub base_url: String,
    pub host: String,
    pub port: u16,
    pub client_id: u32,
}

impl BrokerSettings {
    fn for_mode(mode: AccountMode) -> Self {
        let port = mode.default_port();
        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            host: "127.0.0.1".to_string(),
            port,
            client_id: 1,
        }
    }
}

/// SMS channel settings (the auth token lives in secrets)
#[derive(Debug, Clone, PartialEq)]
pub struct TwilioSettings {
    pub base_url: String,
    pub account_sid: String,
    pub from_number: String,
    pub to_number: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleSettings {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub rate_limit: RateLimiterConfig,
}

/// Periods of the background workers
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerIntervals {
    pub pipeline: Duration,
    pub reply_poll: Duration,
    pub reconcile: Duration,
}

/// Complete runtime configuration
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub execution_policy: ExecutionPolicy,
    /// Account modes that get a gateway and a health monitor
    pub enabled_modes: Vec<AccountMode>,
    pub pipeline: PipelineConfig,
    pub safety: SafetyThresholds,
    pub approval: ApprovalConfig,
    pub gateway: GatewayConfig,
    pub health: HealthMonitorConfig,
    pub paper_broker: BrokerSettings,
    pub live_broker: BrokerSettings,
    pub twilio: TwilioSettings,
    pub oracle: OracleSettings,
    pub server: ServerSettings,
    pub workers: WorkerIntervals,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            symbols: vec!["AAPL".to_string(), "MSFT".to_string(), "SPY".to_string()],
            execution_policy: ExecutionPolicy::ApprovalRequired,
            enabled_modes: vec![AccountMode::Paper],
            pipeline: PipelineConfig::default(),
            safety: SafetyThresholds::default(),
            approval: ApprovalConfig::default(),
            gateway: GatewayConfig::default(),
            health: HealthMonitorConfig::default(),
            paper_broker: BrokerSettings::for_mode(AccountMode::Paper),
            live_broker: BrokerSettings::for_mode(AccountMode::Live),
            twilio: TwilioSettings {
                base_url: "https://api.twilio.com".to_string(),
                account_sid: String::new(),
                from_number: String::new(),
                to_number: String::new(),
            },
            oracle: OracleSettings {
                base_url: "http://127.0.0.1:8600".to_string(),
                timeout: Duration::from_secs(30),
            },
            server: ServerSettings {
                bind_addr: "127.0.0.1:8080".to_string(),
                rate_limit: RateLimiterConfig::default(),
            },
            workers: WorkerIntervals {
                pipeline: Duration::from_secs(300),
                reply_poll: Duration::from_secs(5),
                reconcile: Duration::from_secs(60),
            },
        }
    }
}

/// Read `name` and parse it, keeping `current` on a missing, unparsable or
/// out-of-range value.
fn env_parse<T>(name: &str, current: T, valid: impl Fn(&T) -> bool, expected: &str) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = std::env::var(name) else {
        return current;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} (must be {}), using default: {}",
                name,
                value,
                expected,
                current
            );
            current
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                current
            );
            current
        }
    }
}

fn env_bool(name: &str, current: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => {
            let value = value.trim().to_lowercase();
            value == "true" || value == "1" || value == "yes"
        }
        Err(_) => current,
    }
}

fn env_string(name: &str, current: String) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => current,
    }
}

fn env_secs(name: &str, current: Duration, min: u64, max: u64) -> Duration {
    let secs = env_parse(
        name,
        current.as_secs(),
        |v| (min..=max).contains(v),
        &format!("between {} and {} seconds", min, max),
    );
    Duration::from_secs(secs)
}

fn env_millis(name: &str, current: Duration, min: u64, max: u64) -> Duration {
    let millis = env_parse(
        name,
        current.as_millis() as u64,
        |v| (min..=max).contains(v),
        &format!("between {} and {} milliseconds", min, max),
    );
    Duration::from_millis(millis)
}

fn unit_interval(v: &f64) -> bool {
    (0.0..=1.0).contains(v)
}

impl BrokerSettings {
    fn from_env(prefix: &str, defaults: BrokerSettings) -> Self {
        Self {
            base_url: env_string(&format!("{}_GATEWAY_URL", prefix), defaults.base_url),
            host: env_string(&format!("{}_HOST", prefix), defaults.host),
            port: env_parse(&format!("{}_PORT", prefix), defaults.port, |p| *p > 0, "a non-zero port"),
            client_id: env_parse(
                &format!("{}_CLIENT_ID", prefix),
                defaults.client_id,
                |_| true,
                "an unsigned integer",
            ),
        }
    }
}

impl TradingConfig {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> TradingConfig {
        let mut config = TradingConfig::default();

        if let Ok(symbols) = std::env::var("SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if parsed.is_empty() {
                tracing::warn!("SYMBOLS is empty, using default: {:?}", config.symbols);
            } else {
                config.symbols = parsed;
            }
        }

        if let Ok(policy) = std::env::var("EXECUTION_POLICY") {
            match policy.parse::<ExecutionPolicy>() {
                Ok(value) => config.execution_policy = value,
                Err(e) => tracing::warn!("{}, using default: {:?}", e, config.execution_policy),
            }
        }

        if let Ok(modes) = std::env::var("ACCOUNT_MODES") {
            let parsed: Result<Vec<AccountMode>, String> =
                modes.split(',').map(|m| m.parse::<AccountMode>()).collect();
            match parsed {
                Ok(value) if !value.is_empty() => config.enabled_modes = value,
                Ok(_) => tracing::warn!("ACCOUNT_MODES is empty, using default"),
                Err(e) => tracing::warn!("Invalid ACCOUNT_MODES '{}': {}, using default", modes, e),
            }
        }

        // Pipeline
        if let Ok(mode) = std::env::var("TRADING_ACCOUNT_MODE") {
            match mode.parse::<AccountMode>() {
                Ok(value) => config.pipeline.account_mode = value,
                Err(e) => tracing::warn!("{}, using default: {}", e, config.pipeline.account_mode),
            }
        }
        if !config.enabled_modes.contains(&config.pipeline.account_mode) {
            config.enabled_modes.push(config.pipeline.account_mode);
        }

        config.pipeline.lookback = env_parse(
            "LOOKBACK_BARS",
            config.pipeline.lookback,
            |v| (10..=5000).contains(v),
            "between 10 and 5000",
        );
        let lookback = config.pipeline.lookback;
        config.pipeline.min_history_points = env_parse(
            "MIN_HISTORY_POINTS",
            config.pipeline.min_history_points,
            |v| *v >= 2 && *v <= lookback,
            "at least 2 and at most LOOKBACK_BARS",
        );
        config.pipeline.forecast_horizon = env_parse(
            "FORECAST_HORIZON",
            config.pipeline.forecast_horizon,
            |v| (1..=100).contains(v),
            "between 1 and 100",
        );
        config.pipeline.actionability_threshold = env_parse(
            "MIN_CONFIDENCE_THRESHOLD",
            config.pipeline.actionability_threshold,
            unit_interval,
            "between 0.0 and 1.0",
        );
        config.pipeline.order_quantity = env_parse(
            "ORDER_QUANTITY",
            config.pipeline.order_quantity,
            |v| v.is_finite() && *v > 0.0,
            "positive",
        );
        if let Ok(order_type) = std::env::var("ORDER_TYPE") {
            match order_type.parse::<OrderType>() {
                // Pipeline orders carry no limit price
                Ok(OrderType::Market) => config.pipeline.order_type = OrderType::Market,
                Ok(OrderType::Limit) => {
                    tracing::warn!("ORDER_TYPE=LIMIT needs a limit price, using MARKET")
                }
                Err(e) => tracing::warn!("{}, using default: {}", e, config.pipeline.order_type),
            }
        }

        // Safety gate
        config.safety.drift_halt_threshold = env_parse(
            "SAFETY_DRIFT_HALT",
            config.safety.drift_halt_threshold,
            unit_interval,
            "between 0.0 and 1.0",
        );
        config.safety.volatility_flat_threshold = env_parse(
            "SAFETY_VOLATILITY_FLAT",
            config.safety.volatility_flat_threshold,
            |v| *v > 0.0 && *v <= 1.0,
            "in (0.0, 1.0]",
        );
        config.safety.coherence_break_threshold = env_parse(
            "SAFETY_COHERENCE_BREAK",
            config.safety.coherence_break_threshold,
            unit_interval,
            "between 0.0 and 1.0",
        );
        config.safety.min_reliability = env_parse(
            "SAFETY_MIN_RELIABILITY",
            config.safety.min_reliability,
            unit_interval,
            "between 0.0 and 1.0",
        );

        // Approvals
        let window_minutes = env_parse(
            "CONFIRMATION_WINDOW_MINUTES",
            config.approval.confirmation_window.num_minutes(),
            |v| (1..=1440).contains(v),
            "between 1 and 1440",
        );
        config.approval.confirmation_window = chrono::Duration::minutes(window_minutes);
        let tolerance_secs = env_parse(
            "REPLY_REPLAY_TOLERANCE_SECONDS",
            config.approval.replay_tolerance.num_seconds(),
            |v| (0..=60).contains(v),
            "between 0 and 60",
        );
        config.approval.replay_tolerance = chrono::Duration::seconds(tolerance_secs);
        config.approval.reply_scan_limit = env_parse(
            "REPLY_SCAN_LIMIT",
            config.approval.reply_scan_limit,
            |v| (1..=100).contains(v),
            "between 1 and 100",
        );

        // Gateway
        config.gateway.max_retries = env_parse(
            "BROKER_MAX_RETRIES",
            config.gateway.max_retries,
            |v| (1..=20).contains(v),
            "between 1 and 20",
        );
        config.gateway.retry_backoff =
            env_secs("BROKER_RETRY_BACKOFF_SECONDS", config.gateway.retry_backoff, 1, 60);
        config.gateway.connect_timeout =
            env_secs("BROKER_CONNECT_TIMEOUT_SECONDS", config.gateway.connect_timeout, 1, 120);
        config.gateway.price_timeout =
            env_millis("MARKET_PRICE_TIMEOUT_MS", config.gateway.price_timeout, 100, 30_000);
        config.gateway.settle_window =
            env_millis("ORDER_SETTLE_WINDOW_MS", config.gateway.settle_window, 0, 60_000);

        // Health monitor
        config.health.check_interval =
            env_secs("HEARTBEAT_INTERVAL_SECONDS", config.health.check_interval, 5, 3600);
        config.health.auto_reconnect = env_bool("AUTO_RECONNECT", config.health.auto_reconnect);

        // Endpoints
        config.paper_broker = BrokerSettings::from_env("PAPER_BROKER", config.paper_broker);
        config.live_broker = BrokerSettings::from_env("LIVE_BROKER", config.live_broker);

        config.twilio.base_url = env_string("TWILIO_BASE_URL", config.twilio.base_url);
        config.twilio.account_sid = env_string("TWILIO_ACCOUNT_SID", config.twilio.account_sid);
        config.twilio.from_number = env_string("TWILIO_FROM_NUMBER", config.twilio.from_number);
        config.twilio.to_number = env_string("TWILIO_TO_NUMBER", config.twilio.to_number);

        config.oracle.base_url = env_string("ORACLE_BASE_URL", config.oracle.base_url);
        config.oracle.timeout = env_secs("ORACLE_TIMEOUT_SECONDS", config.oracle.timeout, 1, 600);

        config.server.bind_addr = env_string("BIND_ADDR", config.server.bind_addr);
        config.server.rate_limit.requests_per_minute = env_parse(
            "API_REQUESTS_PER_MINUTE",
            config.server.rate_limit.requests_per_minute,
            |v| (1..=10_000).contains(v),
            "between 1 and 10000",
        );

        // Workers
        config.workers.pipeline =
            env_secs("PIPELINE_INTERVAL_SECONDS", config.workers.pipeline, 10, 86_400);
        config.workers.reply_poll =
            env_secs("REPLY_POLL_INTERVAL_SECONDS", config.workers.reply_poll, 1, 300);
        config.workers.reconcile =
            env_secs("RECONCILE_INTERVAL_SECONDS", config.workers.reconcile, 5, 3600);

        config
    }

    pub fn broker(&self, mode: AccountMode) -> &BrokerSettings {
        match mode {
            AccountMode::Paper => &self.paper_broker,
            AccountMode::Live => &self.live_broker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TradingConfig::default();
        assert_eq!(config.symbols.len(), 3);
        assert_eq!(config.execution_policy, ExecutionPolicy::ApprovalRequired);
        assert_eq!(config.enabled_modes, vec![AccountMode::Paper]);
        assert_eq!(config.broker(AccountMode::Paper).port, 7497);
        assert_eq!(config.broker(AccountMode::Live).port, 7496);
        assert_eq!(config.health.check_interval, Duration::from_secs(30));
    }

    // Env-based tests use names no other test touches
    #[test]
    fn test_env_parse_keeps_default_on_bad_values() {
        std::env::set_var("TRADEGATE_TEST_THRESHOLD", "1.7");
        let value = env_parse("TRADEGATE_TEST_THRESHOLD", 0.6, unit_interval, "between 0.0 and 1.0");
        assert_eq!(value, 0.6);

        std::env::set_var("TRADEGATE_TEST_THRESHOLD", "abc");
        let value = env_parse("TRADEGATE_TEST_THRESHOLD", 0.6, unit_interval, "between 0.0 and 1.0");
        assert_eq!(value, 0.6);

        std::env::set_var("TRADEGATE_TEST_THRESHOLD", " 0.75 ");
        let value = env_parse("TRADEGATE_TEST_THRESHOLD", 0.6, unit_interval, "between 0.0 and 1.0");
        assert_eq!(value, 0.75);
        std::env::remove_var("TRADEGATE_TEST_THRESHOLD");
    }

    #[test]
    fn test_env_secs_range() {
        std::env::set_var("TRADEGATE_TEST_INTERVAL", "2");
        assert_eq!(
            env_secs("TRADEGATE_TEST_INTERVAL", Duration::from_secs(30), 5, 60),
            Duration::from_secs(30)
        );
        std::env::set_var("TRADEGATE_TEST_INTERVAL", "45");
        assert_eq!(
            env_secs("TRADEGATE_TEST_INTERVAL", Duration::from_secs(30), 5, 60),
            Duration::from_secs(45)
        );
        std::env::remove_var("TRADEGATE_TEST_INTERVAL");
    }

    #[test]
    fn test_env_bool() {
        std::env::set_var("TRADEGATE_TEST_FLAG", "Yes");
        assert!(env_bool("TRADEGATE_TEST_FLAG", false));
        std::env::set_var("TRADEGATE_TEST_FLAG", "off");
        assert!(!env_bool("TRADEGATE_TEST_FLAG", true));
        std::env::remove_var("TRADEGATE_TEST_FLAG");
        assert!(env_bool("TRADEGATE_TEST_FLAG", true));
    }
}
