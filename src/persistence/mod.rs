//! Persistence Layer
//!
//! SQLite storage for trade requests, their executions, confirmations,
//! broker connection status and the decision audit trail. Async access via
//! sqlx; the schema is created idempotently at start-up.
//!
//! # Database Schema
//!
//! ## trade_requests
//! - trade_id: opaque id (PK)
//! - approval_code: human-typeable code
//! - symbol, action, quantity, order_type, limit_price, account_mode
//! - details_json: full trade detail snapshot
//! - status: pending | approved | rejected | expired | submitted | filled | failed
//! - requested_at, expires_at, updated_at
//! - forecast_id: optional back-reference
//! - archived: never deleted, only hidden
//!
//! ## trade_executions
//! - one append-only row per broker submission attempt
//! - at most one `Filled` row per trade (partial unique index)
//!
//! ## confirmations
//! - one row per confirmation, keyed by trade_id
//!
//! ## connection_status
//! - one row per account mode
//!
//! ## decision_audit
//! - one row per processed symbol

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::domain::errors::StoreError;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),
}

impl From<DatabaseError> for StoreError {
    fn from(error: DatabaseError) -> Self {
        StoreError::Backend(error.to_string())
    }
}

/// Initialize the database connection pool with default settings
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    let config = DatabaseConfig {
        url: database_url.to_string(),
        ..DatabaseConfig::default()
    };
    init_database_with(&config).await
}

/// Initialize the database connection pool and run migrations.
///
/// In-memory databases are private to one connection, so the pool is capped
/// at a single connection for `:memory:` URLs.
pub async fn init_database_with(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let level = if config.log_queries {
        tracing::log::LevelFilter::Debug
    } else {
        tracing::log::LevelFilter::Trace
    };
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .log_statements(level);

    let in_memory = config.url.contains(":memory:");
    let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory {
        1
    } else {
        config.max_connections.max(1)
    });
    if in_memory {
        // Dropping the only connection would drop the database
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    let tables: [(&str, &str); 5] = [
        (
            "trade_requests",
            r#"
            CREATE TABLE IF NOT EXISTS trade_requests (
                trade_id TEXT PRIMARY KEY,
                approval_code TEXT NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL CHECK(action IN ('BUY', 'SELL')),
                quantity REAL NOT NULL,
                order_type TEXT NOT NULL CHECK(order_type IN ('MARKET', 'LIMIT')),
                limit_price REAL,
                account_mode TEXT NOT NULL CHECK(account_mode IN ('paper', 'live')),
                details_json TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN
                    ('pending', 'approved', 'rejected', 'expired', 'submitted', 'filled', 'failed')),
                requested_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                forecast_id INTEGER,
                archived BOOLEAN NOT NULL DEFAULT 0
            )
            "#,
        ),
        (
            "trade_executions",
            r#"
            CREATE TABLE IF NOT EXISTS trade_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL,
                order_id TEXT,
                execution_price REAL,
                status TEXT NOT NULL,
                broker_response TEXT,
                error_message TEXT,
                attempted_at DATETIME NOT NULL,
                FOREIGN KEY (trade_id) REFERENCES trade_requests(trade_id)
            )
            "#,
        ),
        (
            "confirmations",
            r#"
            CREATE TABLE IF NOT EXISTS confirmations (
                trade_id TEXT PRIMARY KEY,
                approval_code TEXT NOT NULL,
                details_json TEXT NOT NULL,
                requested_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('pending', 'approved', 'rejected', 'expired')),
                approved_at DATETIME,
                approved_via TEXT
            )
            "#,
        ),
        (
            "connection_status",
            r#"
            CREATE TABLE IF NOT EXISTS connection_status (
                account_mode TEXT PRIMARY KEY CHECK(account_mode IN ('paper', 'live')),
                connected BOOLEAN NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                client_id INTEGER NOT NULL,
                last_checked DATETIME,
                last_connected DATETIME,
                reconnect_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        ),
        (
            "decision_audit",
            r#"
            CREATE TABLE IF NOT EXISTS decision_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                account_mode TEXT NOT NULL,
                outcome TEXT NOT NULL,
                stage_reached TEXT NOT NULL,
                reason TEXT,
                forecast_json TEXT,
                reasoning_decision TEXT,
                confidence REAL,
                rationale TEXT,
                safety_issues_json TEXT NOT NULL,
                trade_id TEXT,
                decided_at DATETIME NOT NULL
            )
            "#,
        ),
    ];

    for (name, ddl) in tables {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {} table: {}", name, e))
        })?;
    }

    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_trade_requests_status ON trade_requests(status)",
        "CREATE INDEX IF NOT EXISTS idx_trade_requests_code ON trade_requests(approval_code)",
        "CREATE INDEX IF NOT EXISTS idx_trade_executions_trade ON trade_executions(trade_id)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_trade_executions_one_fill \
         ON trade_executions(trade_id) WHERE status = 'Filled'",
        "CREATE INDEX IF NOT EXISTS idx_confirmations_status ON confirmations(status)",
        "CREATE INDEX IF NOT EXISTS idx_decision_audit_decided_at ON decision_audit(decided_at)",
    ];

    for ddl in indexes {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/tradegate.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Log statements at debug level
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/tradegate.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let url = std::env::var("DATABASE_URL").unwrap_or(defaults.url);

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_connections);

        let log_queries = std::env::var("DATABASE_LOG_QUERIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.log_queries);

        Self {
            url,
            max_connections,
            log_queries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_create_all_tables() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN \
             ('trade_requests', 'trade_executions', 'confirmations', 'connection_status', 'decision_audit')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 5);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        assert!(run_migrations(&pool).await.is_ok());
    }

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.url, "sqlite://data/tradegate.db");
        assert_eq!(config.max_connections, 5);
    }
}
