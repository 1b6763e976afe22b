//! Postgres-backed persistence for route definitions and the append-only
//! access log.
//!
//! The pool is the shared resource: every query leases a connection with a
//! bounded acquire timeout so a sick database fails fast instead of hanging
//! request handlers. Schema initialization is idempotent and runs before the
//! server accepts traffic.

pub mod request_logs;
pub mod routes;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{GatewayError, Result};

pub use request_logs::{RequestLog, RequestLogRepository};
pub use routes::{NewRoute, Route, RouteRepository};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS routes (
    id SERIAL PRIMARY KEY,
    path VARCHAR(255) NOT NULL UNIQUE,
    target_url VARCHAR(500) NOT NULL,
    method VARCHAR(10) NOT NULL DEFAULT 'GET',
    enabled BOOLEAN NOT NULL DEFAULT true,
    rate_limit INTEGER NOT NULL DEFAULT 0,
    timeout_seconds INTEGER NOT NULL DEFAULT 30,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS request_logs (
    id SERIAL PRIMARY KEY,
    route_id INTEGER REFERENCES routes(id) ON DELETE SET NULL,
    method VARCHAR(10) NOT NULL,
    path VARCHAR(255) NOT NULL,
    status_code INTEGER NOT NULL,
    response_time_ms INTEGER NOT NULL,
    client_ip VARCHAR(45),
    user_agent TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_routes_path ON routes(path);
CREATE INDEX IF NOT EXISTS idx_routes_enabled ON routes(enabled);
CREATE INDEX IF NOT EXISTS idx_request_logs_created_at ON request_logs(created_at);
CREATE INDEX IF NOT EXISTS idx_request_logs_route_id ON request_logs(route_id);
"#;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the connection pool and verify connectivity.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let ssl_mode = PgSslMode::from_str(&config.ssl_mode)
            .map_err(|e| GatewayError::Config(anyhow::anyhow!("Invalid DB_SSL_MODE: {}", e)))?;

        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name)
            .ssl_mode(ssl_mode);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns)
            .acquire_timeout(Duration::from_secs(5))
            .max_lifetime(config.conn_max_lifetime)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;

        info!(
            host = %config.host,
            database = %config.name,
            max_conns = config.max_open_conns,
            "Database connection established"
        );

        Ok(Self { pool })
    }

    /// Open a pool that establishes connections on first use instead of at
    /// startup.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_open_conns)
            .min_connections(config.max_idle_conns)
            .acquire_timeout(Duration::from_secs(5))
            .max_lifetime(config.conn_max_lifetime)
            .connect_lazy(&config.dsn())
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Create tables and indexes if absent. Safe to run on every startup.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        info!("Database schema initialized");
        Ok(())
    }

    /// Liveness probe with a bounded deadline.
    pub async fn health(&self) -> Result<()> {
        let ping = sqlx::query("SELECT 1").execute(&self.pool);
        tokio::time::timeout(Duration::from_secs(5), ping)
            .await
            .map_err(|_| GatewayError::StoreUnavailable("health check timed out".into()))?
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Close the pool. Called strictly after background workers have drained
    /// so late log writes never hit a closed pool.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
