//! Connection-pool wrapper with health checks and slow-statement reporting.

use crate::Result;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    /// Statements slower than this are surfaced to the log.
    pub slow_statement: Duration,
}

impl StoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 20,
            connect_timeout: Duration::from_secs(10),
            slow_statement: Duration::from_millis(100),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// Bounded Postgres pool shared by the repository and migrations.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    slow_statement: Duration,
}

impl Store {
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;
        info!(
            max_connections = config.max_connections,
            "connected to PostgreSQL"
        );
        Ok(Self {
            pool,
            slow_statement: config.slow_statement,
        })
    }

    /// Wrap an existing pool (used by tests and tooling).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            slow_statement: Duration::from_millis(100),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> StoreHealth {
        let started = Instant::now();
        let healthy = sqlx::query("SELECT 1").execute(&self.pool).await.is_ok();
        StoreHealth {
            healthy,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Run a query future, surfacing slow statements to the log.
    pub async fn timed<T, F>(&self, statement: &'static str, query: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let started = Instant::now();
        let result = query.await;
        let elapsed = started.elapsed();
        if elapsed > self.slow_statement {
            warn!(
                statement,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow statement"
            );
        }
        Ok(result?)
    }
}
