//! PostgreSQL pool for the bank store
//!
//! Startup tolerates a database that is still coming up: connection is
//! retried a few times before the binary falls back to the in-memory store.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Pool size; each lifecycle composite holds one connection for its duration
const MAX_CONNECTIONS: u32 = 20;
/// The recovery lease pins one more connection while a sweep runs
const MIN_CONNECTIONS: u32 = 2;
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let mut attempt = 1;
        loop {
            match PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .min_connections(MIN_CONNECTIONS)
                .acquire_timeout(Duration::from_secs(5))
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    tracing::info!(max_connections = MAX_CONNECTIONS, "PostgreSQL pool ready");
                    return Ok(Self { pool });
                }
                Err(e) if attempt < CONNECT_ATTEMPTS && is_transient(&e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = CONNECT_ATTEMPTS,
                        error = %e,
                        "PostgreSQL not reachable yet, retrying"
                    );
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        if one != 1 {
            return Err(sqlx::Error::Protocol("unexpected health check result".into()));
        }
        Ok(())
    }

    /// Create tables and indexes if missing
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        crate::store::schema::migrate(&self.pool).await
    }
}

/// Errors worth another connection attempt
fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
    )
}
