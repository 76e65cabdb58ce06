// SQLite Connection Pool Setup

use cadence_core::error::{AppError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Retry strategy for the initial connection: capped exponential backoff,
/// bounded attempts, then a fatal connectivity error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectRetry {
    /// Delay after the `attempt`-th failed connection (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Create SQLite connection pool with WAL mode, retrying the connection
///
/// In-memory databases get a single, never-recycled connection: every
/// connection to `sqlite::memory:` would otherwise open its own empty database.
pub async fn create_pool(
    database_url: &str,
    max_connections: u32,
    retry: &ConnectRetry,
) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| AppError::Config(format!("invalid database url {}: {}", database_url, e)))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    let pool_options = if is_in_memory(database_url) {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections.max(1))
    };

    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pool_options.clone().connect_with(options.clone()).await {
            Ok(pool) => {
                info!(attempt, "Database connection established");
                return Ok(pool);
            }
            Err(e) if attempt < max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(AppError::Connectivity(format!(
                    "could not connect to {} after {} attempts: {}",
                    database_url, attempt, e
                )));
            }
        }
    }
}
