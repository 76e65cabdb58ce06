//! File-backed SQLite fixture shared by the integration tests

use std::path::PathBuf;
use std::sync::Arc;

use cadence_core::port::time_provider::SystemTimeProvider;
use cadence_infra_sqlite::{create_pool, run_migrations, ConnectRetry, SqliteJobStore};
use tempfile::TempDir;

/// A database file in its own temporary directory.
///
/// The directory goes away with this value, together with the `-wal` and
/// `-shm` side files, even when an assertion fails first.
pub struct TempDb {
    _dir: TempDir,
    path: PathBuf,
}

impl Default for TempDb {
    fn default() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");
        Self { _dir: dir, path }
    }
}

impl TempDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a migrated store backed by this file
    pub async fn open(&self, max_connections: u32) -> Arc<SqliteJobStore> {
        let url = format!("sqlite://{}", self.path.display());
        let pool = create_pool(&url, max_connections, &ConnectRetry::default())
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        Arc::new(SqliteJobStore::new(pool, Arc::new(SystemTimeProvider)))
    }
}
