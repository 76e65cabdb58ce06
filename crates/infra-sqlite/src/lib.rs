// Cadence Infrastructure - SQLite Adapter
// Implements: JobStore (claim-with-lease, retry bookkeeping, retention)

mod connection;
mod error;
mod job_store;
mod migration;

pub use connection::{create_pool, ConnectRetry};
pub use job_store::SqliteJobStore;
pub use migration::{current_version, run_migrations};
