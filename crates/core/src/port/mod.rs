// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod job_handler;
pub mod job_store;
pub mod production;
pub mod time_provider;

// Re-exports
pub use id_provider::IdProvider;
pub use job_handler::{handler_fn, HandlerError, JobHandler};
pub use job_store::{EvictionStats, FailOutcome, JobStore};
pub use production::{routine_fn, ProductionRoutine};
pub use time_provider::TimeProvider;
