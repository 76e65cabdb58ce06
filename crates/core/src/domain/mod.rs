// Domain Layer - Pure business logic and entities

pub mod error;
pub mod job;
pub mod queue;

// Re-exports
pub use error::DomainError;
pub use job::{
    BackoffPolicy, Job, JobId, JobPayload, JobState, LeaseToken, RetrySettings,
    MAX_BACKOFF_DELAY_MS,
};
pub use queue::{
    validate_queue_name, JobOptions, KeepJobs, QueueId, QueueOptions, RateLimit,
    RetentionPolicy, WorkerConfig,
};
