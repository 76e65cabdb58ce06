// Application Layer - Use Cases and Business Logic

pub mod maintenance;
pub mod queue;
pub mod rate_limiter;
pub mod reaper;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod worker;

// Re-exports
pub use maintenance::RetentionSweeper;
pub use queue::{JobHandle, QueueCounts, QueueHandle};
pub use rate_limiter::RateLimiter;
pub use reaper::LeaseReaper;
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::SchedulerLoop;
pub use shutdown::{ShutdownCoordinator, ShutdownPhase};
pub use worker::{
    shutdown_channel, ShutdownSender, ShutdownToken, WorkerEngine, WorkerEvent, WorkerStats,
};
