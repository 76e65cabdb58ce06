// Queue Domain Model

use std::time::Duration;

use super::error::{DomainError, Result};
use super::job::{BackoffPolicy, RetrySettings};

/// Queue identifier
pub type QueueId = String;

/// Maximum queue name length
pub const MAX_QUEUE_NAME_LEN: usize = 64;

/// Validate a queue name: non-empty, at most 64 chars, `[A-Za-z0-9_-]`
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DomainError::InvalidQueueName(
            "queue name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(DomainError::InvalidQueueName(format!(
            "queue name too long ({} > {})",
            name.len(),
            MAX_QUEUE_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DomainError::InvalidQueueName(format!(
            "'{}' must be alphanumeric, '_' or '-'",
            name
        )));
    }
    Ok(())
}

/// Cap on how many finished jobs of one kind are kept, and for how long
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepJobs {
    pub max_count: u32,
    pub max_age: Duration,
}

impl KeepJobs {
    pub fn new(max_count: u32, max_age: Duration) -> Self {
        Self { max_count, max_age }
    }
}

/// Declarative retention, enforced asynchronously by the store (oldest evicted first)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub completed: KeepJobs,
    pub failed: KeepJobs,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: KeepJobs::new(1_000, Duration::from_secs(24 * 3600)),
            failed: KeepJobs::new(5_000, Duration::from_secs(7 * 24 * 3600)),
        }
    }
}

/// Queue-level defaults, fixed when the queue handle is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub attempts: i32,
    pub backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
}

impl QueueOptions {
    /// High cost-of-failure work: 5 attempts, 1s exponential base
    pub fn critical() -> Self {
        Self {
            attempts: 5,
            backoff: BackoffPolicy::exponential(Duration::from_secs(1)),
            retention: RetentionPolicy::default(),
        }
    }

    /// Cheap-to-lose work: 3 attempts, 5s exponential base
    pub fn best_effort() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(5)),
            retention: RetentionPolicy {
                completed: KeepJobs::new(100, Duration::from_secs(3600)),
                failed: KeepJobs::new(500, Duration::from_secs(24 * 3600)),
            },
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Merge per-job overrides over the queue defaults
    pub fn resolve(&self, overrides: &JobOptions) -> Result<RetrySettings> {
        let max_attempts = overrides.attempts.unwrap_or(self.attempts);
        if max_attempts < 1 {
            return Err(DomainError::ValidationError(format!(
                "attempts must be >= 1, got {}",
                max_attempts
            )));
        }
        Ok(RetrySettings {
            max_attempts,
            backoff: overrides.backoff.unwrap_or(self.backoff),
        })
    }
}

/// Per-job overrides accepted by `QueueHandle::enqueue`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub attempts: Option<i32>,
    pub backoff: Option<BackoffPolicy>,
    /// Delay before the first attempt
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Job starts allowed within a rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

/// Worker configuration for one queue
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: QueueId,
    /// Maximum simultaneously executing handlers
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    /// Handler executions longer than this are failed
    pub handler_timeout: Option<Duration>,
    /// Lease taken on claim; renewed every half lease while the handler runs
    pub lease_duration: Duration,
}

impl WorkerConfig {
    pub fn new(queue: impl Into<String>, concurrency: usize) -> Self {
        Self {
            queue: queue.into(),
            concurrency,
            rate_limit: None,
            handler_timeout: None,
            lease_duration: Duration::from_secs(30),
        }
    }

    pub fn with_rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit = Some(RateLimit { max, window });
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_queue_name(&self.queue)?;
        if self.concurrency == 0 {
            return Err(DomainError::ValidationError(
                "concurrency must be >= 1".to_string(),
            ));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.max == 0 || limit.window.is_zero() {
                return Err(DomainError::ValidationError(
                    "rate limit needs max >= 1 and a non-zero window".to_string(),
                ));
            }
        }
        if self.lease_duration < Duration::from_millis(2) {
            return Err(DomainError::ValidationError(
                "lease duration too short".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_queue_name_empty() {
        let err = validate_queue_name("").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_validate_queue_name_too_long() {
        let err = validate_queue_name(&"a".repeat(65)).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_validate_queue_name_invalid_chars() {
        let err = validate_queue_name("invalid@queue!").unwrap_err();
        assert!(err.to_string().contains("alphanumeric"));
        assert!(validate_queue_name("check-sources_2").is_ok());
    }

    #[test]
    fn test_presets_differ_by_cost_of_failure() {
        let critical = QueueOptions::critical();
        assert_eq!(critical.attempts, 5);
        assert_eq!(critical.backoff, BackoffPolicy::Exponential { base_ms: 1000 });

        let best_effort = QueueOptions::best_effort();
        assert_eq!(best_effort.attempts, 3);
        assert_eq!(best_effort.backoff, BackoffPolicy::Exponential { base_ms: 5000 });
    }

    #[test]
    fn test_resolve_overrides() {
        let defaults = QueueOptions::critical();

        let plain = defaults.resolve(&JobOptions::default()).unwrap();
        assert_eq!(plain.max_attempts, 5);
        assert_eq!(plain.backoff, defaults.backoff);

        let custom = defaults
            .resolve(
                &JobOptions::default()
                    .attempts(2)
                    .backoff(BackoffPolicy::fixed(Duration::from_millis(10))),
            )
            .unwrap();
        assert_eq!(custom.max_attempts, 2);
        assert_eq!(custom.backoff, BackoffPolicy::Fixed { delay_ms: 10 });

        assert!(defaults
            .resolve(&JobOptions::default().attempts(0))
            .is_err());
    }

    #[test]
    fn test_worker_config_validation() {
        assert!(WorkerConfig::new("q", 5).validate().is_ok());
        assert!(WorkerConfig::new("q", 0).validate().is_err());
        assert!(WorkerConfig::new("q", 1)
            .with_rate_limit(0, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(WorkerConfig::new("bad name", 1).validate().is_err());
    }
}
