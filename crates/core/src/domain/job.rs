// Job Domain Model

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{DomainError, Result};
use super::queue::QueueId;

/// Job ID (UUID v4)
pub type JobId = String;

/// Opaque token handed out with each claim. Reporting an outcome or
/// extending the lease requires the token of the current claim.
pub type LeaseToken = String;

/// Upper bound for any computed retry delay (1 hour)
pub const MAX_BACKOFF_DELAY_MS: i64 = 60 * 60 * 1000;

/// Job State
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(JobState::Waiting),
            "ACTIVE" => Some(JobState::Active),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "WAITING"),
            JobState::Active => write!(f, "ACTIVE"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Retry backoff policy.
///
/// `attempts_made` is the number of failures recorded so far, so the first
/// retry is computed with `attempts_made = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Same delay before every retry
    Fixed { delay_ms: i64 },
    /// `base_ms * 2^(attempts_made - 1)`, capped at [`MAX_BACKOFF_DELAY_MS`]
    Exponential { base_ms: i64 },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed {
            delay_ms: delay.as_millis() as i64,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        BackoffPolicy::Exponential {
            base_ms: base.as_millis() as i64,
        }
    }

    /// Delay before the retry that follows the `attempts_made`-th failure
    pub fn delay_ms(&self, attempts_made: i32) -> i64 {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => delay_ms.clamp(0, MAX_BACKOFF_DELAY_MS),
            BackoffPolicy::Exponential { base_ms } => {
                let exponent = attempts_made.saturating_sub(1).clamp(0, 62) as u32;
                base_ms
                    .max(0)
                    .saturating_mul(1i64 << exponent)
                    .min(MAX_BACKOFF_DELAY_MS)
            }
        }
    }

    /// Storage representation: (kind, milliseconds)
    pub fn kind(&self) -> &'static str {
        match self {
            BackoffPolicy::Fixed { .. } => "fixed",
            BackoffPolicy::Exponential { .. } => "exponential",
        }
    }

    pub fn millis(&self) -> i64 {
        match *self {
            BackoffPolicy::Fixed { delay_ms } => delay_ms,
            BackoffPolicy::Exponential { base_ms } => base_ms,
        }
    }

    pub fn from_parts(kind: &str, millis: i64) -> Option<Self> {
        match kind {
            "fixed" => Some(BackoffPolicy::Fixed { delay_ms: millis }),
            "exponential" => Some(BackoffPolicy::Exponential { base_ms: millis }),
            _ => None,
        }
    }
}

/// Job Payload (JSON serializable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload(serde_json::Value);

impl JobPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Decode the payload into a handler-specific type
    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        T::deserialize(&self.0)
    }
}

/// Effective per-job retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
}

/// Job Entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: QueueId,
    pub payload: JobPayload,
    pub state: JobState,

    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,

    pub enqueued_at: i64, // epoch ms
    pub run_at: i64,      // earliest claim time, epoch ms
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub lease_expires_at: Option<i64>,
    pub lease_token: Option<LeaseToken>,
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new waiting job
    ///
    /// ID and timestamps are injected by the caller (see `IdProvider`, `TimeProvider`).
    pub fn new(
        id: impl Into<String>,
        enqueued_at: i64,
        queue: impl Into<String>,
        payload: JobPayload,
        retry: RetrySettings,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: retry.max_attempts,
            backoff: retry.backoff,
            enqueued_at,
            run_at: enqueued_at,
            started_at: None,
            finished_at: None,
            lease_expires_at: None,
            lease_token: None,
            last_error: None,
        }
    }

    /// Create a test job with deterministic ID (test-1, test-2, ...) and timestamp.
    ///
    /// Only for tests. Production code injects ID and time via providers.
    pub fn new_test(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self::new(
            format!("test-{}", counter),
            0,
            queue,
            JobPayload::new(payload),
            RetrySettings {
                max_attempts: 3,
                backoff: BackoffPolicy::Exponential { base_ms: 1000 },
            },
        )
    }

    /// Waiting -> Active, taking a lease that expires at `now + lease_ms`
    pub fn claim(
        &mut self,
        now_millis: i64,
        lease_ms: i64,
        token: impl Into<LeaseToken>,
    ) -> Result<()> {
        if self.state != JobState::Waiting {
            return Err(self.invalid_transition(JobState::Active));
        }
        self.state = JobState::Active;
        self.started_at = Some(now_millis);
        self.lease_expires_at = Some(now_millis + lease_ms);
        self.lease_token = Some(token.into());
        Ok(())
    }

    /// Whether `token` belongs to the claim currently holding this job
    pub fn holds_lease(&self, token: &str) -> bool {
        self.state == JobState::Active && self.lease_token.as_deref() == Some(token)
    }

    /// Active -> Completed
    pub fn complete(&mut self, now_millis: i64) -> Result<()> {
        if self.state != JobState::Active {
            return Err(self.invalid_transition(JobState::Completed));
        }
        self.state = JobState::Completed;
        self.finished_at = Some(now_millis);
        self.lease_expires_at = None;
        self.lease_token = None;
        Ok(())
    }

    /// Record a handler failure: bumps `attempts_made` and stores the error.
    ///
    /// The caller decides afterwards whether to [`Job::requeue`] or [`Job::fail`].
    pub fn record_failure(&mut self, error: impl Into<String>) -> Result<()> {
        if self.state != JobState::Active {
            return Err(self.invalid_transition(JobState::Failed));
        }
        self.attempts_made += 1;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Active -> Waiting, eligible again at `run_at`
    pub fn requeue(&mut self, run_at: i64) {
        self.state = JobState::Waiting;
        self.run_at = run_at;
        self.started_at = None;
        self.lease_expires_at = None;
        self.lease_token = None;
    }

    /// Active -> Failed (terminal)
    pub fn fail(&mut self, now_millis: i64) {
        self.state = JobState::Failed;
        self.finished_at = Some(now_millis);
        self.lease_expires_at = None;
        self.lease_token = None;
    }

    /// Whether an active job's lease has run out
    pub fn is_lease_expired(&self, now_millis: i64) -> bool {
        self.state == JobState::Active
            && self
                .lease_expires_at
                .map(|expires| expires <= now_millis)
                .unwrap_or(true)
    }

    fn invalid_transition(&self, to: JobState) -> DomainError {
        DomainError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = BackoffPolicy::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay_ms(1), 1000);
        assert_eq!(backoff.delay_ms(2), 2000);
        assert_eq!(backoff.delay_ms(3), 4000);
        assert_eq!(backoff.delay_ms(4), 8000);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let backoff = BackoffPolicy::exponential(Duration::from_secs(5));
        assert_eq!(backoff.delay_ms(40), MAX_BACKOFF_DELAY_MS);
        assert_eq!(backoff.delay_ms(i32::MAX), MAX_BACKOFF_DELAY_MS);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffPolicy::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay_ms(1), 250);
        assert_eq!(backoff.delay_ms(7), 250);
    }

    #[test]
    fn test_backoff_parts_roundtrip() {
        let backoff = BackoffPolicy::exponential(Duration::from_millis(1500));
        let restored = BackoffPolicy::from_parts(backoff.kind(), backoff.millis());
        assert_eq!(restored, Some(backoff));
        assert_eq!(BackoffPolicy::from_parts("linear", 10), None);
    }

    #[test]
    fn test_state_transitions() {
        let mut job = Job::new_test("q", json!({}));
        assert_eq!(job.state, JobState::Waiting);

        job.claim(100, 30_000, "lease-a").unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.lease_expires_at, Some(30_100));
        assert!(job.holds_lease("lease-a"));
        assert!(!job.holds_lease("lease-b"));

        // Cannot claim twice
        assert!(job.claim(200, 30_000, "lease-b").is_err());

        job.complete(300).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.lease_expires_at, None);
        assert!(!job.holds_lease("lease-a"));
        assert!(job.state.is_terminal());
    }

    #[test]
    fn test_record_failure_requires_active() {
        let mut job = Job::new_test("q", json!({}));
        assert!(job.record_failure("boom").is_err());

        job.claim(0, 1000, "lease-a").unwrap();
        job.record_failure("boom").unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        job.requeue(5000);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.run_at, 5000);
        assert_eq!(job.lease_token, None);
    }

    #[test]
    fn test_lease_expiry() {
        let mut job = Job::new_test("q", json!({}));
        assert!(!job.is_lease_expired(10));
        job.claim(0, 1000, "lease-a").unwrap();
        assert!(!job.is_lease_expired(999));
        assert!(job.is_lease_expired(1000));
    }

    #[test]
    fn test_payload_decode() {
        #[derive(Deserialize)]
        struct CheckSource {
            source_id: String,
        }

        let payload = JobPayload::new(json!({"source_id": "feed-7"}));
        let decoded: CheckSource = payload.decode().unwrap();
        assert_eq!(decoded.source_id, "feed-7");

        let bad = JobPayload::new(json!({"other": 1}));
        assert!(bad.decode::<CheckSource>().is_err());
    }
}
