// Retry logic
use crate::domain::Job;
use crate::error::Result;
use crate::port::{FailOutcome, TimeProvider};
use std::sync::Arc;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the job (with backoff delay in ms)
    Retry(i64),
    /// Do not retry, job has failed permanently
    Failed,
}

/// Retry policy for stores that transition jobs in process
///
/// The SQLite adapter evaluates the same rule inside its failure UPDATE.
///
/// Determines if a job should be retried based on:
/// - Failures recorded so far (`attempts_made`)
/// - Maximum attempts allowed
/// - The job's backoff policy
pub struct RetryPolicy {
    time_provider: Arc<dyn TimeProvider>,
}

impl RetryPolicy {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self { time_provider }
    }

    /// Decide what happens after a failure was recorded on `job`
    ///
    /// Must be called after `attempts_made` was incremented. A job with
    /// `max_attempts = k` therefore runs exactly k times before failing.
    pub fn should_retry(&self, job: &Job) -> RetryDecision {
        if job.attempts_made >= job.max_attempts {
            warn!(
                job_id = %job.id,
                attempts_made = %job.attempts_made,
                max_attempts = %job.max_attempts,
                "Max retry attempts reached"
            );
            return RetryDecision::Failed;
        }

        let delay_ms = job.backoff.delay_ms(job.attempts_made);

        info!(
            job_id = %job.id,
            attempts_made = %job.attempts_made,
            max_attempts = %job.max_attempts,
            delay_ms = %delay_ms,
            "Scheduling retry"
        );

        RetryDecision::Retry(delay_ms)
    }

    /// Record a failure on an ACTIVE job and move it to its next state
    pub fn apply_failure(&self, job: &mut Job, error: &str) -> Result<FailOutcome> {
        job.record_failure(error)?;
        let now = self.time_provider.now_millis();

        match self.should_retry(job) {
            RetryDecision::Retry(delay_ms) => {
                let retry_at = now + delay_ms;
                job.requeue(retry_at);
                Ok(FailOutcome::Retrying {
                    attempts_made: job.attempts_made,
                    retry_at,
                })
            }
            RetryDecision::Failed => {
                job.fail(now);
                Ok(FailOutcome::Failed {
                    attempts_made: job.attempts_made,
                })
            }
        }
    }
}
