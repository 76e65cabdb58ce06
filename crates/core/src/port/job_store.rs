// Job Store Port (Interface)
//
// Contract of the durable queue store. Mutual exclusion of jobs is delegated
// to `claim_next`, which must atomically move exactly one waiting job to
// ACTIVE and hand out a lease. Every claim carries a fresh lease token;
// lease extension and outcome reports are rejected unless they present the
// token of the current claim, so a worker whose lease was reclaimed cannot
// touch the job once another worker holds it.

use crate::domain::{Job, JobId, JobState, RetentionPolicy};
use crate::error::Result;
use async_trait::async_trait;

/// What the store did with a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Re-queued; claimable again at `retry_at` (epoch ms)
    Retrying { attempts_made: i32, retry_at: i64 },
    /// Attempts exhausted; job is FAILED and kept per the failed-retention policy
    Failed { attempts_made: i32 },
}

impl FailOutcome {
    pub fn attempts_made(&self) -> i32 {
        match *self {
            FailOutcome::Retrying { attempts_made, .. } => attempts_made,
            FailOutcome::Failed { attempts_made } => attempts_made,
        }
    }

    pub fn will_retry(&self) -> bool {
        matches!(self, FailOutcome::Retrying { .. })
    }
}

/// Jobs removed by one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionStats {
    pub completed_removed: u64,
    pub failed_removed: u64,
}

impl EvictionStats {
    pub fn total(&self) -> u64 {
        self.completed_removed + self.failed_removed
    }
}

/// Durable queue store
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new waiting job
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Find job by ID
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>>;

    /// Atomically claim the next due job (FIFO by run_at, then enqueue time).
    /// The returned job carries the lease token of this claim.
    async fn claim_next(&self, queue: &str, lease_ms: i64) -> Result<Option<Job>>;

    /// Push the lease of an active job to `now + lease_ms`.
    /// Returns false if the job is no longer active under `lease_token`.
    async fn extend_lease(&self, id: &JobId, lease_token: &str, lease_ms: i64) -> Result<bool>;

    /// Active -> Completed
    async fn complete(&self, id: &JobId, lease_token: &str) -> Result<()>;

    /// Record a failed attempt; re-queue with backoff or mark FAILED
    async fn fail(&self, id: &JobId, lease_token: &str, error: &str) -> Result<FailOutcome>;

    /// Return active jobs with expired leases to WAITING
    async fn reclaim_expired(&self) -> Result<u64>;

    /// Evict finished jobs beyond the retention caps, oldest first
    async fn evict(&self, queue: &str, retention: &RetentionPolicy) -> Result<EvictionStats>;

    /// Count jobs by state
    async fn count_by_state(&self, queue: &str, state: JobState) -> Result<i64>;

    /// Flush buffered writes and release the connection
    async fn close(&self) -> Result<()>;

    /// Release the connection without flushing
    async fn force_close(&self);
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::application::retry::RetryPolicy;
    use crate::error::AppError;
    use crate::port::TimeProvider;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};

    /// In-memory job store with the same claim/lease/retry semantics as the SQLite adapter
    pub struct InMemoryJobStore {
        jobs: Mutex<Vec<Job>>,
        time_provider: Arc<dyn TimeProvider>,
        retry_policy: RetryPolicy,
        claims: AtomicU64,
        closed: AtomicBool,
        force_closed: AtomicBool,
        fail_close: bool,
    }

    impl InMemoryJobStore {
        pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
            Self {
                jobs: Mutex::new(Vec::new()),
                retry_policy: RetryPolicy::new(Arc::clone(&time_provider)),
                time_provider,
                claims: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                force_closed: AtomicBool::new(false),
                fail_close: false,
            }
        }

        /// Make `close()` fail, to exercise the forced-disconnect path
        pub fn with_failing_close(mut self) -> Self {
            self.fail_close = true;
            self
        }

        /// Read a job even after the store was closed
        pub fn snapshot(&self, id: &str) -> Option<Job> {
            self.lock().iter().find(|j| j.id == id).cloned()
        }

        /// Let the lease of an active job run out immediately
        pub fn expire_lease(&self, id: &str) {
            let now = self.time_provider.now_millis();
            if let Some(job) = self.lock().iter_mut().find(|j| j.id == id) {
                job.lease_expires_at = Some(now);
            }
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn was_force_closed(&self) -> bool {
            self.force_closed.load(Ordering::SeqCst)
        }

        fn lock(&self) -> MutexGuard<'_, Vec<Job>> {
            self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        fn ensure_open(&self) -> Result<()> {
            if self.is_closed() {
                return Err(AppError::Connectivity("store connection closed".to_string()));
            }
            Ok(())
        }

        fn leased_job<'a>(jobs: &'a mut [Job], id: &str, token: &str) -> Result<&'a mut Job> {
            let job = jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
            if job.state != JobState::Active {
                return Err(AppError::InvalidState(format!(
                    "Job {} is {}, not ACTIVE",
                    id, job.state
                )));
            }
            if !job.holds_lease(token) {
                return Err(AppError::InvalidState(format!(
                    "Job {} is leased to another claim",
                    id
                )));
            }
            Ok(job)
        }

        fn evict_state(
            jobs: &mut Vec<Job>,
            queue: &str,
            state: JobState,
            keep: &crate::domain::KeepJobs,
            now: i64,
        ) -> u64 {
            let cutoff = now - keep.max_age.as_millis() as i64;
            let mut finished: Vec<(i64, String)> = jobs
                .iter()
                .filter(|j| j.queue == queue && j.state == state)
                .map(|j| (j.finished_at.unwrap_or(0), j.id.clone()))
                .collect();
            // Newest first; everything past max_count or older than cutoff goes
            finished.sort_by(|a, b| b.cmp(a));
            let doomed: Vec<String> = finished
                .into_iter()
                .enumerate()
                .filter(|(rank, (finished_at, _))| {
                    *rank >= keep.max_count as usize || *finished_at < cutoff
                })
                .map(|(_, (_, id))| id)
                .collect();
            jobs.retain(|j| !doomed.contains(&j.id));
            doomed.len() as u64
        }
    }

    #[async_trait]
    impl JobStore for InMemoryJobStore {
        async fn insert(&self, job: &Job) -> Result<()> {
            self.ensure_open()?;
            let mut jobs = self.lock();
            if jobs.iter().any(|j| j.id == job.id) {
                return Err(AppError::Database(format!(
                    "Unique constraint violation: job {}",
                    job.id
                )));
            }
            jobs.push(job.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
            self.ensure_open()?;
            Ok(self.snapshot(id))
        }

        async fn claim_next(&self, queue: &str, lease_ms: i64) -> Result<Option<Job>> {
            self.ensure_open()?;
            let now = self.time_provider.now_millis();
            let mut jobs = self.lock();
            let next = jobs
                .iter_mut()
                .filter(|j| j.queue == queue && j.state == JobState::Waiting && j.run_at <= now)
                .min_by_key(|j| (j.run_at, j.enqueued_at));
            match next {
                Some(job) => {
                    let claim = self.claims.fetch_add(1, Ordering::SeqCst) + 1;
                    job.claim(now, lease_ms, format!("lease-{}", claim))?;
                    Ok(Some(job.clone()))
                }
                None => Ok(None),
            }
        }

        async fn extend_lease(
            &self,
            id: &JobId,
            lease_token: &str,
            lease_ms: i64,
        ) -> Result<bool> {
            self.ensure_open()?;
            let now = self.time_provider.now_millis();
            let mut jobs = self.lock();
            match jobs
                .iter_mut()
                .find(|j| &j.id == id && j.holds_lease(lease_token))
            {
                Some(job) => {
                    job.lease_expires_at = Some(now + lease_ms);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn complete(&self, id: &JobId, lease_token: &str) -> Result<()> {
            self.ensure_open()?;
            let now = self.time_provider.now_millis();
            let mut jobs = self.lock();
            Self::leased_job(&mut jobs, id, lease_token)?.complete(now)?;
            Ok(())
        }

        async fn fail(&self, id: &JobId, lease_token: &str, error: &str) -> Result<FailOutcome> {
            self.ensure_open()?;
            let mut jobs = self.lock();
            let job = Self::leased_job(&mut jobs, id, lease_token)?;
            self.retry_policy.apply_failure(job, error)
        }

        async fn reclaim_expired(&self) -> Result<u64> {
            self.ensure_open()?;
            let now = self.time_provider.now_millis();
            let mut reclaimed = 0;
            for job in self.lock().iter_mut().filter(|j| j.is_lease_expired(now)) {
                job.requeue(now);
                reclaimed += 1;
            }
            Ok(reclaimed)
        }

        async fn evict(&self, queue: &str, retention: &RetentionPolicy) -> Result<EvictionStats> {
            self.ensure_open()?;
            let now = self.time_provider.now_millis();
            let mut jobs = self.lock();
            Ok(EvictionStats {
                completed_removed: Self::evict_state(
                    &mut jobs,
                    queue,
                    JobState::Completed,
                    &retention.completed,
                    now,
                ),
                failed_removed: Self::evict_state(
                    &mut jobs,
                    queue,
                    JobState::Failed,
                    &retention.failed,
                    now,
                ),
            })
        }

        async fn count_by_state(&self, queue: &str, state: JobState) -> Result<i64> {
            self.ensure_open()?;
            Ok(self
                .lock()
                .iter()
                .filter(|j| j.queue == queue && j.state == state)
                .count() as i64)
        }

        async fn close(&self) -> Result<()> {
            if self.fail_close {
                return Err(AppError::Database("flush failed on close".to_string()));
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn force_close(&self) {
            self.force_closed.store(true, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
