// SQLite JobStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use cadence_core::domain::{
    BackoffPolicy, Job, JobId, JobPayload, JobState, KeepJobs, RetentionPolicy,
    MAX_BACKOFF_DELAY_MS,
};
use cadence_core::error::{AppError, Result};
use cadence_core::port::{EvictionStats, FailOutcome, JobStore, TimeProvider};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SqliteJobStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Explain why a conditional update on a leased job touched no row
    async fn not_leased_error(&self, id: &JobId, action: &str) -> AppError {
        let state: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match state {
            Ok(None) => AppError::NotFound(format!("Job {} not found", id)),
            Ok(Some(current)) if current == "ACTIVE" => AppError::InvalidState(format!(
                "Cannot {} job {}: leased to another claim",
                action, id
            )),
            Ok(Some(current)) => AppError::InvalidState(format!(
                "Cannot {} job {}: state is {}, not ACTIVE",
                action, id, current
            )),
            Err(e) => map_sqlx_error(e),
        }
    }

    async fn evict_state(
        tx: &mut Transaction<'_, Sqlite>,
        queue: &str,
        state: JobState,
        keep: &KeepJobs,
        now: i64,
    ) -> Result<u64> {
        let cutoff = now - keep.max_age.as_millis() as i64;

        // Older than the age cap, or beyond the newest `max_count`
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = ?1 AND state = ?2
              AND (
                finished_at < ?3
                OR id NOT IN (
                    SELECT id FROM jobs
                    WHERE queue = ?1 AND state = ?2
                    ORDER BY finished_at DESC, id DESC
                    LIMIT ?4
                )
              )
            "#,
        )
        .bind(queue)
        .bind(state.to_string())
        .bind(cutoff)
        .bind(keep.max_count as i64)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, payload, state,
                attempts_made, max_attempts, backoff_kind, backoff_ms,
                enqueued_at, run_at, started_at, finished_at,
                lease_expires_at, lease_token, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(job.payload.as_value().to_string())
        .bind(job.state.to_string())
        .bind(job.attempts_made)
        .bind(job.max_attempts)
        .bind(job.backoff.kind())
        .bind(job.backoff.millis())
        .bind(job.enqueued_at)
        .bind(job.run_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.lease_expires_at)
        .bind(&job.lease_token)
        .bind(&job.last_error)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn claim_next(&self, queue: &str, lease_ms: i64) -> Result<Option<Job>> {
        let now = self.time_provider.now_millis();

        // Single statement: the selected row is moved to ACTIVE atomically,
        // so two workers can never claim the same job. Each claim gets a
        // fresh random lease token.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET state = 'ACTIVE', started_at = ?1, lease_expires_at = ?2,
                lease_token = lower(hex(randomblob(16)))
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?3 AND state = 'WAITING' AND run_at <= ?1
                ORDER BY run_at ASC, enqueued_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now + lease_ms)
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn extend_lease(&self, id: &JobId, lease_token: &str, lease_ms: i64) -> Result<bool> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = ?
            WHERE id = ? AND state = 'ACTIVE' AND lease_token = ?
            "#,
        )
        .bind(now + lease_ms)
        .bind(id)
        .bind(lease_token)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete(&self, id: &JobId, lease_token: &str) -> Result<()> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'COMPLETED', finished_at = ?, lease_expires_at = NULL, lease_token = NULL
            WHERE id = ? AND state = 'ACTIVE' AND lease_token = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(lease_token)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.not_leased_error(id, "complete").await);
        }
        Ok(())
    }

    async fn fail(&self, id: &JobId, lease_token: &str, error: &str) -> Result<FailOutcome> {
        let now = self.time_provider.now_millis();

        // One conditional write. The retry decision and the backoff delay
        // (same rule as `BackoffPolicy::delay_ms`) are derived from the stored
        // row, so a report never upgrades a read transaction to a write.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET attempts_made = attempts_made + 1,
                last_error = ?1,
                lease_expires_at = NULL,
                lease_token = NULL,
                state = CASE
                    WHEN attempts_made + 1 >= max_attempts THEN 'FAILED'
                    ELSE 'WAITING'
                END,
                finished_at = CASE
                    WHEN attempts_made + 1 >= max_attempts THEN ?2
                    ELSE NULL
                END,
                started_at = CASE
                    WHEN attempts_made + 1 >= max_attempts THEN started_at
                    ELSE NULL
                END,
                run_at = CASE
                    WHEN attempts_made + 1 >= max_attempts THEN run_at
                    WHEN backoff_kind = 'fixed' THEN ?2 + MIN(MAX(backoff_ms, 0), ?3)
                    ELSE ?2 + MIN(MIN(MAX(backoff_ms, 0), ?3) << MIN(attempts_made, 32), ?3)
                END
            WHERE id = ?4 AND state = 'ACTIVE' AND lease_token = ?5
            RETURNING *
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(MAX_BACKOFF_DELAY_MS)
        .bind(id)
        .bind(lease_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let job = match row {
            Some(row) => row.into_job()?,
            None => return Err(self.not_leased_error(id, "fail").await),
        };

        let outcome = if job.state == JobState::Failed {
            warn!(
                job_id = %id,
                attempts_made = job.attempts_made,
                max_attempts = job.max_attempts,
                "Max retry attempts reached"
            );
            FailOutcome::Failed {
                attempts_made: job.attempts_made,
            }
        } else {
            FailOutcome::Retrying {
                attempts_made: job.attempts_made,
                retry_at: job.run_at,
            }
        };

        debug!(job_id = %id, outcome = ?outcome, "Failure recorded");
        Ok(outcome)
    }

    async fn reclaim_expired(&self) -> Result<u64> {
        let now = self.time_provider.now_millis();
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'WAITING', run_at = ?1, started_at = NULL,
                lease_expires_at = NULL, lease_token = NULL
            WHERE state = 'ACTIVE'
              AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected())
    }

    async fn evict(&self, queue: &str, retention: &RetentionPolicy) -> Result<EvictionStats> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let completed_removed =
            Self::evict_state(&mut tx, queue, JobState::Completed, &retention.completed, now)
                .await?;
        let failed_removed =
            Self::evict_state(&mut tx, queue, JobState::Failed, &retention.failed, now).await?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(EvictionStats {
            completed_removed,
            failed_removed,
        })
    }

    async fn count_by_state(&self, queue: &str, state: JobState) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ? AND state = ?")
                .bind(queue)
                .bind(state.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        Ok(count)
    }

    async fn close(&self) -> Result<()> {
        if self.pool.is_closed() {
            return Ok(());
        }

        // Flush the WAL into the main database file before releasing connections
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        self.pool.close().await;

        info!("SQLite pool closed");
        Ok(())
    }

    async fn force_close(&self) {
        warn!("Closing SQLite pool without checkpoint");
        self.pool.close().await;
    }
}

/// SQLite row representation
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    queue: String,
    payload: String,
    state: String,
    attempts_made: i32,
    max_attempts: i32,
    backoff_kind: String,
    backoff_ms: i64,
    enqueued_at: i64,
    run_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    lease_expires_at: Option<i64>,
    lease_token: Option<String>,
    last_error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let state = JobState::parse(&self.state).ok_or_else(|| {
            AppError::Database(format!("Unknown job state {} for {}", self.state, self.id))
        })?;
        let backoff = BackoffPolicy::from_parts(&self.backoff_kind, self.backoff_ms)
            .ok_or_else(|| {
                AppError::Database(format!(
                    "Unknown backoff kind {} for {}",
                    self.backoff_kind, self.id
                ))
            })?;
        let payload: serde_json::Value = serde_json::from_str(&self.payload)?;

        Ok(Job {
            id: self.id,
            queue: self.queue,
            payload: JobPayload::new(payload),
            state,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            backoff,
            enqueued_at: self.enqueued_at,
            run_at: self.run_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            lease_expires_at: self.lease_expires_at,
            lease_token: self.lease_token,
            last_error: self.last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations, ConnectRetry};
    use cadence_core::domain::RetrySettings;
    use cadence_core::port::time_provider::SystemTimeProvider;
    use std::time::Duration;

    async fn setup_test_db() -> SqliteJobStore {
        let pool = create_pool("sqlite::memory:", 1, &ConnectRetry::default())
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteJobStore::new(pool, Arc::new(SystemTimeProvider))
    }

    fn job(id: &str, queue: &str, enqueued_at: i64, max_attempts: i32) -> Job {
        Job::new(
            id,
            enqueued_at,
            queue,
            JobPayload::new(serde_json::json!({"key": "value"})),
            RetrySettings {
                max_attempts,
                backoff: BackoffPolicy::Fixed { delay_ms: 0 },
            },
        )
    }

    fn now() -> i64 {
        SystemTimeProvider.now_millis()
    }

    fn token(job: &Job) -> &str {
        job.lease_token.as_deref().unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = setup_test_db().await;
        let mut original = job("j1", "q", now(), 4);
        original.backoff = BackoffPolicy::Exponential { base_ms: 1500 };
        store.insert(&original).await.unwrap();

        let found = store.find_by_id(&"j1".to_string()).await.unwrap().unwrap();
        assert_eq!(found.id, "j1");
        assert_eq!(found.state, JobState::Waiting);
        assert_eq!(found.max_attempts, 4);
        assert_eq!(found.backoff, BackoffPolicy::Exponential { base_ms: 1500 });
        assert_eq!(found.payload.as_value(), &serde_json::json!({"key": "value"}));
        assert!(store.find_by_id(&"missing".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = setup_test_db().await;
        store.insert(&job("j1", "q", now(), 1)).await.unwrap();
        let err = store.insert(&job("j1", "q", now(), 1)).await.unwrap_err();
        assert!(err.to_string().contains("Unique constraint"));
    }

    #[tokio::test]
    async fn test_claim_next_is_fifo_and_skips_future_jobs() {
        let store = setup_test_db().await;
        let t = now();

        let mut later = job("later", "q", t - 30, 1);
        later.run_at = t + 60_000;
        store.insert(&later).await.unwrap();
        store.insert(&job("second", "q", t - 10, 1)).await.unwrap();
        store.insert(&job("first", "q", t - 20, 1)).await.unwrap();
        store.insert(&job("elsewhere", "other", t - 40, 1)).await.unwrap();

        let first = store.claim_next("q", 30_000).await.unwrap().unwrap();
        assert_eq!(first.id, "first");
        assert_eq!(first.state, JobState::Active);
        assert!(first.lease_expires_at.unwrap() >= t + 30_000);
        assert_eq!(token(&first).len(), 32);

        let second = store.claim_next("q", 30_000).await.unwrap().unwrap();
        assert_eq!(second.id, "second");
        assert_ne!(token(&first), token(&second));
        assert!(store.claim_next("q", 30_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_retries_then_marks_failed() {
        let store = setup_test_db().await;
        store.insert(&job("j", "q", now(), 2)).await.unwrap();
        let id = "j".to_string();

        let claimed = store.claim_next("q", 30_000).await.unwrap().unwrap();
        let outcome = store.fail(&id, token(&claimed), "first").await.unwrap();
        assert!(outcome.will_retry());
        assert_eq!(outcome.attempts_made(), 1);

        let waiting = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(waiting.state, JobState::Waiting);
        assert_eq!(waiting.lease_expires_at, None);
        assert_eq!(waiting.lease_token, None);

        let claimed = store.claim_next("q", 30_000).await.unwrap().unwrap();
        let outcome = store.fail(&id, token(&claimed), "second").await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed { attempts_made: 2 });

        let failed = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("second"));
        assert!(failed.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_requires_active() {
        let store = setup_test_db().await;
        store.insert(&job("j", "q", now(), 1)).await.unwrap();
        let id = "j".to_string();

        let err = store.complete(&id, "any").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        let err = store.complete(&"nope".to_string(), "any").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let claimed = store.claim_next("q", 30_000).await.unwrap().unwrap();
        store.complete(&id, token(&claimed)).await.unwrap();
        assert_eq!(
            store.count_by_state("q", JobState::Completed).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_lease_extension_and_reclaim() {
        let store = setup_test_db().await;
        store.insert(&job("j", "q", now(), 3)).await.unwrap();
        let id = "j".to_string();

        let claimed = store.claim_next("q", 1).await.unwrap().unwrap();
        assert!(store.extend_lease(&id, token(&claimed), 60_000).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.reclaim_expired().await.unwrap(), 0);

        store.extend_lease(&id, token(&claimed), 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.reclaim_expired().await.unwrap(), 1);

        let reclaimed = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(reclaimed.state, JobState::Waiting);
        assert_eq!(reclaimed.attempts_made, 0);
        assert_eq!(reclaimed.lease_token, None);
        assert!(!store.extend_lease(&id, token(&claimed), 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_claim_is_fenced_off_after_reclaim() {
        let store = setup_test_db().await;
        store.insert(&job("j", "q", now(), 3)).await.unwrap();
        let id = "j".to_string();

        let stale = store.claim_next("q", 100).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.reclaim_expired().await.unwrap(), 1);
        let current = store.claim_next("q", 30_000).await.unwrap().unwrap();

        assert!(!store.extend_lease(&id, token(&stale), 30_000).await.unwrap());
        let err = store.complete(&id, token(&stale)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)), "got {:?}", err);
        let err = store.fail(&id, token(&stale), "late").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)), "got {:?}", err);

        let still_active = store.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(still_active.state, JobState::Active);
        assert_eq!(still_active.attempts_made, 0);
        assert_eq!(still_active.lease_token, current.lease_token);

        assert!(store.extend_lease(&id, token(&current), 30_000).await.unwrap());
        store.complete(&id, token(&current)).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_delay_matches_backoff_policy() {
        let store = setup_test_db().await;
        let backoffs = [
            BackoffPolicy::Exponential { base_ms: 1000 },
            BackoffPolicy::Exponential { base_ms: 7_000_000 },
            BackoffPolicy::Fixed { delay_ms: 250 },
        ];

        for (n, backoff) in backoffs.iter().enumerate() {
            let id = format!("j{}", n);
            let mut retried = job(&id, "q", now(), 40);
            retried.backoff = *backoff;
            store.insert(&retried).await.unwrap();

            for attempt in 1..=39 {
                // Make the job due again regardless of the last delay
                sqlx::query("UPDATE jobs SET run_at = 0 WHERE id = ?")
                    .bind(&id)
                    .execute(&store.pool)
                    .await
                    .unwrap();
                let claimed = store.claim_next("q", 30_000).await.unwrap().unwrap();
                let before = now();
                let outcome = store.fail(&id, token(&claimed), "boom").await.unwrap();
                let after = now();

                let FailOutcome::Retrying { attempts_made, retry_at } = outcome else {
                    panic!("attempt {} should retry, got {:?}", attempt, outcome);
                };
                assert_eq!(attempts_made, attempt);
                let expected = backoff.delay_ms(attempt);
                assert!(
                    retry_at >= before + expected && retry_at <= after + expected,
                    "{:?} attempt {}: retry_at {} not {} after failure",
                    backoff,
                    attempt,
                    retry_at,
                    expected
                );
            }
        }
    }

    #[tokio::test]
    async fn test_evict_by_count_and_age() {
        let store = setup_test_db().await;
        let t = now();

        for i in 0..5 {
            let mut done = job(&format!("c{}", i), "q", t, 1);
            done.state = JobState::Completed;
            done.finished_at = Some(t - 1000 + i);
            store.insert(&done).await.unwrap();
        }
        let mut stale = job("f-old", "q", t, 1);
        stale.state = JobState::Failed;
        stale.finished_at = Some(t - 7_200_000);
        store.insert(&stale).await.unwrap();
        let mut fresh = job("f-new", "q", t, 1);
        fresh.state = JobState::Failed;
        fresh.finished_at = Some(t);
        store.insert(&fresh).await.unwrap();

        let retention = RetentionPolicy {
            completed: KeepJobs::new(2, Duration::from_secs(3600)),
            failed: KeepJobs::new(10, Duration::from_secs(3600)),
        };
        let stats = store.evict("q", &retention).await.unwrap();
        assert_eq!(
            stats,
            EvictionStats {
                completed_removed: 3,
                failed_removed: 1,
            }
        );
        // Newest two completed jobs survive
        assert!(store.find_by_id(&"c4".to_string()).await.unwrap().is_some());
        assert!(store.find_by_id(&"c3".to_string()).await.unwrap().is_some());
        assert!(store.find_by_id(&"c0".to_string()).await.unwrap().is_none());
        assert!(store.find_by_id(&"f-new".to_string()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_operations_after_close_are_connectivity_errors() {
        let store = setup_test_db().await;
        store.close().await.unwrap();
        store.close().await.unwrap();

        let err = store.insert(&job("j", "q", now(), 1)).await.unwrap_err();
        assert!(matches!(err, AppError::Connectivity(_)), "got {:?}", err);
    }
}
