// Queue Handle - typed producer API bound to one queue

use crate::domain::{
    validate_queue_name, Job, JobId, JobOptions, JobPayload, JobState, QueueId, QueueOptions,
};
use crate::error::{EnqueueError, Result};
use crate::port::{IdProvider, JobStore, TimeProvider};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Deepest payload nesting accepted by `enqueue`
pub const MAX_PAYLOAD_DEPTH: usize = 32;

/// Reference to an enqueued job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: QueueId,
    /// Earliest claim time (epoch ms)
    pub run_at: i64,
}

/// Jobs per state in one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Producer handle for one named queue with immutable default options
#[derive(Clone)]
pub struct QueueHandle {
    name: QueueId,
    options: QueueOptions,
    store: Arc<dyn JobStore>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl QueueHandle {
    pub fn new(
        name: impl Into<String>,
        options: QueueOptions,
        store: Arc<dyn JobStore>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> std::result::Result<Self, EnqueueError> {
        let name = name.into();
        validate_queue_name(&name)?;
        if options.attempts < 1 {
            return Err(EnqueueError::Validation(format!(
                "queue {} needs attempts >= 1",
                name
            )));
        }
        Ok(Self {
            name,
            options,
            store,
            id_provider,
            time_provider,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Serialize `payload` and persist it as a waiting job
    ///
    /// Per-job `options` override the queue's attempts and backoff. Errors are
    /// returned to the caller, never dropped.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: Option<JobOptions>,
    ) -> std::result::Result<JobHandle, EnqueueError> {
        let value = serde_json::to_value(payload)?;
        let depth = json_depth(&value);
        if depth > MAX_PAYLOAD_DEPTH {
            return Err(EnqueueError::Validation(format!(
                "payload nesting depth {} exceeds {}",
                depth, MAX_PAYLOAD_DEPTH
            )));
        }

        let overrides = options.unwrap_or_default();
        let retry = self.options.resolve(&overrides)?;

        let now = self.time_provider.now_millis();
        let mut job = Job::new(
            self.id_provider.generate_id(),
            now,
            self.name.clone(),
            JobPayload::new(value),
            retry,
        );
        if let Some(delay) = overrides.delay {
            job.run_at = now + delay.as_millis() as i64;
        }

        if let Err(e) = self.store.insert(&job).await {
            warn!(queue = %self.name, error = %e, "Enqueue failed");
            return Err(EnqueueError::StoreUnavailable(e.to_string()));
        }

        debug!(
            queue = %self.name,
            job_id = %job.id,
            max_attempts = job.max_attempts,
            run_at = job.run_at,
            "Job enqueued"
        );

        Ok(JobHandle {
            id: job.id,
            queue: job.queue,
            run_at: job.run_at,
        })
    }

    /// Look up a job of this queue
    pub async fn job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self
            .store
            .find_by_id(id)
            .await?
            .filter(|job| job.queue == self.name))
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        Ok(QueueCounts {
            waiting: self.store.count_by_state(&self.name, JobState::Waiting).await?,
            active: self.store.count_by_state(&self.name, JobState::Active).await?,
            completed: self.store.count_by_state(&self.name, JobState::Completed).await?,
            failed: self.store.count_by_state(&self.name, JobState::Failed).await?,
        })
    }
}

/// Nesting depth of a JSON value (scalars are depth 0)
fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        serde_json::Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BackoffPolicy;
    use crate::port::id_provider::SequentialIdProvider;
    use crate::port::job_store::mocks::InMemoryJobStore;
    use crate::port::time_provider::TokioClock;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    fn queue(name: &str) -> (QueueHandle, Arc<InMemoryJobStore>, Arc<TokioClock>) {
        let clock = Arc::new(TokioClock::new());
        let store = Arc::new(InMemoryJobStore::new(clock.clone()));
        let handle = QueueHandle::new(
            name,
            QueueOptions::critical(),
            store.clone(),
            Arc::new(SequentialIdProvider::new("job")),
            clock.clone(),
        )
        .unwrap();
        (handle, store, clock)
    }

    #[tokio::test]
    async fn test_enqueue_applies_queue_defaults() {
        let (queue, store, _) = queue("check-sources");

        let handle = queue.enqueue(&json!({"source": "rss-1"}), None).await.unwrap();
        assert_eq!(handle.id, "job-1");
        assert_eq!(handle.queue, "check-sources");

        let job = store.snapshot(&handle.id).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 5);
        assert_eq!(job.backoff, BackoffPolicy::Exponential { base_ms: 1000 });
        assert_eq!(job.payload.as_value(), &json!({"source": "rss-1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_with_overrides_and_delay() {
        let (queue, store, clock) = queue("notifications");
        let now = clock.now_millis();

        let options = JobOptions::default()
            .attempts(2)
            .backoff(BackoffPolicy::fixed(Duration::from_millis(250)))
            .delay(Duration::from_secs(10));
        let handle = queue.enqueue(&json!({}), Some(options)).await.unwrap();

        let job = store.snapshot(&handle.id).unwrap();
        assert_eq!(job.max_attempts, 2);
        assert_eq!(job.backoff, BackoffPolicy::Fixed { delay_ms: 250 });
        assert_eq!(job.run_at, now + 10_000);
        assert!(store.claim_next("notifications", 1000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enqueue_typed_payload() {
        #[derive(Serialize)]
        struct CheckSource<'a> {
            source_id: &'a str,
        }

        let (queue, _, _) = queue("check-sources");
        let handle = queue
            .enqueue(&CheckSource { source_id: "feed-7" }, None)
            .await
            .unwrap();
        let job = queue.job(&handle.id).await.unwrap().unwrap();

        #[derive(serde::Deserialize)]
        struct Decoded {
            source_id: String,
        }
        let decoded: Decoded = job.payload.decode().unwrap();
        assert_eq!(decoded.source_id, "feed-7");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_unserializable_payload() {
        let (queue, _, _) = queue("q");
        // Non-string map keys cannot become JSON
        let mut payload = HashMap::new();
        payload.insert(vec![1u8], 1);

        let err = queue.enqueue(&payload, None).await.unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_validate_payload_depth() {
        let (queue, _, _) = queue("q");
        let mut deep = json!({"level": 0});
        for i in 1..=35 {
            deep = json!({"level": i, "nested": deep});
        }

        let err = queue.enqueue(&deep, None).await.unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[tokio::test]
    async fn test_invalid_attempts_rejected() {
        let (queue, _, _) = queue("q");
        let err = queue
            .enqueue(&json!({}), Some(JobOptions::default().attempts(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalid_queue_name_rejected() {
        let clock = Arc::new(TokioClock::new());
        let result = QueueHandle::new(
            "invalid@queue!",
            QueueOptions::critical(),
            Arc::new(InMemoryJobStore::new(clock.clone())),
            Arc::new(SequentialIdProvider::new("job")),
            clock,
        );
        assert!(matches!(result, Err(EnqueueError::Validation(_))));
    }

    #[tokio::test]
    async fn test_enqueue_fails_when_store_unreachable() {
        let (queue, store, _) = queue("q");
        store.close().await.unwrap();

        let err = tokio_test::assert_err!(queue.enqueue(&json!({}), None).await);
        assert!(matches!(err, EnqueueError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_counts_by_state() {
        let (queue, store, _) = queue("q");
        for _ in 0..3 {
            queue.enqueue(&json!({}), None).await.unwrap();
        }
        let claimed = store.claim_next("q", 1000).await.unwrap().unwrap();
        store
            .complete(&claimed.id, claimed.lease_token.as_deref().unwrap())
            .await
            .unwrap();
        store.claim_next("q", 1000).await.unwrap().unwrap();

        assert_eq!(
            queue.counts().await.unwrap(),
            QueueCounts {
                waiting: 1,
                active: 1,
                completed: 1,
                failed: 0,
            }
        );
    }

    #[test]
    fn test_json_depth() {
        assert_eq!(json_depth(&json!(1)), 0);
        assert_eq!(json_depth(&json!({"a": [1, 2]})), 2);
    }
}
