//! Queue handlers, the production routine and the worker event logger
//!
//! What "checking a source" or "delivering a notification" means belongs to
//! the services that own those domains. The handlers here decode the payload,
//! log the work, and chain a notification after every source check.

use async_trait::async_trait;
use cadence_core::application::{QueueHandle, WorkerEvent};
use cadence_core::domain::Job;
use cadence_core::error::{AppError, Result};
use cadence_core::port::{HandlerError, JobHandler, ProductionRoutine};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckSourcePayload {
    pub source_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationPayload {
    pub source_id: String,
    pub checked_at: i64,
}

/// `check-sources` handler; enqueues a notification for each checked source
pub struct CheckSourceHandler {
    notifications: QueueHandle,
}

impl CheckSourceHandler {
    pub fn new(notifications: QueueHandle) -> Self {
        Self { notifications }
    }
}

#[async_trait]
impl JobHandler for CheckSourceHandler {
    async fn handle(&self, job: &Job) -> std::result::Result<(), HandlerError> {
        let payload: CheckSourcePayload = job.payload.decode()?;
        info!(job_id = %job.id, source_id = %payload.source_id, "Checking source");

        self.notifications
            .enqueue(
                &NotificationPayload {
                    source_id: payload.source_id,
                    checked_at: chrono::Utc::now().timestamp_millis(),
                },
                None,
            )
            .await
            .map_err(|e| HandlerError::failed(format!("could not enqueue notification: {}", e)))?;
        Ok(())
    }
}

/// `notifications` handler
pub struct NotificationHandler;

#[async_trait]
impl JobHandler for NotificationHandler {
    async fn handle(&self, job: &Job) -> std::result::Result<(), HandlerError> {
        let payload: NotificationPayload = job.payload.decode()?;
        info!(
            job_id = %job.id,
            source_id = %payload.source_id,
            checked_at = payload.checked_at,
            attempt = job.attempts_made + 1,
            "Delivering notification"
        );
        Ok(())
    }
}

/// Scheduler routine: one `check-sources` job per configured source
pub struct SourceCheckRoutine {
    queue: QueueHandle,
    sources: Vec<String>,
}

impl SourceCheckRoutine {
    pub fn new(queue: QueueHandle, sources: Vec<String>) -> Self {
        Self { queue, sources }
    }
}

#[async_trait]
impl ProductionRoutine for SourceCheckRoutine {
    async fn produce(&self) -> Result<()> {
        if self.sources.is_empty() {
            debug!("No sources configured, nothing to enqueue");
            return Ok(());
        }

        let mut failures = 0;
        for source_id in &self.sources {
            let payload = CheckSourcePayload {
                source_id: source_id.clone(),
            };
            if let Err(e) = self.queue.enqueue(&payload, None).await {
                warn!(source_id = %source_id, error = %e, "Failed to enqueue source check");
                failures += 1;
            }
        }

        if failures > 0 {
            return Err(AppError::Internal(format!(
                "{} of {} source checks could not be enqueued",
                failures,
                self.sources.len()
            )));
        }
        info!(sources = self.sources.len(), "Source checks enqueued");
        Ok(())
    }
}

/// Log every worker event until the engine is dropped
pub fn spawn_event_logger(
    queue: String,
    mut events: broadcast::Receiver<WorkerEvent>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let record = serde_json::to_string(&event)?;
                    info!(queue = %queue, event = %record, "Worker event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(queue = %queue, skipped, "Event logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    })
}
