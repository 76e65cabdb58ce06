// Worker lifecycle events, broadcast to logging/metrics subscribers

use crate::domain::{JobId, QueueId};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Completed {
        queue: QueueId,
        job_id: JobId,
    },
    Failed {
        queue: QueueId,
        job_id: JobId,
        error: String,
        attempts_made: i32,
        /// false once attempts are exhausted
        will_retry: bool,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> &str {
        match self {
            WorkerEvent::Completed { job_id, .. } | WorkerEvent::Failed { job_id, .. } => job_id,
        }
    }
}
