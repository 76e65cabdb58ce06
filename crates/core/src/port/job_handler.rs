// Job Handler Port
// One handler per queue, supplied by the domain layer

use crate::domain::Job;
use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

/// Failure reported by a job handler. Never fatal to the worker.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Executes the business logic of one queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`]
pub struct FnHandler<F>(F);

/// Wrap `f` as a handler; `f` receives an owned copy of the job
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        (self.0)(job.clone()).await
    }
}
