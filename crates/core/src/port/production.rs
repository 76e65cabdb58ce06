// Production Routine Port
// Supplied by the domain layer, invoked by the scheduler loop on every cycle

use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;

/// Decides what work to enqueue in one scheduler cycle
#[async_trait]
pub trait ProductionRoutine: Send + Sync {
    async fn produce(&self) -> Result<()>;
}

/// Adapter turning an async closure into a [`ProductionRoutine`]
pub struct FnRoutine<F>(F);

pub fn routine_fn<F, Fut>(f: F) -> FnRoutine<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnRoutine(f)
}

#[async_trait]
impl<F, Fut> ProductionRoutine for FnRoutine<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn produce(&self) -> Result<()> {
        (self.0)().await
    }
}
