// Retention sweeper
// Evicts finished jobs beyond each queue's retention caps

use crate::application::worker::ShutdownToken;
use crate::domain::{QueueId, RetentionPolicy};
use crate::error::Result;
use crate::port::{EvictionStats, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

/// Periodic retention enforcement
///
/// Retention is eventual: a finished job can outlive its cap until the next
/// sweep.
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    queues: Vec<(QueueId, RetentionPolicy)>,
    interval: Duration,
}

impl RetentionSweeper {
    /// Create a new retention sweeper
    ///
    /// # Arguments
    /// * `store` - Job store
    /// * `queues` - Queue names with the retention policy of each
    /// * `interval` - Time between sweeps
    pub fn new(
        store: Arc<dyn JobStore>,
        queues: Vec<(QueueId, RetentionPolicy)>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            queues,
            interval,
        }
    }

    /// Run the sweep loop until shutdown
    ///
    /// First sweep happens one interval after start.
    pub async fn run(self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(
            interval = ?self.interval,
            queues = self.queues.len(),
            "Retention sweeper started"
        );

        let mut tick = interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.run_now().await {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }
        info!("Retention sweeper stopped");
        Ok(())
    }

    /// Sweep every queue immediately
    pub async fn run_now(&self) -> Result<EvictionStats> {
        let mut total = EvictionStats::default();

        for (queue, retention) in &self.queues {
            let stats = self.store.evict(queue, retention).await?;
            if stats.total() > 0 {
                info!(
                    queue = %queue,
                    completed_removed = stats.completed_removed,
                    failed_removed = stats.failed_removed,
                    "Evicted finished jobs"
                );
            }
            total.completed_removed += stats.completed_removed;
            total.failed_removed += stats.failed_removed;
        }

        Ok(total)
    }
}
