// Lease reaper: crash recovery for jobs left ACTIVE by a dead worker
use crate::application::worker::ShutdownToken;
use crate::error::Result;
use crate::port::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Returns active jobs whose lease ran out to WAITING
///
/// Runs once on startup (jobs orphaned by a previous process) and then on an
/// interval. A job reclaimed here runs again, so handlers must be idempotent.
pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Reclaim expired leases now
    pub async fn reap_once(&self) -> Result<u64> {
        let reclaimed = self.store.reclaim_expired().await?;
        if reclaimed > 0 {
            warn!(reclaimed, "Reclaimed jobs with expired leases");
        }
        Ok(reclaimed)
    }

    /// Reap on every tick until shutdown (first tick fires immediately)
    pub async fn run(self, mut shutdown: ShutdownToken) -> Result<()> {
        info!(interval = ?self.interval, "Lease reaper started");
        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tick.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Lease reaping failed");
                    }
                }
            }
        }
        info!("Lease reaper stopped");
        Ok(())
    }
}
