//! Scheduler Loop - periodic producer of work
//!
//! Runs the production routine once on `start()` (awaited), then on a fixed
//! interval. Cycles never overlap: a tick that arrives while a cycle is still
//! running is skipped. Errors and panics inside a cycle are logged and never
//! reach the timer.
//!
//! One instance per process, owned by the composition root and handed to the
//! shutdown coordinator, which calls [`SchedulerLoop::stop`] before the store
//! connection is closed.

use crate::application::worker::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::error::{AppError, Result};
use crate::port::ProductionRoutine;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

pub struct SchedulerLoop {
    routine: Arc<dyn ProductionRoutine>,
    interval: Duration,
    cancel: Option<ShutdownSender>,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

impl SchedulerLoop {
    pub fn new(routine: Arc<dyn ProductionRoutine>, interval: Duration) -> Self {
        Self {
            routine,
            interval,
            cancel: None,
            task: None,
            stopped: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Run the first cycle, then arm the timer
    pub async fn start(&mut self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AppError::Validation(
                "scheduler interval must be non-zero".to_string(),
            ));
        }
        if self.stopped || self.task.is_some() {
            return Err(AppError::InvalidState(
                "scheduler can only be started once".to_string(),
            ));
        }

        info!(interval = ?self.interval, "Scheduler starting");
        run_cycle(&self.routine, 1).await;

        let (cancel, token) = shutdown_channel();
        let routine = Arc::clone(&self.routine);
        let interval = self.interval;
        self.task = Some(tokio::spawn(tick_loop(routine, interval, token)));
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Cancel the timer and wait for an in-flight cycle. Idempotent.
    pub async fn stop(&mut self) {
        self.stopped = true;
        let (Some(cancel), Some(task)) = (self.cancel.take(), self.task.take()) else {
            debug!("Scheduler already stopped");
            return;
        };

        cancel.shutdown();
        if let Err(e) = task.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
        info!("Scheduler stopped");
    }
}

async fn tick_loop(
    routine: Arc<dyn ProductionRoutine>,
    interval: Duration,
    mut cancel: ShutdownToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycle: u64 = 1;

    loop {
        tokio::select! {
            biased;
            _ = cancel.wait() => break,
            _ = ticker.tick() => {
                cycle += 1;
                run_cycle(&routine, cycle).await;
            }
        }
    }
}

/// One production cycle, isolated in its own task so a panic stays contained
async fn run_cycle(routine: &Arc<dyn ProductionRoutine>, cycle: u64) {
    let routine = Arc::clone(routine);
    let started = Instant::now();

    match tokio::spawn(async move { routine.produce().await }).await {
        Ok(Ok(())) => debug!(cycle, elapsed = ?started.elapsed(), "Scheduler cycle finished"),
        Ok(Err(e)) => error!(cycle, error = %e, "Scheduler cycle failed"),
        Err(e) if e.is_panic() => error!(cycle, error = %e, "Scheduler cycle panicked"),
        Err(e) => error!(cycle, error = %e, "Scheduler cycle cancelled"),
    }
}
