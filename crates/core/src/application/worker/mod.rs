// Worker - Job execution loop

pub mod constants;
mod events;
mod shutdown;
mod stats;

use constants::*;
pub use events::WorkerEvent;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
pub use stats::WorkerStats;

use crate::application::rate_limiter::RateLimiter;
use crate::domain::{Job, WorkerConfig};
use crate::error::Result;
use crate::port::{JobHandler, JobStore};
use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Consumes one queue under a concurrency ceiling and an optional rate limit
///
/// Claim order per iteration: free semaphore slot, then rate limiter, then
/// store claim. A claimed job runs in its own task holding the slot until the
/// outcome has been reported to the store.
pub struct WorkerEngine {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<RateLimiter>,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<WorkerEvent>,
    stats: WorkerStats,
}

enum Outcome {
    Succeeded,
    Failed(String),
    /// The lease was reclaimed and possibly re-claimed elsewhere; nothing to report
    LeaseLost,
}

/// Aborts the handler task when the execution that owns it goes away,
/// including when the worker task itself is aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl WorkerEngine {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = config
            .rate_limit
            .as_ref()
            .map(|limit| RateLimiter::new(limit.max, limit.window));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config,
            store,
            handler,
            limiter,
            events,
            stats: WorkerStats::new(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Subscribe to `completed` / `failed` events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    /// Run the claim loop until `shutdown` fires, then wait for in-flight handlers
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownToken) -> Result<()> {
        let lease_ms = self.config.lease_duration.as_millis() as i64;
        let mut in_flight = JoinSet::new();

        info!(
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            rate_limit = ?self.config.rate_limit,
            "Worker started"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(queue = %self.config.queue, error = %e, "Execution task aborted");
                }
            }

            if shutdown.is_shutdown() {
                break;
            }

            // Guard 1: concurrency
            let permit = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Guard 2: rate limit
            if let Some(limiter) = &self.limiter {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = limiter.ready() => {}
                }
            }

            match self.store.claim_next(&self.config.queue, lease_ms).await {
                Ok(Some(job)) => {
                    if let Some(limiter) = &self.limiter {
                        limiter.record_start();
                    }
                    self.stats.claimed.fetch_add(1, Ordering::Relaxed);

                    let engine = Arc::clone(&self);
                    in_flight.spawn(async move {
                        engine.execute(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = sleep(IDLE_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(queue = %self.config.queue, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }

        info!(
            queue = %self.config.queue,
            in_flight = in_flight.len(),
            "Worker draining"
        );
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue = %self.config.queue, error = %e, "Execution task aborted");
            }
        }
        info!(queue = %self.config.queue, "Worker stopped");
        Ok(())
    }

    async fn execute(&self, job: Job) {
        self.stats.handler_started();
        debug!(
            queue = %job.queue,
            job_id = %job.id,
            attempt = job.attempts_made + 1,
            max_attempts = job.max_attempts,
            "Executing job"
        );

        let outcome = self.run_handler(&job).await;
        self.stats.handler_finished();
        self.report(&job, outcome).await;
    }

    /// Run the handler in its own task (panic isolation), renewing the lease
    /// every half lease and enforcing the optional timeout.
    async fn run_handler(&self, job: &Job) -> Outcome {
        let handler = Arc::clone(&self.handler);
        let task_job = job.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move {
            handler.handle(&task_job).await
        }));
        let lease_token = job.lease_token.as_deref().unwrap_or_default();

        let lease = self.config.lease_duration;
        let lease_ms = lease.as_millis() as i64;
        let half_lease = (lease / 2).max(Duration::from_millis(1));
        let mut heartbeat = interval_at(Instant::now() + half_lease, half_lease);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let deadline = self
            .config
            .handler_timeout
            .map(|timeout| (Instant::now() + timeout, timeout));

        loop {
            let expired = async {
                match deadline {
                    Some((at, _)) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                joined = &mut task.0 => {
                    return match joined {
                        Ok(Ok(())) => Outcome::Succeeded,
                        Ok(Err(e)) => Outcome::Failed(e.to_string()),
                        Err(e) if e.is_panic() => {
                            let message = panic_message(e.into_panic());
                            error!(job_id = %job.id, panic_msg = %message, "Handler panicked");
                            Outcome::Failed(format!("handler panicked: {}", message))
                        }
                        Err(e) => Outcome::Failed(format!("handler cancelled: {}", e)),
                    };
                }
                _ = expired => {
                    task.0.abort();
                    let timeout = deadline.map(|(_, t)| t).unwrap_or_default();
                    warn!(job_id = %job.id, timeout = ?timeout, "Handler timed out");
                    return Outcome::Failed(format!("handler timed out after {:?}", timeout));
                }
                _ = heartbeat.tick() => {
                    match self.store.extend_lease(&job.id, lease_token, lease_ms).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id = %job.id, "Lease lost, abandoning job");
                            return Outcome::LeaseLost;
                        }
                        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to renew lease"),
                    }
                }
            }
        }
    }

    async fn report(&self, job: &Job, outcome: Outcome) {
        let lease_token = job.lease_token.as_deref().unwrap_or_default();
        match outcome {
            Outcome::Succeeded => match self.store.complete(&job.id, lease_token).await {
                Ok(()) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    info!(queue = %job.queue, job_id = %job.id, "Job completed");
                    let _ = self.events.send(WorkerEvent::Completed {
                        queue: job.queue.clone(),
                        job_id: job.id.clone(),
                    });
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to record completion"),
            },
            Outcome::Failed(message) => match self
                .store
                .fail(&job.id, lease_token, &message)
                .await
            {
                Ok(result) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    if result.will_retry() {
                        warn!(
                            queue = %job.queue,
                            job_id = %job.id,
                            attempts_made = result.attempts_made(),
                            error = %message,
                            "Job failed, will retry"
                        );
                    } else {
                        error!(
                            queue = %job.queue,
                            job_id = %job.id,
                            attempts_made = result.attempts_made(),
                            error = %message,
                            "Job failed permanently"
                        );
                    }
                    let _ = self.events.send(WorkerEvent::Failed {
                        queue: job.queue.clone(),
                        job_id: job.id.clone(),
                        error: message,
                        attempts_made: result.attempts_made(),
                        will_retry: result.will_retry(),
                    });
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to record failure"),
            },
            Outcome::LeaseLost => {
                self.stats.lease_lost.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
