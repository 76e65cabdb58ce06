// Shutdown Coordinator
//
// running -> draining -> disconnected -> exited
//
// Only the first request performs the sequence; later ones (repeated
// signals) observe the phase and return.

use crate::application::scheduler::SchedulerLoop;
use crate::application::worker::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::error::Result;
use crate::port::JobStore;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Disconnected,
    Exited,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::Draining => write!(f, "draining"),
            ShutdownPhase::Disconnected => write!(f, "disconnected"),
            ShutdownPhase::Exited => write!(f, "exited"),
        }
    }
}

type TrackedTask = (String, JoinHandle<Result<()>>);

pub struct ShutdownCoordinator {
    phase: watch::Sender<ShutdownPhase>,
    scheduler: tokio::sync::Mutex<Option<SchedulerLoop>>,
    stop_claiming: ShutdownSender,
    tasks: Mutex<Vec<TrackedTask>>,
    store: Arc<dyn JobStore>,
    drain_timeout: Option<Duration>,
}

impl ShutdownCoordinator {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let (stop_claiming, _) = shutdown_channel();
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            phase,
            scheduler: tokio::sync::Mutex::new(None),
            stop_claiming,
            tasks: Mutex::new(Vec::new()),
            store,
            drain_timeout: None,
        }
    }

    /// Abort handlers still running after `timeout` instead of waiting forever
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Hand over the process's scheduler; it is stopped first on shutdown
    pub async fn set_scheduler(&self, scheduler: SchedulerLoop) {
        *self.scheduler.lock().await = Some(scheduler);
    }

    /// Token for a worker or background loop; fires when draining begins
    pub fn token(&self) -> ShutdownToken {
        self.stop_claiming.token()
    }

    /// Track a spawned worker/background task so draining waits for it
    pub fn track(&self, name: impl Into<String>, handle: JoinHandle<Result<()>>) {
        self.lock_tasks().push((name.into(), handle));
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Run the shutdown sequence. Returns false if another call already started it.
    pub async fn shutdown(&self) -> bool {
        let started = self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });
        if !started {
            info!(phase = %self.phase(), "Shutdown already in progress");
            return false;
        }

        info!("Shutdown: draining");

        // Scheduler first, so no new work is produced while draining
        if let Some(mut scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop().await;
        }

        self.stop_claiming.shutdown();
        self.drain().await;

        match self.store.close().await {
            Ok(()) => info!("Store connection closed"),
            Err(e) => {
                error!(error = %e, "Store close failed, forcing disconnect");
                self.store.force_close().await;
            }
        }
        self.phase.send_replace(ShutdownPhase::Disconnected);
        info!("Shutdown: disconnected");

        self.phase.send_replace(ShutdownPhase::Exited);
        info!("Shutdown complete");
        true
    }

    /// Wait for SIGTERM/SIGINT, run the sequence, ignore repeated signals
    pub async fn run_until_signal(self: Arc<Self>) -> Result<()> {
        let signal = termination_signal().await?;
        info!(signal, "Termination signal received");

        let coordinator = Arc::clone(&self);
        let mut sequence = tokio::spawn(async move { coordinator.shutdown().await });

        loop {
            tokio::select! {
                joined = &mut sequence => {
                    if let Err(e) = joined {
                        error!(error = %e, "Shutdown sequence aborted");
                    }
                    return Ok(());
                }
                signal = termination_signal() => {
                    let signal = signal?;
                    warn!(signal, phase = %self.phase(), "Signal ignored, shutdown already in progress");
                }
            }
        }
    }

    async fn drain(&self) {
        let tasks = std::mem::take(&mut *self.lock_tasks());
        let deadline = self.drain_timeout.map(|t| Instant::now() + t);
        info!(tasks = tasks.len(), drain_timeout = ?self.drain_timeout, "Waiting for workers to drain");

        for (name, mut handle) in tasks {
            let joined = match deadline {
                Some(deadline) => match timeout_at(deadline, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(task = %name, "Drain timeout reached, aborting task");
                        handle.abort();
                        continue;
                    }
                },
                None => handle.await,
            };

            match joined {
                Ok(Ok(())) => info!(task = %name, "Drained"),
                Ok(Err(e)) => error!(task = %name, error = %e, "Task finished with error"),
                Err(e) => error!(task = %name, error = %e, "Task panicked or was cancelled"),
            }
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<TrackedTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Resolves with the name of the first SIGTERM or SIGINT received
async fn termination_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => interrupted.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "SIGINT")
    }
}
