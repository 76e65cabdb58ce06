//! Cadence - Main Entry Point
//! Composition root: config, logging, store, workers, scheduler, shutdown

mod jobs;
mod logging;
mod settings;

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

use cadence_core::application::{
    LeaseReaper, QueueHandle, RetentionSweeper, SchedulerLoop, ShutdownCoordinator, WorkerEngine,
};
use cadence_core::port::id_provider::UuidProvider;
use cadence_core::port::time_provider::SystemTimeProvider;
use cadence_core::port::{JobHandler, JobStore};
use cadence_infra_sqlite::{create_pool, run_migrations, SqliteJobStore};

use crate::jobs::{spawn_event_logger, CheckSourceHandler, NotificationHandler, SourceCheckRoutine};
use crate::settings::{EngineConfig, CHECK_SOURCES_QUEUE, NOTIFICATIONS_QUEUE};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const CONFIG_PATH_ENV: &str = "CADENCE_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration and logging
    let config_path = std::env::var(CONFIG_PATH_ENV).ok();
    let config = EngineConfig::load(config_path.as_deref())?;
    let _log_guard = logging::init(&config.log)?;
    config.validate()?;

    info!("Cadence v{} starting...", VERSION);

    // 2. Store. An unreachable database aborts startup.
    if let Some(parent) = config.database.file_path().as_ref().and_then(|p| p.parent()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    info!(url = %config.database.url(), "Connecting to job store...");
    let pool = create_pool(
        &config.database.url(),
        config.database.max_connections,
        &config.database.connect_retry(),
    )
    .await
    .context("job store unreachable")?;
    run_migrations(&pool).await.context("migration failed")?;

    // 3. Dependency wiring
    let time_provider = Arc::new(SystemTimeProvider);
    let id_provider = Arc::new(UuidProvider);
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(pool, time_provider.clone()));

    // 4. Leases left behind by a previous process
    let reaper = LeaseReaper::new(store.clone(), config.maintenance.reaper_interval());
    match reaper.reap_once().await {
        Ok(count) => info!(recovered_jobs = count, "Lease recovery completed"),
        Err(e) => error!(error = %e, "Lease recovery failed"),
    }

    let mut coordinator = ShutdownCoordinator::new(store.clone());
    if let Some(timeout) = config.drain_timeout() {
        coordinator = coordinator.with_drain_timeout(timeout);
    }
    let coordinator = Arc::new(coordinator);

    // 5. Queues and their handlers
    let mut queues = HashMap::new();
    for (name, queue) in &config.queues {
        let handle = QueueHandle::new(
            name.clone(),
            queue.queue_options(),
            store.clone(),
            id_provider.clone(),
            time_provider.clone(),
        )
        .with_context(|| format!("queue {}", name))?;
        queues.insert(name.clone(), handle);
    }

    for (name, queue) in &config.queues {
        let handler: Arc<dyn JobHandler> = match name.as_str() {
            CHECK_SOURCES_QUEUE => {
                let notifications = queues
                    .get(NOTIFICATIONS_QUEUE)
                    .cloned()
                    .context("check-sources needs the notifications queue")?;
                Arc::new(CheckSourceHandler::new(notifications))
            }
            NOTIFICATIONS_QUEUE => Arc::new(NotificationHandler),
            other => bail!("no handler registered for queue {}", other),
        };

        let engine = Arc::new(WorkerEngine::new(
            queue.worker_config(name),
            store.clone(),
            handler,
        )?);
        coordinator.track(
            format!("{}-events", name),
            spawn_event_logger(name.clone(), engine.subscribe()),
        );
        coordinator.track(
            format!("{}-worker", name),
            tokio::spawn(engine.run(coordinator.token())),
        );
        info!(queue = %name, concurrency = queue.concurrency, "Worker started");
    }

    // 6. Background maintenance
    coordinator.track("lease-reaper", tokio::spawn(reaper.run(coordinator.token())));
    let sweeper = RetentionSweeper::new(
        store.clone(),
        config.retention_policies(),
        config.maintenance.retention_interval(),
    );
    coordinator.track("retention", tokio::spawn(sweeper.run(coordinator.token())));

    // 7. Scheduler
    if config.scheduler.enabled {
        let queue = queues
            .get(CHECK_SOURCES_QUEUE)
            .cloned()
            .context("scheduler needs the check-sources queue")?;
        let routine = Arc::new(SourceCheckRoutine::new(queue, config.sources.clone()));
        let mut scheduler = SchedulerLoop::new(routine, config.scheduler.interval());
        scheduler.start().await?;
        coordinator.set_scheduler(scheduler).await;
        info!(
            interval_secs = config.scheduler.interval_secs,
            sources = config.sources.len(),
            "Scheduler started"
        );
    }

    info!("System ready. Waiting for jobs...");

    // 8. Block until SIGTERM/SIGINT, then drain
    coordinator.run_until_signal().await?;

    info!("Shutdown complete.");
    Ok(())
}
