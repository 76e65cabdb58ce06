//! Tracing subscriber setup
//!
//! Stdout gets pretty output for development or JSON for production. When a
//! log directory is configured, a daily-rolling JSON file is written as well.

use crate::settings::{LogConfig, LogFormat};
use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const DEFAULT_FILTER: &str = "cadence=info";
const LOG_FILE_PREFIX: &str = "cadence.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop; keep it alive until exit.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER)))
        .context("invalid log filter")?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(match config.format {
        // Production: JSON structured logging
        LogFormat::Json => fmt::layer().json().boxed(),
        // Development: Pretty formatting with colors
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
    });

    let guard = match &config.directory {
        Some(directory) => {
            let directory = shellexpand::tilde(directory).into_owned();
            let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
