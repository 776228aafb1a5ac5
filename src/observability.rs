//! Logging setup.
//!
//! `RUST_LOG` controls levels (default `info`). Output goes to stdout in the
//! configured format and, when a directory is configured, to a daily-rolling
//! file as well.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::Span;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingSection};

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init_logging(section: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let (file_layer, guard) = match &section.directory {
        Some(dir) => {
            let (writer, guard) = rolling_writer(dir)?;
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    match section.format {
        LogFormat::Json => registry
            .with(fmt::layer().json())
            .try_init()
            .context("Failed to install tracing subscriber")?,
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false))
            .try_init()
            .context("Failed to install tracing subscriber")?,
    }

    Ok(guard)
}

fn rolling_writer(
    dir: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, "shipyard.log");
    Ok(tracing_appender::non_blocking(appender))
}

/// Span wrapping everything that happens on one WebSocket connection.
#[must_use]
pub fn session_span(session_id: &str) -> Span {
    tracing::info_span!("session", session = session_id)
}

/// Span wrapping one namespace, test or deploy operation.
#[must_use]
pub fn operation_span(kind: &str, project_id: &str) -> Span {
    tracing::info_span!("operation", kind = kind, project = project_id)
}
