//! File logging. The terminal belongs to the TUI, so nothing is written to
//! stdout or stderr; everything goes to `{log_dir}/calnotes.log`.
//!
//! The filter defaults to `info` and can be overridden with `CALNOTES_LOG`
//! or `RUST_LOG`.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE: &str = "calnotes.log";

/// Flushes buffered log lines when dropped; keep it alive for the whole run.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

pub fn init(log_dir: &Path) -> Result<LoggingGuard> {
    fs::create_dir_all(log_dir).with_context(|| format!("creating {:?}", log_dir))?;
    let appender = tracing_appender::rolling::never(log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env("CALNOTES_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .context("installing log subscriber")?;

    tracing::info!(
        event = "app_start",
        version = env!("CARGO_PKG_VERSION"),
        log_path = %log_dir.join(LOG_FILE).display()
    );
    Ok(LoggingGuard { _file_guard: guard })
}
