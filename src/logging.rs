//! Tracing setup for the maintenance CLI and embedding applications.
//!
//! Interactive runs can log to stderr. Otherwise logs go to the systemd
//! journal on Linux, or to a daily-rolling file when no journal is reachable.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `CLEPHO_LOG=clepho_index=debug`.
pub const LOG_ENV: &str = "CLEPHO_LOG";

const LOG_FILE_PREFIX: &str = "clepho-index.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where log records ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    Journald,
    File(PathBuf),
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clepho")
        .join("logs")
}

/// Install the global subscriber. Call once, at startup.
pub fn init(log_dir: Option<PathBuf>, stderr: bool) -> Result<LogTarget> {
    if stderr {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
            .context("Logging already initialized")?;
        return Ok(LogTarget::Stderr);
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter())
                .with(journald.with_syslog_identifier("clepho-index".to_string()))
                .try_init()
                .context("Logging already initialized")?;
            tracing::debug!("Logging to journald");
            return Ok(LogTarget::Journald);
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // The worker flushes until the guard drops, so it lives for the process.
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("Logging already initialized")?;

    tracing::debug!("Logging to {:?}", log_dir);
    Ok(LogTarget::File(log_dir))
}
