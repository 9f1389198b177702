//! Logging setup: console output plus a rotating log file next to the
//! downloads, so unattended runs leave an audit trail.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "dashboard-digest";
pub const LOG_FILE_SUFFIX: &str = "log";
/// Rotated files kept on disk, the active one included.
pub const LOG_FILES_KEPT: usize = 3;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("cannot open log file in {}: {source}", .dir.display())]
    LogFile { dir: PathBuf, source: InitError },

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Daily-rotated `dashboard-digest.<date>.log` files in `dir`, oldest pruned
/// past [`LOG_FILES_KEPT`].
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender, TelemetryError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(LOG_FILES_KEPT)
        .build(dir)
        .map_err(|source| TelemetryError::LogFile {
            dir: dir.to_path_buf(),
            source,
        })
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process; dropping it flushes and stops the file writer.
pub fn init(log_dir: &Path) -> Result<WorkerGuard, TelemetryError> {
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender(log_dir)?);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))?;

    Ok(guard)
}
