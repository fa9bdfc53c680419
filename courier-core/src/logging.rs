//! Logging for courier
//!
//! The library only emits `tracing` events. The CLI calls [`init`] to write
//! them to daily files under `$XDG_STATE_HOME/courier/`; applications that
//! embed the client install their own subscriber instead.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name prefix of the daily log files.
pub const LOG_FILE_PREFIX: &str = "courier.log";

/// Used when neither `RUST_LOG` nor the configured level parses.
const FALLBACK_DIRECTIVE: &str = "info";

/// Keeps the background writer alive. Pending lines are flushed on drop.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Install the file subscriber. `RUST_LOG` wins over the configured level.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(retained_files(config))
        .build(&log_dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {e}")))?;
    let (writer, worker) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(filter(config))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install subscriber: {e}")))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        version = crate::LIBRARY_VERSION,
        "Logging initialized"
    );

    Ok(LoggingGuard { _worker: worker })
}

/// Subscriber for tests, writing through the test harness. Safe to call
/// from every test.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_DIRECTIVE))
}

fn retained_files(config: &LoggingConfig) -> usize {
    config.max_files.max(1)
}
