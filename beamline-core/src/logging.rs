//! Logging infrastructure for beamline
//!
//! Logs are written to `~/.local/state/beamline/beamline.log` following XDG
//! standards. The active level can be changed at runtime through
//! [`set_level`], which backs `Tracker::set_log_level`.

use std::sync::OnceLock;

use crate::config::{LoggingConfig, TrackerConfig};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    reload,
    util::SubscriberInitExt,
    EnvFilter,
};

static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Initialize the logging system
///
/// Sets up tracing with:
/// - File output to the XDG state directory, rotated daily
/// - Configurable log level via config or the RUST_LOG env var
/// - A reload handle so the level can be changed after startup
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = TrackerConfig::state_dir();

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "beamline.log");

    // Non-blocking writer so logging never stalls the pipeline
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(file_layer)
        .init();

    let _ = RELOAD_HANDLE.set(handle);

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Change the active log level.
///
/// Returns an error if logging was never initialized or the reload fails.
pub fn set_level(level: tracing::Level) -> crate::error::Result<()> {
    let handle = RELOAD_HANDLE
        .get()
        .ok_or_else(|| crate::error::Error::Config("logging is not initialized".to_string()))?;
    handle
        .reload(EnvFilter::new(level.to_string()))
        .map_err(|e| crate::error::Error::Config(format!("failed to update log level: {}", e)))
}

/// Initialize logging for tests (logs to the test writer)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any pending log writes.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}
