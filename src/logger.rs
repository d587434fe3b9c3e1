//! Structured logging setup.
//!
//! stdout belongs to the host protocol, so logs go to stderr and to daily
//! rolling files under `voice-speak/logs/` in the platform config directory.

use std::fs;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::get_log_dir;

/// Default filter when `RUST_LOG` is unset. HTTP client internals are noisy.
const DEFAULT_FILTER: &str = "info,reqwest=warn,hyper=warn,hyper_util=warn";

/// Initialize the global subscriber.
///
/// If the log directory is not writable, logging continues on stderr only.
pub fn init() -> anyhow::Result<()> {
    let log_dir = get_log_dir();
    let _ = fs::create_dir_all(&log_dir);

    let (file_layer, file_error) = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("speak")
        .filename_suffix("log")
        .max_log_files(5)
        .build(&log_dir)
    {
        Ok(appender) => (
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .compact();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    match file_error {
        None => tracing::info!(log_dir = %log_dir.display(), "Logger initialized"),
        Some(e) => tracing::warn!(
            log_dir = %log_dir.display(),
            error = %e,
            "Log directory unavailable, logging to stderr only"
        ),
    }
    Ok(())
}
