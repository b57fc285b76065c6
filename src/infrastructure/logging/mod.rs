//! Tracing bootstrap.
//!
//! Initializes the global subscriber from the logging config section:
//! env-filtered level, json or pretty output, optionally appended to a
//! rolling daily file.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::infrastructure::config::LoggingSection;

/// Initialize the global tracing subscriber. Returns the appender guard
/// when file logging is enabled; hold it for the process lifetime.
pub fn init(config: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to build log filter")?;

    match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "aios.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if config.format == "json" {
                builder.json().try_init().ok();
            } else {
                builder.try_init().ok();
            }
            Ok(Some(guard))
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            if config.format == "json" {
                builder.json().try_init().ok();
            } else {
                builder.try_init().ok();
            }
            Ok(None)
        }
    }
}
