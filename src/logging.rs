//! Logging Module
//!
//! Installs the global `tracing` subscriber: a compact console layer and,
//! when a log directory is configured, a daily rolling file layer.

use crate::config::LoggingConfig;
use crate::{CacheError, Result};
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize application logging.
///
/// `RUST_LOG` overrides the configured level. Calling this again after a
/// subscriber is installed is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let file_layer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                CacheError::IoError(format!("Failed to create log directory {:?}: {}", log_dir, e))
            })?;

            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, log_dir, &config.log_file_prefix);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        }
        None => None,
    };

    // stdout carries command output, so console logs go to stderr
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(false)
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
        .compact();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    match result {
        Ok(_) => {
            info!("Logging initialized at level '{}'", config.log_level);
            if let Some(log_dir) = &config.log_dir {
                info!("Application logs will be written to: {:?}", log_dir);
            }
        }
        Err(_) => {
            // Already initialized, likely in tests
            debug!("Tracing subscriber already initialized, skipping");
        }
    }

    Ok(())
}
