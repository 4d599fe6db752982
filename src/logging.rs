//! Tracing subscriber setup shared by every subcommand

use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "simulator.log";

/// Filter used when `RUST_LOG` is not set
pub fn default_filter(level: &str) -> String {
    if level.eq_ignore_ascii_case("info") {
        "info,simulator=debug".to_string()
    } else {
        level.to_lowercase()
    }
}

/// Console logging plus an optional daily-rolling file under `config.directory`
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level)));

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .boxed()
    };

    let file_layer = config.directory.as_deref().and_then(|dir| {
        if let Err(e) = ensure_writable(dir) {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            return None;
        }
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        // Must outlive every log call
        Box::leak(Box::new(guard));
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let file_logging = file_layer.is_some();
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("Warning: logging already initialised: {}", e);
        return;
    }

    if let Some(dir) = config.directory.as_deref().filter(|_| file_logging) {
        eprintln!("Logging to: {}/{}", dir.display(), LOG_FILE_PREFIX);
    }
}

/// The rolling appender aborts if it cannot create its first file
fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".simulator_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    std::fs::remove_file(&probe)
}
