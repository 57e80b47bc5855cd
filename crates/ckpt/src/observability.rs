use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use libcheckpoint_cli::{GlobalOpts, LogFormat};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Overrides the level picked from the command line.
const LOG_LEVEL_ENV_NAME: &str = "CKPT_LOG";
const DEFAULT_LOG_LEVEL: &str = "warn";

fn detect_log_level(is_debug: bool) -> Result<Level> {
    let filter = match std::env::var(LOG_LEVEL_ENV_NAME) {
        Ok(level) => level,
        Err(_) if is_debug => "debug".to_string(),
        Err(_) => DEFAULT_LOG_LEVEL.to_string(),
    };
    filter
        .parse()
        .with_context(|| format!("invalid log level {filter:?}"))
}

fn filter(level: Level) -> EnvFilter {
    // only our own crates log at the chosen level
    EnvFilter::new(format!("warn,libcheckpoint={level},ckpt={level}"))
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {path:?}"))
}

pub fn init(opts: &GlobalOpts) -> Result<()> {
    let level = detect_log_level(opts.debug)?;
    let registry = tracing_subscriber::registry();

    match (&opts.log, opts.log_format) {
        (None, LogFormat::Text) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(filter(level)),
            )
            .try_init()?,
        (None, LogFormat::Json) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter(level)),
            )
            .try_init()?,
        (Some(path), LogFormat::Text) => {
            let file = Arc::new(open_log_file(path)?);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(file)
                        .with_filter(filter(level)),
                )
                .try_init()?
        }
        (Some(path), LogFormat::Json) => {
            let file = Arc::new(open_log_file(path)?);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_writer(file)
                        .with_filter(filter(level)),
                )
                .try_init()?
        }
    }
    Ok(())
}
