//! Shared logging utilities for Onlyboxes binaries.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "onlyboxes=info,onlyboxes_console=info,onlyboxes_db=info";

/// Logging configuration shared by Onlyboxes binaries.
pub struct LogConfig {
    /// Raise stderr verbosity to the full filter.
    pub verbose: bool,
    /// Optional append-mode log file alongside stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_file: None,
        }
    }
}

/// Initialize tracing with a stderr layer and an optional file layer.
///
/// `RUST_LOG` overrides the default filter when set.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let stderr_filter = if config.verbose {
        env_filter("debug")
    } else {
        env_filter(DEFAULT_LOG_FILTER)
    };

    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(stderr_filter),
    );

    match config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_filter(env_filter(DEFAULT_LOG_FILTER)),
                )
                .init();
        }
        None => registry.init(),
    }

    Ok(())
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}
