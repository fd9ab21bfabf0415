use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

pub const DEFAULT_FILTER: &str = "shim_core=info,shim_agent=info";
const LOG_FILE_NAME: &str = "shim-agent.log";

/// Logging configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: String,

    /// Whether to enable JSON formatted logs
    pub json_format: bool,

    /// Directory for daily rotated log files (stdout only if None)
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json_format: false,
            log_dir: None,
        }
    }
}

/// `RUST_LOG` wins over the configured filter.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .with_context(|| format!("Invalid log filter {:?}", config.filter)),
    }
}

fn create_file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    Ok(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME))
}

/// Initialize logging. Keep the returned guard alive so buffered file output
/// is flushed on exit.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stdout: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };
    layers.push(stdout);

    let guard = match &config.log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(create_file_appender(dir)?);
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
            Some(guard)
        }
        None => None,
    };

    // Try to initialize logging, ignore if already initialized
    match tracing_subscriber::registry().with(layers).with(filter).try_init() {
        Ok(()) => tracing::info!("Logging initialized"),
        Err(_) => tracing::debug!("Logging already initialized, skipping"),
    }

    Ok(guard)
}
