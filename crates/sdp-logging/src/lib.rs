use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log file appender: {0}")]
    Appender(#[from] rolling::InitError),

    #[error("global subscriber already installed")]
    AlreadyInitialized,
}

/// Log file rotation period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(r: Rotation) -> Self {
        match r {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive (e.g. `info`, `sdp_core=debug`). `RUST_LOG`
    /// overrides it when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files. If None, no file logging.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub rotation: Rotation,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,

    /// Whether to also output to console (stderr).
    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "sdp".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: Rotation::default(),
            json_format: false,
            console_output: true,
        }
    }
}

/// Install the global subscriber. Call once at program startup.
///
/// Returns a guard that must be held alive for the duration of the program
/// when file logging is enabled (it flushes the non-blocking writer on drop).
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer: Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>> =
        if config.console_output {
            if config.json_format {
                Some(Box::new(fmt::layer().json().with_writer(std::io::stderr)))
            } else {
                Some(Box::new(fmt::layer().with_writer(std::io::stderr)))
            }
        } else {
            None
        };

    let (file_layer, guard): (
        Option<Box<dyn tracing_subscriber::Layer<_> + Send + Sync>>,
        Option<tracing_appender::non_blocking::WorkerGuard>,
    ) = if let Some(ref log_dir) = config.log_dir {
        let file_appender = rolling::RollingFileAppender::builder()
            .rotation(config.rotation.into())
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .build(log_dir)?;

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json_format {
            Box::new(fmt::layer().json().with_writer(non_blocking))
        } else {
            Box::new(fmt::layer().with_ansi(false).with_writer(non_blocking))
        };

        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    registry
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;

    Ok(guard)
}
