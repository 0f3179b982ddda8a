//! Tracing setup for the mogile tools
//!
//! Console output goes to stderr so that object bytes written to stdout
//! stay clean. An optional file layer records everything at TRACE.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the full-trace log written inside the logs directory.
pub const LOG_FILE_NAME: &str = "mogile-last-run.log";

/// Installs the global subscriber.
///
/// `RUST_LOG` overrides `console_level` for the console. With `logs_dir`
/// set, a TRACE level copy of every event is written to
/// `<logs_dir>/mogile-last-run.log`, replacing the previous run's file.
///
/// # Errors
///
/// - `std::io::Error` - If the logs directory or file cannot be created
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<Option<PathBuf>, std::io::Error> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let Some(logs_dir) = logs_dir else {
        tracing_subscriber::registry().with(console_layer).init();
        return Ok(None);
    };

    create_dir_all(logs_dir)?;
    let log_file_path = logs_dir.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let file_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::debug!("Full trace written to {}", log_file_path.display());
    Ok(Some(log_file_path))
}

/// Console verbosity selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl CliLogLevel {
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(CliLogLevel::default().as_tracing_level(), Level::WARN);
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
    }
}
