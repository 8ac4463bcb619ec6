//! Log output for Tribe binaries.
//!
//! Console output goes to stderr so a stream written to stdout stays clean.
//! Only the tribe crates log at the chosen level; HTTP client internals stay
//! at `warn` unless `RUST_LOG` says otherwise. Every run also leaves a full
//! trace in `<logs dir>/tribe-last-run.log`.

use std::fs::File;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

pub const LOG_FILE_NAME: &str = "tribe-last-run.log";

const TRIBE_TARGETS: &[&str] = &["tribe_core", "tribe_sim", "tribe"];

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Tracing already initialised: {reason}")]
    AlreadyInitialised { reason: String },
}

/// Console verbosity picked on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

/// Filter directives for the console: dependencies at `warn`, tribe crates
/// at `level`.
pub fn console_directives(level: Level) -> String {
    let level = level.to_string().to_lowercase();
    let mut directives = String::from("warn");
    for target in TRIBE_TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

/// Installs the console and file layers as the global subscriber.
///
/// `RUST_LOG` replaces the console filter when set. The file layer always
/// records at `trace`. `logs_dir` defaults to `./logs` and is created if
/// missing.
///
/// # Errors
/// - `TracingError::LogFile` - Logs directory or log file could not be created
/// - `TracingError::AlreadyInitialised` - A global subscriber is already set
pub fn init_tracing(
    console_level: impl Into<Level>,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, TracingError> {
    let console_level = console_level.into();
    let logs_dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    let log_path = logs_dir.join(LOG_FILE_NAME);

    let log_file = std::fs::create_dir_all(logs_dir)
        .and_then(|()| File::create(&log_path))
        .map_err(|source| TracingError::LogFile {
            path: log_path.clone(),
            source,
        })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_writer(log_file)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| TracingError::AlreadyInitialised {
            reason: e.to_string(),
        })?;

    tracing::debug!(
        "Logging at {} to console, full trace in {}",
        console_level,
        log_path.display()
    );

    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_directives_quiet_dependencies() {
        assert_eq!(
            console_directives(Level::DEBUG),
            "warn,tribe_core=debug,tribe_sim=debug,tribe=debug"
        );
        assert!(EnvFilter::try_new(console_directives(Level::TRACE)).is_ok());
    }

    #[test]
    fn test_cli_level_parses_case_insensitively() {
        let level = CliLogLevel::from_str("WARN", true).unwrap();
        assert_eq!(level, CliLogLevel::Warn);
        assert_eq!(Level::from(level), Level::WARN);
        assert!(CliLogLevel::from_str("verbose", true).is_err());
    }

    #[test]
    fn test_unwritable_logs_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let result = init_tracing(CliLogLevel::Info, Some(&blocker));
        assert!(matches!(result, Err(TracingError::LogFile { .. })));
    }
}
