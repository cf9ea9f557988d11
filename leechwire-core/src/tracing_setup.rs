//! Tracing setup for Leechwire
//!
//! Console logs follow the level the user picked; a second layer writes the
//! full trace of the run to disk so a stalled swarm can be diagnosed afterwards.

use std::fs::{File, create_dir_all};
use std::path::Path;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the trace log written inside the logs directory.
pub const TRACE_LOG_FILE: &str = "leechwire-last-run.log";

/// Installs the global subscriber: console output at `console_level` and a
/// full trace of the run in `logs_dir` (default `./logs`).
///
/// The trace file is truncated on every run. `RUST_LOG`, when set, replaces
/// the console filter.
///
/// # Errors
///
/// - `Box<dyn std::error::Error>` - If the trace file cannot be created or a
///   global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let logs_dir = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_dir)?;
    let trace_path = logs_dir.join(TRACE_LOG_FILE);
    let trace_file = File::create(&trace_path)?;

    let console = fmt::layer()
        .with_target(console_level >= Level::DEBUG)
        .with_file(false)
        .with_line_number(false)
        .with_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level))),
        );

    let trace = fmt::layer()
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(trace_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console)
        .with(trace)
        .try_init()?;

    tracing::debug!("Writing full trace to {}", trace_path.display());
    Ok(())
}

/// Console filter for `level`. The HTTP client stack stays at `warn` unless
/// every wire message was asked for.
fn console_directives(level: Level) -> String {
    if level == Level::TRACE {
        return level.to_string();
    }
    format!("{level},hyper=warn,hyper_util=warn,reqwest=warn")
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Informational, warning, and error messages
    Info,
    /// Per-peer lifecycle and scheduling decisions
    Debug,
    /// Every wire message
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use leechwire_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
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
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_level_mapping() {
        assert_eq!(CliLogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
    }

    #[test]
    fn test_init_tracing_creates_log_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        // A global subscriber may already be installed by another test; the
        // log file is created before installation either way.
        let _ = init_tracing(Level::WARN, Some(temp_dir.path()));
        assert!(temp_dir.path().join(TRACE_LOG_FILE).exists());
    }

    #[test]
    fn test_console_directives_quiet_http_stack() {
        assert_eq!(
            console_directives(Level::INFO),
            "INFO,hyper=warn,hyper_util=warn,reqwest=warn"
        );
        assert_eq!(console_directives(Level::TRACE), "TRACE");
    }
}
