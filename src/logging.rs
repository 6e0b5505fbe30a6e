use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding a tracing filter directive set.
pub const LOG_FILTER_ENV: &str = "PROCTMUX_LOG";

/// An enum representing possible errors during the logging initialization.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInit(String),

    #[error("could not open log file `{path}`: {source}")]
    OpenLogFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Logging section of the configuration file.
///
/// The server and unified modes write to a file because the viewer owns the
/// terminal; one-shot commands and the client log to stderr instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log file path. Defaults to `proctmux-<hash>.log` next to the socket.
    pub file: Option<PathBuf>,

    /// Default level when [LOG_FILTER_ENV] is unset. One of the usual
    /// `error|warn|info|debug|trace`.
    pub level: Option<String>,
}

impl LoggingConfig {
    /// Initializes the global subscriber with a non-blocking file writer.
    ///
    /// The returned guard must be kept alive by the caller for buffered lines
    /// to be flushed on shutdown.
    pub fn try_init_file(&self, default_file: &Path) -> Result<WorkerGuard, LoggingError> {
        let path = self.file.clone().unwrap_or_else(|| default_file.to_path_buf());
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LoggingError::OpenLogFile {
                path: path.clone(),
                source,
            })?;
        let (writer, guard) = tracing_appender::non_blocking(file);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(self.filter("info"));

        tracing_subscriber::registry()
            .with(file_layer)
            .try_init()
            .map_err(|err| LoggingError::TryInit(err.to_string()))?;
        Ok(guard)
    }

    /// Initializes the global subscriber on stderr, for one-shot commands and
    /// the line client.
    pub fn try_init_stderr(&self) -> Result<(), LoggingError> {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(self.filter("warn"));

        tracing_subscriber::registry()
            .with(stderr_layer)
            .try_init()
            .map_err(|err| LoggingError::TryInit(err.to_string()))
    }

    fn filter(&self, fallback: &str) -> EnvFilter {
        let default_directives = self.level.clone().unwrap_or_else(|| fallback.to_string());
        EnvFilter::try_from_env(LOG_FILTER_ENV)
            .unwrap_or_else(|_| EnvFilter::new(default_directives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logging_creates_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proctmux-test.log");
        let config = LoggingConfig {
            file: Some(path.clone()),
            level: Some("debug".to_string()),
        };
        // The global subscriber may already be claimed by another test; file
        // creation must happen regardless.
        let _ = config.try_init_file(dir.path().join("unused-default.log").as_path());
        assert!(path.exists());
    }
}
