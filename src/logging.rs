//! Diagnostic logging.
//!
//! Diagnostics go to stderr, filtered by level. Optionally a copy is written
//! to a timestamped file under ~/.addman/logs/ (or a chosen directory), with
//! old files removed after a retention period. User-facing add-on output on
//! stdout never goes through here.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 72;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Environment variable holding the log level.
pub const LOG_LEVEL_ENV: &str = "ADDMAN_LOG";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level or filter directive (e.g. `debug`, `addman=trace`).
    pub level: String,
    /// Log retention period in hours.
    pub retention_hours: u32,
    /// Directory for the log file; `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            log_dir: None,
        }
    }
}

impl LogConfig {
    /// Normalizes a level name. Filter directives pass through unchanged.
    #[must_use]
    pub fn parse_level(value: &str) -> String {
        match value.trim().to_lowercase().as_str() {
            "trace" => "trace".to_string(),
            "debug" => "debug".to_string(),
            "info" => "info".to_string(),
            "warn" | "warning" => "warn".to_string(),
            "error" => "error".to_string(),
            "off" | "none" | "disabled" => "off".to_string(),
            _ if value.contains('=') => value.trim().to_string(),
            _ => DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(Self::parse_level(&self.level))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
    }
}

/// Returns the default log directory (~/.addman/logs/).
#[must_use]
pub fn log_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".addman")
        .join("logs")
}

/// File name of a log started now.
#[must_use]
pub fn log_file_name() -> String {
    let now = chrono::Local::now();
    format!("addman_{}.log", now.format("%Y-%m-%d_%H-%M-%S"))
}

/// Deletes `.log` files in `log_dir` older than the retention period.
///
/// # Errors
/// Returns error if the directory cannot be read.
pub fn cleanup_old_logs(log_dir: &Path, retention_hours: u32) -> io::Result<u32> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let retention = Duration::from_secs(u64::from(retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());

        if age.is_some_and(|age| age > retention) && fs::remove_file(&path).is_ok() {
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Initializes the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the duration of the program.
///
/// # Errors
/// Returns error if the log directory cannot be prepared or a subscriber
/// is already installed.
pub fn init(config: &LogConfig) -> io::Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time();

    let mut deleted = 0;
    let mut guard = None;
    let mut file_layer = None;

    if let Some(log_dir) = &config.log_dir {
        fs::create_dir_all(log_dir)?;
        deleted = cleanup_old_logs(log_dir, config.retention_hours)?;

        let appender = tracing_appender::rolling::never(log_dir, log_file_name());
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        file_layer = Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true),
        );
    }

    tracing_subscriber::registry()
        .with(config.filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::debug!("log level: {}", config.level);
    if let Some(log_dir) = &config.log_dir {
        tracing::debug!("log dir: {}", log_dir.display());
    }
    if deleted > 0 {
        tracing::debug!("cleaned up {} old log file(s)", deleted);
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.retention_hours, DEFAULT_LOG_RETENTION_HOURS);
        assert_eq!(config.level, DEFAULT_LOG_LEVEL);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(LogConfig::parse_level("debug"), "debug");
        assert_eq!(LogConfig::parse_level("DEBUG"), "debug");
        assert_eq!(LogConfig::parse_level("warning"), "warn");
        assert_eq!(LogConfig::parse_level("none"), "off");
        assert_eq!(LogConfig::parse_level("addman=trace"), "addman=trace");
        assert_eq!(LogConfig::parse_level("invalid"), DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_log_directory() {
        let dir = log_directory();
        assert!(dir.to_string_lossy().contains(".addman"));
        assert!(dir.ends_with("logs"));
    }

    #[test]
    fn test_cleanup_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("addman_recent.log"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let deleted = cleanup_old_logs(dir.path(), 1).unwrap();

        assert_eq!(deleted, 0);
        assert!(dir.path().join("addman_recent.log").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(cleanup_old_logs(&dir.path().join("nope"), 1).unwrap(), 0);
    }
}
