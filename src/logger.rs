use std::fs;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name of the diagnostic log inside the log directory.
pub const LOG_FILE_NAME: &str = "host.log";

/// Absolute path of the diagnostic log for a given log directory.
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LOG_FILE_NAME)
}

/// Initialize the structured logging system.
///
/// Sets up:
/// - File output: a single append-only `{log_dir}/host.log`, never rotated,
///   one line per event with the timestamp first. This is the diagnostic
///   sink operators are pointed at from status messages.
/// - Console output (stderr): human-readable format. stdout carries IPC
///   events and must stay clean.
/// - Environment filter: defaults to `info`, configurable via `RUST_LOG`.
///
/// Returns the log file path, or an error if the file cannot be opened or
/// a global subscriber is already installed.
pub fn init(log_dir: &Path) -> Result<PathBuf, String> {
    fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix("host")
        .filename_suffix("log")
        .build(log_dir)
        .map_err(|e| format!("Failed to create log file appender: {}", e))?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    // reqwest/hyper/mio are noisy at debug during readiness polling.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn,mio=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| format!("Logger already initialized: {}", e))?;

    let path = log_file_path(log_dir);
    tracing::info!(log_file = %path.display(), "Logger initialized");
    Ok(path)
}

/// Initialize logging, falling back to stderr-only output when the log
/// file cannot be opened. Never fails; returns the intended log path.
pub fn init_or_stderr(log_dir: &Path) -> PathBuf {
    match init(log_dir) {
        Ok(path) => path,
        Err(e) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(std::io::stderr)
                .try_init();
            tracing::warn!("File logging unavailable: {}", e);
            log_file_path(log_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        let path = log_file_path(Path::new("/data/logs"));
        assert_eq!(path, PathBuf::from("/data/logs/host.log"));
    }
}
