//! Configuration reading and data directory paths.

pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

/// Port both transports serve on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 3000;

/// Top-level host_config.json shape (written by the mobile shell).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    /// Port shared by the sidecar and the fallback listener.
    pub port: u16,
    /// Read-only catalog of bundles (one sub-directory per bundle).
    pub catalog_dir: Option<PathBuf>,
    /// Writable parent directory bundles are staged into.
    pub staging_dir: Option<PathBuf>,
    /// Entry script every bundle must contain.
    pub entry_file: String,
    /// `argv[0]` handed to the bridge.
    pub interpreter: String,
    /// Executable the process bridge runs.
    pub runtime_binary: PathBuf,
    /// Flags inserted between the interpreter marker and the entry path.
    pub diagnostic_flags: Vec<String>,
    /// Arguments appended after the entry path.
    pub extra_args: Vec<String>,
    /// Fixed wait after launch before readiness polling begins.
    pub settle_interval_ms: u64,
    /// Number of readiness probes before giving up.
    pub readiness_attempts: u32,
    /// Initial delay between readiness probes (doubles each attempt).
    pub readiness_backoff_ms: u64,
    /// Per-request timeout for readiness and self-test probes.
    pub probe_timeout_ms: u64,
    /// Candidate URLs for the connectivity self-test; empty means the
    /// defaults for `port`.
    pub probe_urls: Vec<String>,
    /// Directory holding the diagnostic log.
    pub log_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            catalog_dir: None,
            staging_dir: None,
            entry_file: "main.js".to_string(),
            interpreter: "node".to_string(),
            runtime_binary: PathBuf::from("node"),
            diagnostic_flags: vec!["--trace-warnings".to_string()],
            extra_args: Vec::new(),
            settle_interval_ms: 2000,
            readiness_attempts: 10,
            readiness_backoff_ms: 250,
            probe_timeout_ms: 5000,
            probe_urls: Vec::new(),
            log_dir: None,
        }
    }
}

impl HostConfig {
    pub fn catalog_dir(&self) -> PathBuf {
        self.catalog_dir.clone().unwrap_or_else(paths::get_catalog_dir)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(paths::get_staging_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(paths::get_log_dir)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn readiness_backoff(&self) -> Duration {
        Duration::from_millis(self.readiness_backoff_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_urls(&self) -> Vec<String> {
        if self.probe_urls.is_empty() {
            default_probe_urls(self.port)
        } else {
            self.probe_urls.clone()
        }
    }
}

/// Self-test URLs: loopback by name, loopback by address, and the
/// emulator's alias for the development host.
pub fn default_probe_urls(port: u16) -> Vec<String> {
    vec![
        format!("http://localhost:{}", port),
        format!("http://127.0.0.1:{}", port),
        format!("http://10.0.2.2:{}", port),
    ]
}

/// Read host_config.json from the data directory.
pub fn read_host_config() -> HostConfig {
    read_host_config_from(&get_config_path())
}

/// Read a host config from an explicit path, falling back to defaults.
pub fn read_host_config_from(path: &Path) -> HostConfig {
    read_json_file(path).unwrap_or_default()
}

/// Path to host_config.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("host_config.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.entry_file, "main.js");
        assert_eq!(config.interpreter, "node");
        assert_eq!(config.diagnostic_flags, vec!["--trace-warnings"]);
        assert_eq!(config.settle_interval(), Duration::from_secs(2));
        assert_eq!(config.probe_urls().len(), 3);
        assert!(config.probe_urls()[1].ends_with("127.0.0.1:3000"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: HostConfig =
            serde_json::from_str(r#"{"port": 3100, "entryFile": "index.js"}"#).unwrap();
        assert_eq!(config.port, 3100);
        assert_eq!(config.entry_file, "index.js");
        assert_eq!(config.readiness_attempts, 10);
        assert_eq!(config.probe_urls()[0], "http://localhost:3100");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = read_host_config_from(Path::new("/nonexistent/host_config.json"));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let config = read_host_config_from(&path);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_explicit_dirs_override_data_dir() {
        let config = HostConfig {
            catalog_dir: Some(PathBuf::from("/tmp/catalog")),
            ..HostConfig::default()
        };
        assert_eq!(config.catalog_dir(), PathBuf::from("/tmp/catalog"));
    }
}
