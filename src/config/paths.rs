//! Platform-specific data directory paths.
//!
//!   Windows: %APPDATA%/mobile-context-server/data
//!   macOS:   ~/Library/Application Support/mobile-context-server/data
//!   Linux:   $XDG_CONFIG_HOME/mobile-context-server/data (default ~/.config)
//!
//! `MCS_DATA_DIR` overrides all of the above (the mobile shell points it at
//! the app's private files directory).

use std::path::PathBuf;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "MCS_DATA_DIR";

/// Get the host data directory (cross-platform).
pub fn get_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    get_config_base()
        .join("mobile-context-server")
        .join("data")
}

/// Default location of the read-only bundle catalog.
pub fn get_catalog_dir() -> PathBuf {
    get_data_dir().join("servers")
}

/// Default parent of the per-run staged bundle directories.
pub fn get_staging_dir() -> PathBuf {
    get_data_dir().join("files")
}

/// Default directory for the diagnostic log.
pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Get the platform-appropriate base config directory.
fn get_config_base() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata);
        }
        dirs::config_dir().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("AppData")
                .join("Roaming")
        })
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Application Support")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    }
}
