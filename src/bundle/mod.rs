//! Server bundles and the read-only catalog they are selected from.
//!
//! A bundle is a named directory (entry script plus dependencies) under the
//! catalog root. Before the sidecar can run it, the bundle is staged into a
//! writable, run-scoped directory by [`stager::stage`].

pub mod stager;

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

pub use stager::{discard, stage};

/// A named bundle and the two places it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerBundle {
    pub name: String,
    /// Read-only source inside the catalog.
    pub source_dir: PathBuf,
    /// Writable copy, recreated on every staging.
    pub staged_dir: PathBuf,
    /// File that must exist in the staged copy.
    pub entry_file: String,
}

impl ServerBundle {
    /// Absolute path of the staged entry script.
    pub fn entry_path(&self) -> PathBuf {
        self.staged_dir.join(&self.entry_file)
    }

    /// A bundle is valid only once its staged copy holds the entry file.
    pub fn is_valid(&self) -> bool {
        self.entry_path().is_file()
    }
}

/// Enumerates the bundle catalog and resolves bundle names to paths.
///
/// Names are never checked against a fixed list; whatever directories the
/// catalog holds are the available bundles.
#[derive(Debug, Clone)]
pub struct BundleCatalog {
    root: PathBuf,
    staging_root: PathBuf,
    entry_file: String,
}

impl BundleCatalog {
    pub fn new(
        root: impl Into<PathBuf>,
        staging_root: impl Into<PathBuf>,
        entry_file: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            staging_root: staging_root.into(),
            entry_file: entry_file.into(),
        }
    }

    /// Sorted names of every bundle directory in the catalog.
    pub fn list(&self) -> Result<Vec<String>, StageError> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| StageError::source_unreadable(&self.root, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StageError::source_unreadable(&self.root, e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();

        if names.is_empty() {
            tracing::warn!(catalog = %self.root.display(), "Bundle catalog is empty");
        }
        Ok(names)
    }

    /// Resolve a bundle name to its source and staging locations.
    ///
    /// Only a single plain path component is accepted so a name can never
    /// escape the catalog or staging roots.
    pub fn bundle(&self, name: &str) -> Result<ServerBundle, StageError> {
        let mut components = Path::new(name).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_normal {
            return Err(StageError::SourceUnreadable {
                path: self.root.join(name),
                detail: format!("invalid bundle name: {:?}", name),
            });
        }

        Ok(ServerBundle {
            name: name.to_string(),
            source_dir: self.root.join(name),
            staged_dir: self.staging_root.join(name),
            entry_file: self.entry_file.clone(),
        })
    }
}

/// Why staging a bundle failed. Every variant is terminal for the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// The catalog or bundle source could not be enumerated or read.
    SourceUnreadable { path: PathBuf, detail: String },
    /// The staging directory could not be written (disk full, permissions).
    WriteFailed { path: PathBuf, detail: String },
    /// Staging finished but the entry file is not in the staged copy.
    MissingEntryPoint { path: PathBuf },
}

impl StageError {
    pub(crate) fn source_unreadable(path: &Path, err: impl fmt::Display) -> Self {
        Self::SourceUnreadable {
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
    }

    pub(crate) fn write_failed(path: &Path, err: impl fmt::Display) -> Self {
        Self::WriteFailed {
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceUnreadable { path, detail } => {
                write!(f, "bundle source unreadable ({}): {}", path.display(), detail)
            }
            Self::WriteFailed { path, detail } => {
                write!(f, "failed to write staged bundle ({}): {}", path.display(), detail)
            }
            Self::MissingEntryPoint { path } => {
                write!(f, "entry file missing from staged bundle: {}", path.display())
            }
        }
    }
}

impl std::error::Error for StageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_sorted_directories_only() {
        let catalog_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(catalog_dir.path().join("weather")).unwrap();
        std::fs::create_dir(catalog_dir.path().join("calendar")).unwrap();
        std::fs::write(catalog_dir.path().join("README"), "not a bundle").unwrap();

        let catalog = BundleCatalog::new(catalog_dir.path(), "/tmp/unused", "main.js");
        assert_eq!(catalog.list().unwrap(), vec!["calendar", "weather"]);
    }

    #[test]
    fn test_list_missing_catalog() {
        let catalog = BundleCatalog::new("/nonexistent/catalog", "/tmp/unused", "main.js");
        assert!(matches!(
            catalog.list(),
            Err(StageError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn test_bundle_paths() {
        let catalog = BundleCatalog::new("/assets/servers", "/data/files", "main.js");
        let bundle = catalog.bundle("weather").unwrap();
        assert_eq!(bundle.source_dir, PathBuf::from("/assets/servers/weather"));
        assert_eq!(bundle.staged_dir, PathBuf::from("/data/files/weather"));
        assert_eq!(bundle.entry_path(), PathBuf::from("/data/files/weather/main.js"));
        assert!(!bundle.is_valid());
    }

    #[test]
    fn test_bundle_rejects_traversal() {
        let catalog = BundleCatalog::new("/assets/servers", "/data/files", "main.js");
        assert!(catalog.bundle("../etc").is_err());
        assert!(catalog.bundle("a/b").is_err());
        assert!(catalog.bundle("").is_err());
        assert!(catalog.bundle("/abs").is_err());
    }
}
