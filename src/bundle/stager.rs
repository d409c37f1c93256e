//! Bundle staging: read-only catalog -> clean writable copy.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ServerBundle, StageError};

/// Materialize `bundle` into its staged directory and return that directory.
///
/// The staged directory is purged and recreated first, so repeated staging
/// of the same bundle always yields a clean copy. Everything copied is
/// marked executable. Fails with [`StageError::MissingEntryPoint`] if the
/// copy does not contain the bundle's entry file.
pub fn stage(bundle: &ServerBundle) -> Result<PathBuf, StageError> {
    let source = &bundle.source_dir;
    let target = &bundle.staged_dir;
    info!(bundle = %bundle.name, source = %source.display(), target = %target.display(), "Staging bundle");

    let meta = fs::metadata(source).map_err(|e| StageError::source_unreadable(source, e))?;
    if !meta.is_dir() {
        return Err(StageError::source_unreadable(source, "not a directory"));
    }

    purge(target)?;
    fs::create_dir_all(target).map_err(|e| StageError::write_failed(target, e))?;

    let copied = copy_tree(source, target)?;
    mark_executable(target);

    let entry = bundle.entry_path();
    if !entry.is_file() {
        warn!(bundle = %bundle.name, entry = %entry.display(), "Entry file missing after staging");
        return Err(StageError::MissingEntryPoint { path: entry });
    }

    info!(bundle = %bundle.name, files = copied, "Bundle staged");
    Ok(target.clone())
}

/// Delete a bundle's staged copy. A copy that was never staged is fine.
pub fn discard(bundle: &ServerBundle) -> Result<(), StageError> {
    purge(&bundle.staged_dir)?;
    debug!(bundle = %bundle.name, "Discarded staged bundle");
    Ok(())
}

fn purge(dir: &Path) -> Result<(), StageError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StageError::write_failed(dir, e)),
    }
}

/// Recursively copy `source` into `target`. Returns the number of files.
fn copy_tree(source: &Path, target: &Path) -> Result<usize, StageError> {
    let mut files = 0;

    for entry in WalkDir::new(source).follow_links(true).min_depth(1) {
        let entry = entry.map_err(|e| StageError::source_unreadable(source, e))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| StageError::source_unreadable(entry.path(), e))?;
        let dest = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| StageError::write_failed(&dest, e))?;
            continue;
        }

        fs::copy(entry.path(), &dest).map_err(|e| copy_error(entry.path(), &dest, e))?;
        files += 1;
    }

    Ok(files)
}

/// Blame the source only if it cannot be opened for reading.
fn copy_error(source: &Path, dest: &Path, err: std::io::Error) -> StageError {
    match fs::File::open(source) {
        Err(open_err) => StageError::source_unreadable(source, open_err),
        Ok(_) => StageError::write_failed(dest, err),
    }
}

/// Best effort: a file that cannot be chmodded is logged, not fatal.
#[cfg(unix)]
fn mark_executable(root: &Path) {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let result = fs::metadata(path).and_then(|meta| {
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o111);
            fs::set_permissions(path, perms)
        });
        if let Err(e) = result {
            warn!("Failed to mark {} executable: {}", path.display(), e);
        }
    }
}

#[cfg(not(unix))]
fn mark_executable(_root: &Path) {}
