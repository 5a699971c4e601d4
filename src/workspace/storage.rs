//! Filesystem helpers for the workspace root.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::WorkspaceError;

/// Directory permissions: owner read/write/execute only (0700).
pub const DIR_PERMISSIONS: u32 = 0o700;

/// Returns the default workspace root.
///
/// Lives under the system temp directory: workspaces are scratch space.
#[must_use]
pub fn default_root() -> PathBuf {
    std::env::temp_dir().join("gitquest-sandboxes")
}

/// Ensures the root directory exists with correct permissions.
///
/// Permissions are only set when the directory is created here; an existing
/// root keeps whatever the operator configured.
///
/// # Errors
///
/// Returns `WorkspaceError::IoError` if directory creation fails.
pub fn ensure_root_dir(root: &Path) -> Result<(), WorkspaceError> {
    if !root.exists() {
        fs::create_dir_all(root).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to create workspace root: {}", root.display()),
            source: e,
        })?;

        set_private(root)?;
    }
    Ok(())
}

/// Creates a single new directory with 0700 permissions.
///
/// Fails if the directory already exists; parents are never created.
pub(crate) fn create_private_dir(path: &Path) -> Result<(), std::io::Error> {
    fs::create_dir(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(DIR_PERMISSIONS))
}

fn set_private(path: &Path) -> Result<(), WorkspaceError> {
    let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
    fs::set_permissions(path, permissions).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to set permissions on: {}", path.display()),
        source: e,
    })
}

/// Sums the sizes of all regular files below `root`.
///
/// Entries that disappear or cannot be read during the walk are skipped.
#[must_use]
pub fn disk_usage(root: &Path) -> u64 {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
