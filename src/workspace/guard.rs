//! Boundary checks for the workspace root.
//!
//! Every workspace is a direct child of one canonical root directory. The
//! guard validates the root once, at store construction, and then checks
//! every path the store creates or deletes against it.
//!
//! # Forbidden roots
//!
//! The root is never allowed to be `/` or to live under a credential
//! directory (`~/.ssh`, `~/.aws`, `/etc/ssh`, ...). Reclaiming a workspace is
//! a recursive delete, so a misconfigured root must fail loudly at startup.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::WorkspaceError;

/// Forbidden path prefixes relative to home directory.
const FORBIDDEN_HOME_PREFIXES: &[&str] = &[
    ".ssh",
    ".aws",
    ".gnupg",
    ".kube",
    ".config/gh",
    ".docker",
    ".cargo",
    ".config/gcloud",
];

/// Forbidden absolute path prefixes (not under home).
const FORBIDDEN_ABSOLUTE_PREFIXES: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/lib", "/boot", "/proc", "/sys", "/dev", "/run/secrets",
];

/// Validated workspace root.
#[derive(Debug, Clone)]
pub struct RootGuard {
    root: PathBuf,
}

impl RootGuard {
    /// Validates and canonicalises a workspace root.
    ///
    /// The directory must already exist.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::BoundaryViolation` if the root is relative,
    /// cannot be canonicalised, is `/`, or sits under a forbidden location.
    #[instrument(fields(root = %root.display()))]
    pub fn new(root: &Path) -> Result<Self, WorkspaceError> {
        if !root.is_absolute() {
            return Err(WorkspaceError::BoundaryViolation(format!(
                "workspace root must be absolute: {}",
                root.display()
            )));
        }

        let canonical = fs::canonicalize(root).map_err(|e| {
            WorkspaceError::BoundaryViolation(format!(
                "cannot canonicalize workspace root {}: {}",
                root.display(),
                e
            ))
        })?;

        if canonical.parent().is_none() {
            return Err(WorkspaceError::BoundaryViolation(
                "workspace root cannot be the filesystem root".to_string(),
            ));
        }

        for forbidden in forbidden_prefixes() {
            if canonical.starts_with(&forbidden) {
                return Err(WorkspaceError::BoundaryViolation(format!(
                    "workspace root is under forbidden path {}: {}",
                    forbidden.display(),
                    canonical.display()
                )));
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&canonical) {
                let mode = metadata.permissions().mode();
                if (mode & 0o002) != 0 {
                    warn!(
                        path = %canonical.display(),
                        mode = format!("{:o}", mode & 0o777),
                        "Workspace root is world-writable"
                    );
                }
            }
        }

        debug!(canonical = %canonical.display(), "Workspace root validated");
        Ok(Self { root: canonical })
    }

    /// The canonical root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the workspace for a sandbox id.
    #[must_use]
    pub fn workspace_path(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Checks that `path` names a workspace directly under the root.
    ///
    /// The final component must be a UUID and must not be a symlink.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::BoundaryViolation` otherwise.
    pub fn check_workspace(&self, path: &Path) -> Result<Uuid, WorkspaceError> {
        let violation = || {
            WorkspaceError::BoundaryViolation(format!(
                "not a workspace under {}: {}",
                self.root.display(),
                path.display()
            ))
        };

        if path.parent() != Some(self.root.as_path()) {
            return Err(violation());
        }

        let id = match path.components().next_back() {
            Some(Component::Normal(name)) => name
                .to_str()
                .and_then(|n| Uuid::parse_str(n).ok())
                .ok_or_else(violation)?,
            _ => return Err(violation()),
        };

        if path.is_symlink() {
            return Err(violation());
        }

        Ok(id)
    }
}

fn forbidden_prefixes() -> Vec<PathBuf> {
    let mut prefixes: Vec<PathBuf> = FORBIDDEN_ABSOLUTE_PREFIXES
        .iter()
        .map(PathBuf::from)
        .collect();

    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        prefixes.extend(FORBIDDEN_HOME_PREFIXES.iter().map(|p| home.join(p)));
    }

    // Compare against resolved paths where they exist
    prefixes
        .into_iter()
        .map(|p| fs::canonicalize(&p).unwrap_or(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_relative_root() {
        let err = RootGuard::new(Path::new("relative/root")).unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn test_rejects_filesystem_root() {
        let err = RootGuard::new(Path::new("/")).unwrap_err();
        assert!(err.to_string().contains("filesystem root"));
    }

    #[test]
    fn test_rejects_system_directories() {
        assert!(RootGuard::new(Path::new("/etc")).is_err());
        assert!(RootGuard::new(Path::new("/usr/bin")).is_err());
    }

    #[test]
    fn test_rejects_missing_root() {
        let temp = TempDir::new().expect("failed to create temp dir");
        assert!(RootGuard::new(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_check_workspace() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let guard = RootGuard::new(temp.path()).expect("valid root");
        let id = Uuid::new_v4();

        let path = guard.workspace_path(id);
        assert_eq!(guard.check_workspace(&path).unwrap(), id);

        // Not a UUID
        assert!(guard.check_workspace(&guard.root().join("notes")).is_err());
        // Nested too deep
        assert!(guard.check_workspace(&path.join(id.to_string())).is_err());
        // Escapes the root
        let outside = guard.root().join("..").join(id.to_string());
        assert!(guard.check_workspace(&outside).is_err());
    }

    #[test]
    fn test_check_workspace_rejects_symlink() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let guard = RootGuard::new(temp.path()).expect("valid root");
        let target = TempDir::new().expect("failed to create target dir");

        let link = guard.workspace_path(Uuid::new_v4());
        std::os::unix::fs::symlink(target.path(), &link).expect("failed to create symlink");

        assert!(guard.check_workspace(&link).is_err());
    }
}
