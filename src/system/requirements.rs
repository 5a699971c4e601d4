//! Host runtime requirements checking implementation.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RequirementsError;

/// Minimum required git version (major, minor).
///
/// `GIT_CONFIG_COUNT` environment configuration arrived in 2.31.
pub const MIN_GIT_VERSION: (u32, u32) = (2, 31);

/// Directories searched for sandbox programs. The host `$PATH` is never consulted.
pub const DEFAULT_SEARCH_PATH: &[&str] = &["/usr/bin", "/bin", "/usr/local/bin"];

/// Results of all runtime requirement checks.
#[derive(Debug, Clone)]
pub struct RuntimeRequirements {
    /// Resolved git executable
    pub git_path: PathBuf,
    /// Version string reported by git (e.g., "2.43.0")
    pub git_version: String,
    /// Parsed git major version
    pub git_major: u32,
    /// Parsed git minor version
    pub git_minor: u32,
    /// Workspace root that was checked for writability
    pub workspace_root: PathBuf,
}

impl RuntimeRequirements {
    /// Check if all requirements are met.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        version_at_least((self.git_major, self.git_minor), MIN_GIT_VERSION)
    }
}

/// Returns the default search path as owned paths.
#[must_use]
pub fn default_search_path() -> Vec<PathBuf> {
    DEFAULT_SEARCH_PATH.iter().map(PathBuf::from).collect()
}

/// Check all runtime requirements and return detailed results.
///
/// # Errors
///
/// Returns the first failing requirement.
pub fn check_all(
    workspace_root: &Path,
    search_path: &[PathBuf],
) -> Result<RuntimeRequirements, RequirementsError> {
    let (git_path, git_version, git_major, git_minor) = check_git(search_path)?;
    check_root_writable(workspace_root)?;

    Ok(RuntimeRequirements {
        git_path,
        git_version,
        git_major,
        git_minor,
        workspace_root: workspace_root.to_path_buf(),
    })
}

/// Resolves a program name to the first matching executable in `search_path`.
///
/// Names containing `/` are never resolved.
#[must_use]
pub fn find_program(name: &str, search_path: &[PathBuf]) -> Option<PathBuf> {
    if name.is_empty() || name.contains('/') {
        return None;
    }

    search_path
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Check that git is present and recent enough.
///
/// # Returns
///
/// Tuple of (path, version_string, major, minor) on success.
///
/// # Errors
///
/// Returns error if git cannot be found, cannot report its version, or is too old.
pub fn check_git(search_path: &[PathBuf]) -> Result<(PathBuf, String, u32, u32), RequirementsError> {
    let git = find_program("git", search_path).ok_or(RequirementsError::GitMissing)?;
    let version = git_version(&git).ok_or(RequirementsError::GitMissing)?;
    let (major, minor) = parse_git_version(&version).ok_or_else(|| RequirementsError::GitTooOld {
        found: version.clone(),
        required: format!("{}.{}", MIN_GIT_VERSION.0, MIN_GIT_VERSION.1),
    })?;

    if !version_at_least((major, minor), MIN_GIT_VERSION) {
        return Err(RequirementsError::GitTooOld {
            found: version,
            required: format!("{}.{}", MIN_GIT_VERSION.0, MIN_GIT_VERSION.1),
        });
    }

    debug!(path = %git.display(), %version, "git runtime found");
    Ok((git, version, major, minor))
}

/// Runs `git --version` with an empty environment and returns the version part.
#[must_use]
pub fn git_version(git: &Path) -> Option<String> {
    let output = Command::new(git)
        .arg("--version")
        .env_clear()
        .stdin(Stdio::null())
        .output()
        .ok()?;

    if !output.status.success() {
        warn!(status = ?output.status, "git --version failed");
        return None;
    }

    // Format: "git version 2.43.0" (possibly with a vendor suffix)
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .strip_prefix("git version ")
        .map(|v| v.split_whitespace().next().unwrap_or(v).to_string())
}

/// Parse a git version string into (major, minor).
#[must_use]
pub fn parse_git_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse::<u32>().ok()?;

    // Minor version might carry a suffix like "39-rc1", keep the digits
    let minor_str = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("0");
    let minor = minor_str.parse::<u32>().ok()?;

    Some((major, minor))
}

fn version_at_least(found: (u32, u32), required: (u32, u32)) -> bool {
    found.0 > required.0 || (found.0 == required.0 && found.1 >= required.1)
}

/// Check that files can be created and removed under the workspace root.
///
/// # Errors
///
/// Returns `RequirementsError::RootNotWritable` if the check file cannot be written.
pub fn check_root_writable(root: &Path) -> Result<(), RequirementsError> {
    let marker = root.join(format!(".write-check-{}", Uuid::new_v4()));

    fs::write(&marker, b"check").map_err(|e| RequirementsError::RootNotWritable {
        path: root.to_path_buf(),
        source: e,
    })?;

    if let Err(e) = fs::remove_file(&marker) {
        warn!(path = %marker.display(), error = %e, "Failed to remove write-check file");
    }

    Ok(())
}
