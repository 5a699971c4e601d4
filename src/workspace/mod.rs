//! Workspace store: one private directory per sandbox under a shared root.
//!
//! # Storage Layout
//!
//! ```text
//! {root}/
//! ├── {sandbox-uuid}/   # workspace, mode 0700, commands run here
//! ├── {sandbox-uuid}/
//! └── ...               # non-UUID entries belong to other tenants
//! ```
//!
//! The store remembers which workspaces it allocated in this process. Any
//! UUID-named directory it does not know about is an orphan left behind by a
//! crashed process and is reclaimed by the reaper.
//!
//! Only the sandbox registry talks to the store.

mod guard;
mod storage;

pub use guard::RootGuard;
pub use storage::{DIR_PERMISSIONS, default_root, disk_usage, ensure_root_dir};

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::error::WorkspaceError;

/// Limits applied when allocating workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLimits {
    /// Maximum number of live workspaces.
    pub max_workspaces: usize,
    /// Maximum total bytes of files under the root, if enforced.
    pub disk_quota_bytes: Option<u64>,
}

impl Default for WorkspaceLimits {
    fn default() -> Self {
        Self {
            max_workspaces: 1024,
            disk_quota_bytes: None,
        }
    }
}

/// Allocates and reclaims workspace directories.
#[derive(Debug)]
pub struct WorkspaceStore {
    guard: RootGuard,
    limits: WorkspaceLimits,
    allocations: Mutex<HashMap<Uuid, PathBuf>>,
}

impl WorkspaceStore {
    /// Opens the store, creating the root if needed.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError` if the root cannot be created or is not an
    /// acceptable location.
    #[instrument(skip(limits), fields(root = %root.display()))]
    pub fn open(root: &Path, limits: WorkspaceLimits) -> Result<Self, WorkspaceError> {
        ensure_root_dir(root)?;
        let guard = RootGuard::new(root)?;
        debug!(root = %guard.root().display(), ?limits, "Workspace store opened");

        Ok(Self {
            guard,
            limits,
            allocations: Mutex::new(HashMap::new()),
        })
    }

    /// The canonical workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.guard.root()
    }

    /// Allocates a fresh, empty workspace for a sandbox.
    ///
    /// # Errors
    ///
    /// - `AlreadyAllocated` if the id already has a workspace (or the path exists)
    /// - `CapacityExceeded` if `max_workspaces` are live
    /// - `DiskQuotaExceeded` if the root is over its byte quota
    /// - `IoError` if the directory cannot be created
    #[instrument(skip(self), fields(%id))]
    pub fn allocate(&self, id: Uuid) -> Result<PathBuf, WorkspaceError> {
        let mut allocations = self.allocations();

        if allocations.contains_key(&id) {
            return Err(WorkspaceError::AlreadyAllocated { id: id.to_string() });
        }

        if allocations.len() >= self.limits.max_workspaces {
            return Err(WorkspaceError::CapacityExceeded {
                limit: self.limits.max_workspaces,
            });
        }

        if let Some(quota) = self.limits.disk_quota_bytes {
            let used = disk_usage(self.root());
            if used >= quota {
                return Err(WorkspaceError::DiskQuotaExceeded { used, quota });
            }
        }

        let path = self.guard.workspace_path(id);
        self.guard.check_workspace(&path)?;

        storage::create_private_dir(&path).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => WorkspaceError::AlreadyAllocated { id: id.to_string() },
            _ => WorkspaceError::IoError {
                context: format!("failed to create workspace: {}", path.display()),
                source: e,
            },
        })?;

        allocations.insert(id, path.clone());
        debug!(path = %path.display(), "Workspace allocated");
        Ok(path)
    }

    /// Recursively deletes a workspace.
    ///
    /// Best effort and idempotent: a missing directory is not an error.
    /// Returns true if a directory was removed.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn reclaim(&self, path: &Path) -> bool {
        let id = match self.guard.check_workspace(path) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Refusing to reclaim path outside the workspace root");
                return false;
            }
        };

        self.allocations().remove(&id);

        match fs::remove_dir_all(path) {
            Ok(()) => {
                debug!("Workspace reclaimed");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Workspace already gone");
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to reclaim workspace");
                false
            }
        }
    }

    /// Lists UUID-named directories under the root that this store did not allocate.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if the root cannot be read.
    pub fn orphans(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        let entries = fs::read_dir(self.root()).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to read workspace root: {}", self.root().display()),
            source: e,
        })?;

        // Snapshot under the lock so an allocation in progress is never mistaken for an orphan
        let allocations = self.allocations();
        let mut orphans = Vec::new();

        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            if let Ok(id) = self.guard.check_workspace(&path) {
                if !allocations.contains_key(&id) {
                    orphans.push(path);
                }
            }
        }

        trace!(count = orphans.len(), "Found orphaned workspaces");
        Ok(orphans)
    }

    /// Reclaims every orphaned workspace, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if the root cannot be read.
    #[instrument(skip(self))]
    pub fn reclaim_orphans(&self) -> Result<usize, WorkspaceError> {
        let orphans = self.orphans()?;
        let mut reclaimed = 0;

        for path in orphans {
            // Re-check: the id may have been allocated since the listing
            let Ok(id) = self.guard.check_workspace(&path) else {
                continue;
            };
            if self.allocations().contains_key(&id) {
                continue;
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "Orphaned workspace reclaimed");
                    reclaimed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to reclaim orphan"),
            }
        }

        Ok(reclaimed)
    }

    /// Number of live allocations.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocations().len()
    }

    /// Bytes currently used under the root.
    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        disk_usage(self.root())
    }

    fn allocations(&self) -> MutexGuard<'_, HashMap<Uuid, PathBuf>> {
        self.allocations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(limits: WorkspaceLimits) -> (TempDir, WorkspaceStore) {
        let temp = TempDir::new().expect("failed to create temp dir");
        let store = WorkspaceStore::open(&temp.path().join("root"), limits).expect("open store");
        (temp, store)
    }

    #[test]
    fn test_allocate_creates_private_child() {
        let (_temp, store) = store(WorkspaceLimits::default());
        let id = Uuid::new_v4();

        let path = store.allocate(id).expect("allocate");

        assert!(path.is_dir());
        assert_eq!(path.parent(), Some(store.root()));
        assert_eq!(fs::read_dir(&path).unwrap().count(), 0);
        assert_eq!(store.allocated(), 1);
    }

    #[test]
    fn test_allocate_same_id_twice_fails() {
        let (_temp, store) = store(WorkspaceLimits::default());
        let id = Uuid::new_v4();

        store.allocate(id).expect("allocate");
        assert!(matches!(
            store.allocate(id),
            Err(WorkspaceError::AlreadyAllocated { .. })
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let (_temp, store) = store(WorkspaceLimits {
            max_workspaces: 2,
            disk_quota_bytes: None,
        });

        store.allocate(Uuid::new_v4()).expect("first");
        let second = store.allocate(Uuid::new_v4()).expect("second");
        assert!(matches!(
            store.allocate(Uuid::new_v4()),
            Err(WorkspaceError::CapacityExceeded { limit: 2 })
        ));

        // Reclaiming frees a slot
        assert!(store.reclaim(&second));
        store.allocate(Uuid::new_v4()).expect("after reclaim");
    }

    #[test]
    fn test_disk_quota() {
        let (_temp, store) = store(WorkspaceLimits {
            max_workspaces: 10,
            disk_quota_bytes: Some(10),
        });

        let path = store.allocate(Uuid::new_v4()).expect("first");
        fs::write(path.join("big"), vec![0u8; 32]).unwrap();

        assert!(matches!(
            store.allocate(Uuid::new_v4()),
            Err(WorkspaceError::DiskQuotaExceeded { quota: 10, .. })
        ));
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let (_temp, store) = store(WorkspaceLimits::default());
        let path = store.allocate(Uuid::new_v4()).expect("allocate");
        fs::write(path.join("file.txt"), "data").unwrap();

        assert!(store.reclaim(&path));
        assert!(!path.exists());
        assert!(!store.reclaim(&path));
        assert_eq!(store.allocated(), 0);
    }

    #[test]
    fn test_reclaim_refuses_outside_root() {
        let (temp, store) = store(WorkspaceLimits::default());
        let outside = temp.path().join("keep-me");
        fs::create_dir(&outside).unwrap();

        assert!(!store.reclaim(&outside));
        assert!(outside.exists());
    }

    #[test]
    fn test_orphans_ignore_allocated_and_foreign_entries() {
        let (_temp, store) = store(WorkspaceLimits::default());
        let live = store.allocate(Uuid::new_v4()).expect("allocate");

        let orphan = store.root().join(Uuid::new_v4().to_string());
        fs::create_dir(&orphan).unwrap();
        let foreign = store.root().join("other-tenant");
        fs::create_dir(&foreign).unwrap();

        assert_eq!(store.orphans().unwrap(), vec![orphan.clone()]);
        assert_eq!(store.reclaim_orphans().unwrap(), 1);

        assert!(!orphan.exists());
        assert!(live.exists());
        assert!(foreign.exists());
    }
}
