//! Registry-wide maintenance: idle expiry, orphan recovery, shutdown and health.

use std::panic::{self, AssertUnwindSafe};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::{SandboxId, SandboxRegistry, SandboxStatus};
use crate::command::Program;
use crate::sandbox::{CancelToken, Invocation};

/// Owner recorded on the throwaway sandbox used by health checks.
const HEALTH_OWNER: &str = "__health_check__";

/// Result of a synthetic self-test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// A sandbox could be created, used and destroyed.
    pub healthy: bool,
    /// The git executable is available.
    pub runtime_present: bool,
    /// Version reported by git, when it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_version: Option<String>,
    /// What went wrong, if anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Live sandboxes, not counting the throwaway one.
    pub active_sandboxes: usize,
}

impl SandboxRegistry {
    /// Destroys every sandbox idle for longer than the configured threshold.
    ///
    /// Sandboxes with a command in flight are skipped and reconsidered on
    /// the next pass. A panic while tearing one sandbox down is logged and
    /// does not stop the others. Returns how many teardowns completed.
    #[instrument(skip(self))]
    pub fn expire_idle(&self) -> usize {
        let now = Utc::now();
        let threshold = self.config.idle_timeout;

        let expired: Vec<_> = {
            let mut sandboxes = self.sandboxes();
            let candidates: Vec<_> = sandboxes
                .iter()
                .filter(|(_, slot)| {
                    // Holding the exec lock keeps a command from starting mid-expiry
                    match slot.try_exec() {
                        Some(_exec) => {
                            let mut meta = slot.meta();
                            if meta.idle_for(now) >= threshold {
                                meta.finish(SandboxStatus::Expired);
                                true
                            } else {
                                false
                            }
                        }
                        None => false,
                    }
                })
                .map(|(id, _)| *id)
                .collect();

            candidates
                .into_iter()
                .filter_map(|id| sandboxes.remove(&id).map(|slot| (id, slot)))
                .collect()
        };

        for_each_isolated(&expired, |id, slot| {
            self.teardown(slot, SandboxStatus::Expired);
            info!(%id, "Idle sandbox expired");
        })
    }

    /// Reclaims workspaces left behind by a previous process.
    ///
    /// Failures are logged and retried on the next call.
    #[instrument(skip(self))]
    pub fn reclaim_orphans(&self) -> usize {
        match self.store.reclaim_orphans() {
            Ok(0) => 0,
            Ok(count) => {
                info!(count, "Reclaimed orphaned workspaces");
                count
            }
            Err(e) => {
                warn!(error = %e, "Orphan sweep failed");
                0
            }
        }
    }

    /// Destroys every live sandbox. Used on shutdown.
    #[instrument(skip(self))]
    pub fn destroy_all(&self) -> usize {
        let drained: Vec<_> = self.sandboxes().drain().collect();

        for_each_isolated(&drained, |id, slot| {
            self.teardown(slot, SandboxStatus::Destroyed);
            debug!(%id, "Sandbox destroyed on shutdown");
        });

        if !drained.is_empty() {
            info!(count = drained.len(), "Destroyed all sandboxes");
        }
        drained.len()
    }

    /// Creates a throwaway sandbox, runs one trivial command in it and destroys it.
    ///
    /// Runs `git --version` when git is present, otherwise `pwd`.
    #[instrument(skip(self))]
    pub fn health_check(&self) -> HealthReport {
        let runtime_present = self.runner.runtime_present(Program::Git);

        let sandbox = match self.insert(HEALTH_OWNER, None, false) {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(error = %e, "Health check could not create a sandbox");
                return HealthReport {
                    healthy: false,
                    runtime_present,
                    git_version: None,
                    detail: Some(format!("{e}")),
                    active_sandboxes: self.len(),
                };
            }
        };

        let check = if runtime_present {
            Invocation::new(Program::Git, ["--version"], &sandbox.workspace)
        } else {
            Invocation::new(Program::Pwd, Vec::<String>::new(), &sandbox.workspace)
        };

        let outcome = self.runner.run(&check, &CancelToken::new());
        self.destroy(sandbox.id);

        let (ran_ok, git_version, detail) = match outcome {
            Ok(result) if result.success() => {
                let stdout = result.stdout_text();
                let version = stdout
                    .trim()
                    .strip_prefix("git version ")
                    .filter(|_| runtime_present)
                    .map(str::to_string);
                (true, version, None)
            }
            Ok(result) => (
                false,
                None,
                Some(format!("`{}` failed: {}", check.raw, result.stderr_text().trim())),
            ),
            Err(e) => (false, None, Some(e.to_string())),
        };

        let healthy = ran_ok && runtime_present;
        let detail = detail.or_else(|| (!runtime_present).then(|| "git not found".to_string()));
        if !healthy {
            warn!(?detail, "Health check failed");
        }

        HealthReport {
            healthy,
            runtime_present,
            git_version,
            detail,
            active_sandboxes: self.len(),
        }
    }
}

/// Tears down each removed sandbox, containing a panic to the sandbox that raised it.
///
/// Returns how many teardowns completed.
fn for_each_isolated<T>(items: &[(SandboxId, T)], f: impl Fn(&SandboxId, &T)) -> usize {
    items
        .iter()
        .filter(|(id, item)| match panic::catch_unwind(AssertUnwindSafe(|| f(id, item))) {
            Ok(()) => true,
            Err(_) => {
                warn!(%id, "Sandbox teardown panicked, continuing with the rest");
                false
            }
        })
        .count()
}
