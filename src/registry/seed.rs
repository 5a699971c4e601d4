//! Initial repository state for lesson sandboxes.
//!
//! A lesson may start the player in a repository that already has history.
//! Seeding replays that history with the real git binary through the
//! runner, bypassing the validator: seeds are lesson content, not player
//! input. File paths are still confined to the workspace.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{Sandbox, SandboxRegistry};
use crate::command::Program;
use crate::error::SandboxError;
use crate::sandbox::{CancelToken, Invocation};

/// Branch used when a seed does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// File touched by commits that list no files.
const README: &str = "README.md";

/// One commit to replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedCommit {
    /// Commit message.
    #[serde(default = "default_message")]
    pub message: String,

    /// Branch to commit on; created from the current HEAD if new.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Files to write before committing, relative path to content.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

fn default_message() -> String {
    "Commit".to_string()
}

/// Repository state a sandbox starts with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoSeed {
    /// Commits in replay order.
    pub commits: Vec<SeedCommit>,

    /// Branches that must exist afterwards, created at the final HEAD.
    pub branches: Vec<String>,

    /// Branch checked out when seeding finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_branch: Option<String>,
}

impl RepoSeed {
    /// Branch the repository starts on.
    fn initial_branch(&self) -> &str {
        self.commits
            .first()
            .and_then(|c| c.branch.as_deref())
            .or(self.current_branch.as_deref())
            .unwrap_or(DEFAULT_BRANCH)
    }

    /// Checks names and paths before anything touches the disk.
    fn check(&self) -> Result<(), String> {
        let branches = self
            .commits
            .iter()
            .filter_map(|c| c.branch.as_deref())
            .chain(self.branches.iter().map(String::as_str))
            .chain(self.current_branch.as_deref());
        for branch in branches {
            check_branch_name(branch)?;
        }

        for commit in &self.commits {
            for path in commit.files.keys() {
                check_relative_path(path)?;
            }
        }

        if self.commits.is_empty() && !self.branches.is_empty() {
            return Err("branches require at least one commit".to_string());
        }
        Ok(())
    }
}

fn check_branch_name(name: &str) -> Result<(), String> {
    let bad = name.is_empty()
        || name.starts_with('-')
        || name.contains("..")
        || name.chars().any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if bad {
        Err(format!("invalid branch name: {name:?}"))
    } else {
        Ok(())
    }
}

fn check_relative_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    let confined = !path.is_empty()
        && p.components().all(|c| matches!(c, Component::Normal(_)))
        && !p
            .components()
            .any(|c| c.as_os_str().eq_ignore_ascii_case(".git"));
    if confined {
        Ok(())
    } else {
        Err(format!("file path escapes the workspace: {path:?}"))
    }
}

impl SandboxRegistry {
    /// Creates a sandbox whose workspace starts as the seeded repository.
    ///
    /// A seed that fails to apply destroys the sandbox.
    ///
    /// # Errors
    ///
    /// Everything [`SandboxRegistry::create`] returns, plus `Seed` if the
    /// seed is malformed or a git step fails, and `Spawn` if git cannot run.
    #[instrument(skip(self, seed), fields(commits = seed.commits.len()))]
    pub fn create_seeded(
        &self,
        owner: &str,
        lesson_id: Option<&str>,
        seed: &RepoSeed,
    ) -> Result<Sandbox, SandboxError> {
        seed.check().map_err(|reason| SandboxError::Seed { reason })?;

        let sandbox = self.create(owner, lesson_id)?;
        let applied = self.slot(sandbox.id).and_then(|slot| {
            let _exec = slot.wait_exec();
            Seeder {
                registry: self,
                workspace: &sandbox.workspace,
                cancel: &slot.cancel,
            }
            .apply(seed)
        });

        match applied {
            Ok(()) => {
                debug!(id = %sandbox.id, "Sandbox seeded");
                Ok(sandbox)
            }
            Err(e) => {
                warn!(id = %sandbox.id, error = %e, "Seeding failed, destroying sandbox");
                self.destroy(sandbox.id);
                Err(e)
            }
        }
    }
}

struct Seeder<'a> {
    registry: &'a SandboxRegistry,
    workspace: &'a Path,
    cancel: &'a CancelToken,
}

impl Seeder<'_> {
    fn apply(&self, seed: &RepoSeed) -> Result<(), SandboxError> {
        let initial = seed.initial_branch();
        self.git(&["init", "--quiet"])?;
        self.git(&["symbolic-ref", "HEAD", &format!("refs/heads/{initial}")])?;

        let mut current = initial.to_string();
        let mut existing: BTreeSet<String> = BTreeSet::new();

        for commit in &seed.commits {
            if let Some(branch) = commit.branch.as_deref().filter(|b| *b != current) {
                if existing.contains(branch) {
                    self.git(&["checkout", "--quiet", branch])?;
                } else {
                    self.git(&["checkout", "--quiet", "-b", branch])?;
                }
                current = branch.to_string();
            }

            if commit.files.is_empty() {
                self.append_readme(&commit.message)?;
            } else {
                for (path, content) in &commit.files {
                    self.write_file(path, content)?;
                }
            }

            self.git(&["add", "--all"])?;
            self.git(&["commit", "--quiet", "--allow-empty", "-m", &commit.message])?;
            existing.insert(current.clone());
        }

        for branch in &seed.branches {
            if !existing.contains(branch) {
                self.git(&["branch", branch])?;
                existing.insert(branch.clone());
            }
        }

        if let Some(target) = seed.current_branch.as_deref().filter(|b| *b != current) {
            if existing.contains(target) {
                self.git(&["checkout", "--quiet", target])?;
            } else {
                self.git(&["checkout", "--quiet", "-b", target])?;
            }
        }

        Ok(())
    }

    fn git(&self, args: &[&str]) -> Result<(), SandboxError> {
        let invocation = Invocation::new(Program::Git, args.iter().copied(), self.workspace);
        let result = self.registry.runner.run(&invocation, self.cancel)?;
        if result.success() {
            Ok(())
        } else {
            Err(SandboxError::Seed {
                reason: format!("`{}` failed: {}", invocation.raw, result.stderr_text().trim()),
            })
        }
    }

    fn target(&self, relative: &str) -> PathBuf {
        self.workspace.join(relative)
    }

    fn write_file(&self, relative: &str, content: &str) -> Result<(), SandboxError> {
        let path = self.target(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| seed_io(relative, &e))?;
        }
        fs::write(&path, content).map_err(|e| seed_io(relative, &e))
    }

    fn append_readme(&self, message: &str) -> Result<(), SandboxError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.target(README))
            .map_err(|e| seed_io(README, &e))?;
        writeln!(file, "\n{message}").map_err(|e| seed_io(README, &e))
    }
}

fn seed_io(path: &str, err: &std::io::Error) -> SandboxError {
    SandboxError::Seed {
        reason: format!("cannot write {path}: {err}"),
    }
}
