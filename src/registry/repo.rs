//! Read-only view of the repository inside a sandbox.
//!
//! Lesson checks ask "which branch is the player on, what does the log look
//! like, is the tree clean" without replaying the player's own commands.
//! Queries run the real git binary through the runner under the sandbox's
//! exec lock, so they never observe a half-finished player command. They do
//! not count as player activity and are not recorded in history.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{SandboxId, SandboxRegistry};
use crate::command::Program;
use crate::error::SandboxError;
use crate::sandbox::{CancelToken, CommandResult, Invocation};

/// Commits included in [`RepoState::recent_commits`].
pub const RECENT_COMMITS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Abbreviated hash.
    pub hash: String,
    pub subject: String,
}

/// Snapshot of a sandbox's repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    /// False until the player runs `git init` (or the sandbox is seeded).
    pub is_repository: bool,

    /// Checked-out branch; `None` when detached or not a repository.
    pub current_branch: Option<String>,

    /// HEAD points at a commit rather than a branch.
    pub detached: bool,

    /// Local branches, sorted by name.
    pub branches: Vec<String>,

    /// Newest first, at most [`RECENT_COMMITS`].
    pub recent_commits: Vec<CommitSummary>,

    /// `git status --porcelain` lines.
    pub status: Vec<String>,

    /// No staged, unstaged or untracked changes.
    pub clean: bool,
}

impl SandboxRegistry {
    /// Reads the repository state of a sandbox.
    ///
    /// A workspace without a repository yields a default state with
    /// `is_repository` false.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the sandbox is unknown or no longer active
    /// - `Busy` if a command is running in this sandbox
    /// - `Spawn` if git cannot be started
    #[instrument(skip(self), fields(%id))]
    pub fn repository(&self, id: SandboxId) -> Result<RepoState, SandboxError> {
        let slot = self.slot(id)?;
        let Some(_exec) = slot.try_exec() else {
            return Err(SandboxError::Busy { id: id.to_string() });
        };

        let workspace = {
            let meta = slot.meta();
            if !meta.is_active() {
                return Err(SandboxError::NotFound { id: id.to_string() });
            }
            meta.workspace.clone()
        };

        let state = RepoReader {
            registry: self,
            workspace: &workspace,
            cancel: &slot.cancel,
        }
        .read()?;

        debug!(
            is_repository = state.is_repository,
            branch = ?state.current_branch,
            clean = state.clean,
            "Repository state read"
        );
        Ok(state)
    }
}

struct RepoReader<'a> {
    registry: &'a SandboxRegistry,
    workspace: &'a Path,
    cancel: &'a CancelToken,
}

impl RepoReader<'_> {
    fn read(&self) -> Result<RepoState, SandboxError> {
        let inside = self.git(&["rev-parse", "--is-inside-work-tree"])?;
        if !inside.success() || inside.stdout_text().trim() != "true" {
            return Ok(RepoState::default());
        }

        // Fails on a detached HEAD
        let head = self.git(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        let current_branch = head
            .success()
            .then(|| head.stdout_text().trim().to_string())
            .filter(|branch| !branch.is_empty());

        let refs = self.git(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        let branches = if refs.success() {
            parse_lines(&refs.stdout_text())
        } else {
            Vec::new()
        };

        // Fails on an unborn branch
        let max_count = format!("--max-count={RECENT_COMMITS}");
        let log = self.git(&["log", &max_count, "--format=%h%x09%s"])?;
        let recent_commits = if log.success() {
            parse_log(&log.stdout_text())
        } else {
            Vec::new()
        };

        let porcelain = self.git(&["--no-optional-locks", "status", "--porcelain"])?;
        let status = if porcelain.success() {
            parse_lines(&porcelain.stdout_text())
        } else {
            Vec::new()
        };

        Ok(RepoState {
            is_repository: true,
            detached: current_branch.is_none(),
            current_branch,
            branches,
            recent_commits,
            clean: porcelain.success() && status.is_empty(),
            status,
        })
    }

    fn git(&self, args: &[&str]) -> Result<CommandResult, SandboxError> {
        let invocation = Invocation::new(Program::Git, args.iter().copied(), self.workspace);
        Ok(self.registry.runner.run(&invocation, self.cancel)?)
    }
}

fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_log(output: &str) -> Vec<CommitSummary> {
    output
        .lines()
        .filter_map(|line| {
            let (hash, subject) = line.split_once('\t')?;
            Some(CommitSummary {
                hash: hash.to_string(),
                subject: subject.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::RunnerError;
    use crate::sandbox::{CommandRunner, Termination};

    /// Answers git queries from a table keyed by the first non-option argument.
    struct ScriptedGit {
        replies: HashMap<&'static str, (i32, &'static str)>,
    }

    impl CommandRunner for ScriptedGit {
        fn run(&self, invocation: &Invocation, _cancel: &CancelToken) -> Result<CommandResult, RunnerError> {
            let subcommand = invocation
                .args
                .iter()
                .find(|arg| !arg.starts_with('-'))
                .map_or("", String::as_str);
            let (code, stdout) = self.replies.get(subcommand).copied().unwrap_or((0, ""));
            Ok(CommandResult {
                program: Some(invocation.program),
                stdout: stdout.as_bytes().to_vec(),
                exit_code: Some(code),
                termination: Termination::Exited,
                ..CommandResult::nothing_executed(invocation.raw.clone())
            })
        }

        fn runtime_present(&self, _program: Program) -> bool {
            true
        }
    }

    fn registry(replies: &[(&'static str, (i32, &'static str))]) -> (TempDir, SandboxRegistry) {
        let temp = TempDir::new().expect("failed to create temp dir");
        let runner = ScriptedGit {
            replies: replies.iter().copied().collect(),
        };
        let registry = SandboxRegistry::with_runner(
            EngineConfig::default().with_workspace_root(temp.path().join("root")),
            Arc::new(runner),
        )
        .expect("open registry");
        (temp, registry)
    }

    #[test]
    fn test_parse_log() {
        let commits = parse_log("a1b2c3d\tAdd feature\n0f0f0f0\tInitial commit\tsecond tab\n\n");
        assert_eq!(
            commits,
            vec![
                CommitSummary {
                    hash: "a1b2c3d".into(),
                    subject: "Add feature".into(),
                },
                CommitSummary {
                    hash: "0f0f0f0".into(),
                    subject: "Initial commit\tsecond tab".into(),
                },
            ]
        );
    }

    #[test]
    fn test_status_lines_keep_leading_space() {
        assert_eq!(parse_lines(" M README.md\n?? new.txt\n"), [" M README.md", "?? new.txt"]);
    }

    #[test]
    fn test_not_a_repository() {
        let (_temp, registry) = registry(&[("rev-parse", (128, ""))]);
        let sb = registry.create("alice", None).unwrap();

        assert_eq!(registry.repository(sb.id).unwrap(), RepoState::default());
    }

    #[test]
    fn test_repository_state() {
        let (_temp, registry) = registry(&[
            ("rev-parse", (0, "true\n")),
            ("symbolic-ref", (0, "main\n")),
            ("for-each-ref", (0, "feature\nmain\n")),
            ("log", (0, "a1b2c3d\tSecond\n0f0f0f0\tFirst\n")),
            ("status", (0, "?? notes.txt\n")),
        ]);
        let sb = registry.create("alice", None).unwrap();

        let state = registry.repository(sb.id).unwrap();
        assert!(state.is_repository);
        assert_eq!(state.current_branch.as_deref(), Some("main"));
        assert!(!state.detached);
        assert_eq!(state.branches, ["feature", "main"]);
        assert_eq!(state.recent_commits.len(), 2);
        assert_eq!(state.recent_commits[0].subject, "Second");
        assert_eq!(state.status, ["?? notes.txt"]);
        assert!(!state.clean);
    }

    #[test]
    fn test_detached_head_and_unborn_branch() {
        let (_temp, registry) = registry(&[
            ("rev-parse", (0, "true\n")),
            ("symbolic-ref", (1, "")),
            ("log", (128, "")),
        ]);
        let sb = registry.create("alice", None).unwrap();

        let state = registry.repository(sb.id).unwrap();
        assert!(state.detached);
        assert_eq!(state.current_branch, None);
        assert!(state.recent_commits.is_empty());
        assert!(state.clean);
    }

    #[test]
    fn test_query_is_not_player_activity() {
        let (_temp, registry) = registry(&[("rev-parse", (0, "true\n"))]);
        let sb = registry.create("alice", None).unwrap();

        registry.repository(sb.id).unwrap();

        let snapshot = registry.status(sb.id).unwrap();
        assert_eq!(snapshot.sandbox.last_activity_at, sb.last_activity_at);
        assert!(snapshot.history.is_empty());
    }

    #[test]
    fn test_busy_sandbox_is_not_read() {
        let (_temp, registry) = registry(&[]);
        let sb = registry.create("alice", None).unwrap();
        let slot = registry.slot(sb.id).unwrap();

        let exec = slot.try_exec().expect("not busy");
        assert!(matches!(registry.repository(sb.id), Err(SandboxError::Busy { .. })));
        drop(exec);

        assert!(registry.repository(sb.id).is_ok());
    }
}
