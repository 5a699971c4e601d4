//! Bounded execution of one validated command.
//!
//! # Process model
//!
//! Every command is spawned directly (never through a shell) into its own
//! process group with a cleared environment, the sandbox workspace as its
//! working directory and stdin closed. The runner then polls for exit with
//! millisecond precision:
//!
//! - on deadline or cancellation the whole group is sent SIGKILL
//! - the group is signalled only before its leader is reaped, since a reaped
//!   pgid can be reused; git is configured not to detach background work
//! - the child is always reaped, including when the runner unwinds
//!
//! stdout/stderr are drained concurrently (see [`super::output`]) so a chatty
//! child cannot deadlock on a full pipe.

use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use super::RunnerConfig;
use super::output::{DRAIN_GRACE, StreamReader};
use crate::command::{Program, ValidatedCommand};
use crate::error::RunnerError;
use crate::system::find_program;

/// Interval between exit checks.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Identity used for commits made inside sandboxes.
const PLAYER_NAME: &str = "Git Quest Player";
const PLAYER_EMAIL: &str = "player@gitquest.local";

/// Git configuration forced through the environment.
///
/// Environment-provided config outranks every config file, including a
/// repository's own `.git/config`.
const FORCED_GIT_CONFIG: &[(&str, &str)] = &[
    ("core.hooksPath", "/dev/null"),
    ("core.fsmonitor", "false"),
    ("core.pager", "cat"),
    ("core.editor", ":"),
    ("sequence.editor", ":"),
    ("credential.helper", ""),
    ("core.symlinks", "false"),
    ("gc.autoDetach", "false"),
];

/// A command ready to run in a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Resolved program.
    pub program: Program,
    /// Arguments, passed verbatim.
    pub args: Vec<String>,
    /// The line the player typed, for reporting.
    pub raw: String,
    /// Workspace the command runs in.
    pub working_dir: PathBuf,
}

impl Invocation {
    /// Builds an invocation from explicit parts.
    pub fn new<I, S>(program: Program, args: I, working_dir: impl Into<PathBuf>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let raw = std::iter::once(program.name().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            program,
            args,
            raw,
            working_dir: working_dir.into(),
        }
    }

    /// Builds an invocation from a command that passed validation.
    pub fn from_validated(command: ValidatedCommand, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: command.program,
            args: command.args,
            raw: command.raw,
            working_dir: working_dir.into(),
        }
    }
}

/// Shared flag asking an in-flight command to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Irreversible.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process exited on its own (or died of a signal it raised).
    Exited,
    /// The time budget elapsed and the process group was killed.
    TimedOut,
    /// The sandbox was destroyed while the command ran.
    Cancelled,
    /// Nothing was executed (blank input).
    NotRun,
}

/// Outcome of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// The command line as typed.
    pub command: String,
    /// Program that ran, if any.
    pub program: Option<Program>,
    /// Arguments passed.
    pub args: Vec<String>,
    /// Captured standard output, capped.
    pub stdout: Vec<u8>,
    /// Captured standard error, capped.
    pub stderr: Vec<u8>,
    /// Exit code; `None` when killed by a signal or not run.
    pub exit_code: Option<i32>,
    /// Process id of the child, which also led its process group.
    pub pid: Option<u32>,
    /// Wall-clock time from spawn to reap.
    pub duration: Duration,
    /// How the command ended.
    pub termination: Termination,
    /// Output beyond the cap was discarded from stdout.
    pub stdout_truncated: bool,
    /// Output beyond the cap was discarded from stderr.
    pub stderr_truncated: bool,
}

impl CommandResult {
    /// Result for blank input.
    #[must_use]
    pub fn nothing_executed(raw: impl Into<String>) -> Self {
        Self {
            command: raw.into(),
            program: None,
            args: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            pid: None,
            duration: Duration::ZERO,
            termination: Termination::NotRun,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    /// True iff the process exited on its own with status 0.
    ///
    /// Truncation does not affect success.
    #[must_use]
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    /// Whether a process was started.
    #[must_use]
    pub fn executed(&self) -> bool {
        self.termination != Termination::NotRun
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    /// Either stream was truncated.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }

    /// Standard output decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Executes invocations. Implemented by [`ProcessRunner`]; tests substitute stubs.
pub trait CommandRunner: Send + Sync {
    /// Runs one invocation to completion, timeout or cancellation.
    ///
    /// # Errors
    ///
    /// Only environmental failures are errors; a non-zero exit or a timeout
    /// is reported in the returned [`CommandResult`].
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<CommandResult, RunnerError>;

    /// Whether the executable for `program` is available.
    fn runtime_present(&self, program: Program) -> bool;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    /// Creates a runner with the given configuration.
    #[must_use]
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Returns a reference to the runner configuration.
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Baseline environment. Nothing is inherited from the host.
    fn base_env(working_dir: &Path) -> Vec<(String, String)> {
        let workspace = working_dir.to_string_lossy().into_owned();
        let ceiling = working_dir
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| workspace.clone());

        let mut env = vec![
            ("PATH".to_string(), "/usr/bin:/bin:/usr/local/bin".to_string()),
            ("HOME".to_string(), workspace),
            ("LANG".to_string(), "C".to_string()),
            ("LC_ALL".to_string(), "C".to_string()),
            ("TERM".to_string(), "dumb".to_string()),
            ("PAGER".to_string(), "cat".to_string()),
            ("GIT_PAGER".to_string(), "cat".to_string()),
            ("GIT_EDITOR".to_string(), ":".to_string()),
            ("GIT_SEQUENCE_EDITOR".to_string(), ":".to_string()),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
            ("GIT_CONFIG_NOSYSTEM".to_string(), "1".to_string()),
            ("GIT_CEILING_DIRECTORIES".to_string(), ceiling),
            ("GIT_AUTHOR_NAME".to_string(), PLAYER_NAME.to_string()),
            ("GIT_AUTHOR_EMAIL".to_string(), PLAYER_EMAIL.to_string()),
            ("GIT_COMMITTER_NAME".to_string(), PLAYER_NAME.to_string()),
            ("GIT_COMMITTER_EMAIL".to_string(), PLAYER_EMAIL.to_string()),
            ("GIT_CONFIG_COUNT".to_string(), FORCED_GIT_CONFIG.len().to_string()),
        ];

        for (i, (key, value)) in FORCED_GIT_CONFIG.iter().enumerate() {
            env.push((format!("GIT_CONFIG_KEY_{i}"), (*key).to_string()));
            env.push((format!("GIT_CONFIG_VALUE_{i}"), (*value).to_string()));
        }

        env
    }
}

impl CommandRunner for ProcessRunner {
    #[instrument(
        skip(self, invocation, cancel),
        fields(program = %invocation.program, timeout_ms = %self.config.timeout.as_millis())
    )]
    fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<CommandResult, RunnerError> {
        let working_dir = &invocation.working_dir;
        if !working_dir.is_dir() {
            return Err(RunnerError::WorkspaceMissing {
                path: working_dir.clone(),
            });
        }

        let program = invocation.program.name();
        let executable = find_program(program, &self.config.search_path).ok_or_else(|| {
            RunnerError::ProgramNotFound {
                program: program.to_string(),
            }
        })?;
        trace!(resolved = %executable.display(), "Resolved program path");

        let mut cmd = Command::new(&executable);
        cmd.args(&invocation.args)
            .current_dir(working_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        // Defaults first; configured variables override them
        for (key, value) in Self::base_env(working_dir) {
            cmd.env(key, value);
        }
        for (key, value) in &self.config.env_vars {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| RunnerError::SpawnFailed {
            program: program.to_string(),
            source: e,
        })?;
        let mut guard = ChildGuard::new(child);
        let pid = guard.child.id();

        let limit = self.config.output_limit;
        let stdout = StreamReader::spawn("stdout", guard.child.stdout.take(), limit);
        let stderr = StreamReader::spawn("stderr", guard.child.stderr.take(), limit);

        let (termination, status) = loop {
            match guard.child.try_wait() {
                Ok(Some(status)) => {
                    guard.reaped = true;
                    break (Termination::Exited, Some(status));
                }
                Ok(None) => {
                    if cancel.is_cancelled() {
                        debug!("Command cancelled, killing process group");
                        break (Termination::Cancelled, guard.kill_and_reap());
                    }
                    if start.elapsed() >= self.config.timeout {
                        debug!(elapsed_ms = %start.elapsed().as_millis(), "Command timed out, killing process group");
                        break (Termination::TimedOut, guard.kill_and_reap());
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(RunnerError::WaitFailed {
                        program: program.to_string(),
                        source: e,
                    });
                }
            }
        };

        // Past this point the pgid may be recycled, so the group is never signalled
        let drain_deadline = Instant::now() + DRAIN_GRACE;
        let stdout = stdout.finish(drain_deadline);
        let stderr = stderr.finish(drain_deadline);
        let duration = start.elapsed();

        let exit_code = status.and_then(|s| s.code());
        debug!(
            ?exit_code,
            ?termination,
            elapsed_ms = %duration.as_millis(),
            stdout_bytes = stdout.total,
            stderr_bytes = stderr.total,
            "Command completed"
        );

        Ok(CommandResult {
            command: invocation.raw.clone(),
            program: Some(invocation.program),
            args: invocation.args.clone(),
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            exit_code,
            pid: Some(pid),
            duration,
            termination,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
        })
    }

    fn runtime_present(&self, program: Program) -> bool {
        find_program(program.name(), &self.config.search_path).is_some()
    }
}

/// Owns a spawned child; killing and reaping it on every exit path.
struct ChildGuard {
    child: Child,
    pgid: Pid,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        // The child leads its own group, so its pid is the group id
        #[allow(clippy::cast_possible_wrap)]
        let pgid = Pid::from_raw(child.id() as i32);
        Self {
            child,
            pgid,
            reaped: false,
        }
    }

    fn kill_group(&self) {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = %self.pgid, error = %e, "Failed to kill process group"),
        }
    }

    fn kill_and_reap(&mut self) -> Option<ExitStatus> {
        self.kill_group();
        match self.child.wait() {
            Ok(status) => {
                self.reaped = true;
                Some(status)
            }
            Err(e) => {
                warn!(error = %e, "Failed to reap killed child");
                None
            }
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl fmt::Debug for ChildGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildGuard")
            .field("pid", &self.child.id())
            .field("reaped", &self.reaped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn result(termination: Termination, exit_code: Option<i32>) -> CommandResult {
        CommandResult {
            termination,
            exit_code,
            ..CommandResult::nothing_executed("ls")
        }
    }

    #[test]
    fn test_success_requires_clean_exit() {
        assert!(result(Termination::Exited, Some(0)).success());
        assert!(!result(Termination::Exited, Some(1)).success());
        assert!(!result(Termination::TimedOut, None).success());
        assert!(!result(Termination::Cancelled, None).success());
        assert!(!CommandResult::nothing_executed("").success());
    }

    #[test]
    fn test_truncation_is_independent_of_success() {
        let mut r = result(Termination::Exited, Some(0));
        r.stdout_truncated = true;
        assert!(r.success());
        assert!(r.truncated());
    }

    #[test]
    fn test_invocation_raw_line() {
        let inv = Invocation::new(Program::Git, ["commit", "-m", "msg"], "/tmp");
        assert_eq!(inv.raw, "git commit -m msg");
        assert_eq!(inv.working_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_base_env_forces_git_config() {
        let env = ProcessRunner::base_env(Path::new("/srv/root/ws"));
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());

        assert_eq!(get("HOME").as_deref(), Some("/srv/root/ws"));
        assert_eq!(get("GIT_CEILING_DIRECTORIES").as_deref(), Some("/srv/root"));
        assert_eq!(get("GIT_CONFIG_KEY_0").as_deref(), Some("core.hooksPath"));
        assert!(
            env.iter()
                .any(|(k, v)| k.starts_with("GIT_CONFIG_KEY_") && v == "gc.autoDetach")
        );
        assert_eq!(
            get("GIT_CONFIG_COUNT"),
            Some(FORCED_GIT_CONFIG.len().to_string())
        );
    }

    #[test]
    fn test_missing_workspace_is_an_error() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let inv = Invocation::new(Program::Pwd, Vec::<String>::new(), temp.path().join("gone"));

        let err = ProcessRunner::default()
            .run(&inv, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, RunnerError::WorkspaceMissing { .. }));
    }

    #[test]
    fn test_program_not_on_search_path() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let runner = ProcessRunner::new(RunnerConfig::default().with_search_path([temp.path()]));
        let inv = Invocation::new(Program::Ls, Vec::<String>::new(), temp.path());

        assert!(!runner.runtime_present(Program::Ls));
        let err = runner.run(&inv, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, RunnerError::ProgramNotFound { .. }));
    }

    #[test]
    fn test_runs_in_workspace_with_clean_env() {
        let temp = TempDir::new().expect("failed to create temp dir");
        let runner = ProcessRunner::default();

        let out = runner
            .run(
                &Invocation::new(Program::Pwd, Vec::<String>::new(), temp.path()),
                &CancelToken::new(),
            )
            .expect("pwd should run");

        assert!(out.success());
        assert_eq!(out.termination, Termination::Exited);
        let expected = std::fs::canonicalize(temp.path()).unwrap();
        assert_eq!(
            std::fs::canonicalize(out.stdout_text().trim()).unwrap(),
            expected
        );
    }
}
