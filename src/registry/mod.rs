//! Sandbox registry: the only entry point callers use.
//!
//! The registry owns the map from sandbox id to metadata and mediates every
//! access to workspaces, the validator and the runner. It is constructed once
//! at startup and shared by reference (`Arc<SandboxRegistry>`) with request
//! handlers and the reaper.
//!
//! # Locking
//!
//! - the map lock is held only for lookups, inserts, removals and quota counts;
//!   workspace allocation happens outside it against a quota reservation
//! - each sandbox has its own exec lock; `execute` takes it with `try_lock`,
//!   so a concurrent call on the same sandbox fails with `Busy` while other
//!   sandboxes run fully in parallel
//! - the map lock is always taken before a sandbox's metadata lock or the
//!   reservation table, never after
//!
//! # Example
//!
//! ```no_run
//! use command_sandbox::config::EngineConfig;
//! use command_sandbox::registry::SandboxRegistry;
//!
//! let registry = SandboxRegistry::open(&EngineConfig::default()).unwrap();
//!
//! let sandbox = registry.create("player-1", Some("intro")).unwrap();
//! registry.execute(sandbox.id, "git init").unwrap();
//! let result = registry.execute(sandbox.id, "git status").unwrap();
//! println!("{}", result.stdout_text());
//!
//! registry.destroy(sandbox.id);
//! ```

mod lifecycle;
mod meta;
mod repo;
mod seed;

pub use lifecycle::HealthReport;
pub use meta::{HistoryEntry, Sandbox, SandboxId, SandboxSnapshot, SandboxStatus};
pub use repo::{CommitSummary, RECENT_COMMITS, RepoState};
pub use seed::{DEFAULT_BRANCH, RepoSeed, SeedCommit};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::command::{CommandValidator, Validated};
use crate::config::EngineConfig;
use crate::error::SandboxError;
use crate::sandbox::{CancelToken, CommandResult, CommandRunner, Invocation, ProcessRunner};
use crate::workspace::WorkspaceStore;

/// Registry entry for one sandbox.
#[derive(Debug)]
struct SandboxSlot {
    meta: Mutex<Sandbox>,
    exec: Mutex<()>,
    cancel: CancelToken,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl SandboxSlot {
    fn new(sandbox: Sandbox) -> Self {
        Self {
            meta: Mutex::new(sandbox),
            exec: Mutex::new(()),
            cancel: CancelToken::new(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn meta(&self) -> MutexGuard<'_, Sandbox> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn history(&self) -> MutexGuard<'_, VecDeque<HistoryEntry>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the exec lock without waiting; `None` if a command is running.
    fn try_exec(&self) -> Option<MutexGuard<'_, ()>> {
        match self.exec.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Waits for any in-flight command to finish.
    fn wait_exec(&self) -> MutexGuard<'_, ()> {
        self.exec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_busy(&self) -> bool {
        matches!(self.exec.try_lock(), Err(TryLockError::WouldBlock))
    }

    fn record(&self, result: &CommandResult, limit: usize) {
        if limit == 0 {
            return;
        }
        let mut history = self.history();
        while history.len() >= limit {
            history.pop_front();
        }
        history.push_back(HistoryEntry::from(result));
    }
}

/// Creates, locates, serializes access to, and destroys sandboxes.
pub struct SandboxRegistry {
    config: EngineConfig,
    store: WorkspaceStore,
    validator: CommandValidator,
    runner: Arc<dyn CommandRunner>,
    sandboxes: Mutex<HashMap<SandboxId, Arc<SandboxSlot>>>,
    /// Creations per owner that passed the quota check but are not inserted yet.
    reservations: Mutex<HashMap<String, usize>>,
}

/// A quota slot held while a workspace is allocated; released on drop.
struct Reservation<'a> {
    table: &'a Mutex<HashMap<String, usize>>,
    owner: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = table.get_mut(&self.owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                table.remove(&self.owner);
            }
        }
    }
}

impl SandboxRegistry {
    /// Opens a registry that runs commands as real processes.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Allocation` if the workspace root is unusable.
    pub fn open(config: &EngineConfig) -> Result<Self, SandboxError> {
        let runner = Arc::new(ProcessRunner::new(config.runner_config()));
        Self::with_runner(config.clone(), runner)
    }

    /// Opens a registry with a custom runner.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::Allocation` if the workspace root is unusable.
    #[instrument(skip_all, fields(root = %config.workspace_root.display()))]
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, SandboxError> {
        let store = WorkspaceStore::open(&config.workspace_root, config.workspace_limits())?;
        let validator = CommandValidator::new(config.policy.clone());

        debug!(
            quota = config.max_sandboxes_per_owner,
            timeout_ms = %config.command_timeout.as_millis(),
            "Sandbox registry opened"
        );

        Ok(Self {
            config,
            store,
            validator,
            runner,
            sandboxes: Mutex::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
        })
    }

    /// Returns a reference to the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the workspace store.
    #[must_use]
    pub fn store(&self) -> &WorkspaceStore {
        &self.store
    }

    /// Creates an empty sandbox for `owner`.
    ///
    /// # Errors
    ///
    /// - `QuotaExceeded` if the owner already holds the maximum
    /// - `Allocation` if no workspace can be allocated
    #[instrument(skip(self))]
    pub fn create(&self, owner: &str, lesson_id: Option<&str>) -> Result<Sandbox, SandboxError> {
        self.insert(owner, lesson_id, true)
    }

    pub(crate) fn insert(
        &self,
        owner: &str,
        lesson_id: Option<&str>,
        enforce_quota: bool,
    ) -> Result<Sandbox, SandboxError> {
        let _reservation = if enforce_quota {
            Some(self.reserve(owner)?)
        } else {
            None
        };

        let id = Uuid::new_v4();
        let workspace = self.store.allocate(id).inspect_err(|e| {
            error!(error = %e, "Workspace allocation failed");
        })?;

        let sandbox = Sandbox::new(id, owner, lesson_id.map(str::to_string), workspace);
        self.sandboxes()
            .insert(id, Arc::new(SandboxSlot::new(sandbox.clone())));

        info!(%id, workspace = %sandbox.workspace.display(), "Sandbox created");
        Ok(sandbox)
    }

    /// Counts live and pending sandboxes for `owner` and claims one more.
    ///
    /// The reservation is released when dropped, after the sandbox is in
    /// the map or allocation has failed.
    fn reserve(&self, owner: &str) -> Result<Reservation<'_>, SandboxError> {
        let sandboxes = self.sandboxes();
        let mut reservations = self.reservations.lock().unwrap_or_else(PoisonError::into_inner);

        let limit = self.config.max_sandboxes_per_owner;
        let live = sandboxes
            .values()
            .filter(|slot| slot.meta().owner == owner)
            .count();
        let pending = reservations.get(owner).copied().unwrap_or(0);
        if live + pending >= limit {
            debug!(live, pending, limit, "Sandbox quota reached");
            return Err(SandboxError::QuotaExceeded {
                owner: owner.to_string(),
                limit,
            });
        }

        *reservations.entry(owner.to_string()).or_insert(0) += 1;
        Ok(Reservation {
            table: &self.reservations,
            owner: owner.to_string(),
        })
    }

    /// Validates and runs one line of player input.
    ///
    /// Blank input returns a "nothing executed" result without touching the
    /// sandbox. A rejected command never reaches the runner and does not
    /// update last-activity.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the sandbox is unknown or no longer active
    /// - `Busy` if another command is running in this sandbox
    /// - `Rejected` if the validator refuses the input
    /// - `Spawn` if the process could not be started
    #[instrument(skip(self, raw), fields(%id))]
    pub fn execute(&self, id: SandboxId, raw: &str) -> Result<CommandResult, SandboxError> {
        let slot = self.slot(id)?;
        let Some(_exec) = slot.try_exec() else {
            debug!("Sandbox busy, rejecting command");
            return Err(SandboxError::Busy { id: id.to_string() });
        };

        let (workspace, lesson) = {
            let meta = slot.meta();
            if !meta.is_active() {
                return Err(SandboxError::NotFound { id: id.to_string() });
            }
            (meta.workspace.clone(), meta.lesson_id.clone())
        };

        let command = match self.validator.validate(raw, lesson.as_deref()) {
            Ok(Validated::Empty) => return Ok(CommandResult::nothing_executed(raw.trim())),
            Ok(Validated::Command(command)) => command,
            Err(e) => {
                debug!(code = e.code(), "Command rejected");
                return Err(e.into());
            }
        };

        let invocation = Invocation::from_validated(command, workspace);
        let result = self.runner.run(&invocation, &slot.cancel).inspect_err(|e| {
            error!(error = %e, program = %invocation.program, "Command could not be started");
        })?;

        slot.meta().touch();
        slot.record(&result, self.config.history_len);

        debug!(
            program = %invocation.program,
            success = result.success(),
            termination = ?result.termination,
            "Command executed"
        );
        Ok(result)
    }

    /// Returns metadata, busy flag and recent history.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the sandbox is unknown or gone.
    pub fn status(&self, id: SandboxId) -> Result<SandboxSnapshot, SandboxError> {
        let slot = self.slot(id)?;
        let sandbox = slot.meta().clone();
        Ok(SandboxSnapshot {
            sandbox,
            busy: slot.is_busy(),
            history: slot.history().iter().cloned().collect(),
        })
    }

    /// Destroys a sandbox, terminating any in-flight command first.
    ///
    /// Returns true if this call destroyed it, false if it was already gone.
    #[instrument(skip(self), fields(%id))]
    pub fn destroy(&self, id: SandboxId) -> bool {
        let Some(slot) = self.sandboxes().remove(&id) else {
            debug!("Sandbox already gone");
            return false;
        };

        self.teardown(&slot, SandboxStatus::Destroyed);
        info!("Sandbox destroyed");
        true
    }

    /// Marks a removed slot terminal, stops its command and reclaims its workspace.
    fn teardown(&self, slot: &SandboxSlot, status: SandboxStatus) {
        slot.meta().finish(status);
        slot.cancel.cancel();

        // The runner observes the cancel token and reaps the process group
        let _exec = slot.wait_exec();

        let workspace = slot.meta().workspace.clone();
        if !self.store.reclaim(&workspace) {
            warn!(workspace = %workspace.display(), "Workspace was not reclaimed");
        }
    }

    /// Number of live sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sandboxes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live sandboxes owned by `owner`.
    #[must_use]
    pub fn sandboxes_for(&self, owner: &str) -> Vec<Sandbox> {
        self.sandboxes()
            .values()
            .map(|slot| slot.meta().clone())
            .filter(|sandbox| sandbox.owner == owner)
            .collect()
    }

    fn slot(&self, id: SandboxId) -> Result<Arc<SandboxSlot>, SandboxError> {
        self.sandboxes()
            .get(&id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound { id: id.to_string() })
    }

    fn sandboxes(&self) -> MutexGuard<'_, HashMap<SandboxId, Arc<SandboxSlot>>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRegistry")
            .field("root", &self.store.root())
            .field("sandboxes", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Program;
    use crate::error::{RunnerError, ValidationError};
    use crate::sandbox::Termination;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records invocations and echoes the command back as output.
    #[derive(Default)]
    struct EchoRunner {
        calls: AtomicUsize,
    }

    impl CommandRunner for EchoRunner {
        fn run(&self, invocation: &Invocation, _cancel: &CancelToken) -> Result<CommandResult, RunnerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandResult {
                program: Some(invocation.program),
                args: invocation.args.clone(),
                stdout: invocation.raw.clone().into_bytes(),
                exit_code: Some(0),
                termination: Termination::Exited,
                duration: Duration::from_millis(3),
                ..CommandResult::nothing_executed(invocation.raw.clone())
            })
        }

        fn runtime_present(&self, _program: Program) -> bool {
            true
        }
    }

    fn registry(config: EngineConfig) -> (TempDir, Arc<EchoRunner>, SandboxRegistry) {
        let temp = TempDir::new().expect("failed to create temp dir");
        let runner = Arc::new(EchoRunner::default());
        let registry = SandboxRegistry::with_runner(
            config.with_workspace_root(temp.path().join("root")),
            runner.clone(),
        )
        .expect("open registry");
        (temp, runner, registry)
    }

    #[test]
    fn test_create_allocates_disjoint_workspaces() {
        let (_temp, _runner, registry) = registry(EngineConfig::default());

        let a = registry.create("alice", None).unwrap();
        let b = registry.create("bob", Some("intro")).unwrap();

        assert_ne!(a.workspace, b.workspace);
        assert!(a.workspace.is_dir() && b.workspace.is_dir());
        assert!(!a.workspace.starts_with(&b.workspace));
        assert_eq!(b.lesson_id.as_deref(), Some("intro"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_quota_per_owner() {
        let (_temp, _runner, registry) =
            registry(EngineConfig::default().with_max_sandboxes_per_owner(2));

        registry.create("alice", None).unwrap();
        let second = registry.create("alice", None).unwrap();
        let err = registry.create("alice", None).unwrap_err();
        assert!(matches!(err, SandboxError::QuotaExceeded { limit: 2, .. }));

        // Other owners are unaffected, and destroying frees a slot
        registry.create("bob", None).unwrap();
        assert!(registry.destroy(second.id));
        registry.create("alice", None).unwrap();
        assert_eq!(registry.sandboxes_for("alice").len(), 2);
    }

    #[test]
    fn test_concurrent_creates_respect_quota() {
        let (_temp, _runner, registry) =
            registry(EngineConfig::default().with_max_sandboxes_per_owner(3));
        let start = std::sync::Barrier::new(8);

        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        start.wait();
                        registry.create("alice", None)
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let created = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(created, 3);
        assert!(outcomes.iter().all(|o| matches!(
            o,
            Ok(_) | Err(SandboxError::QuotaExceeded { limit: 3, .. })
        )));
        assert_eq!(registry.sandboxes_for("alice").len(), 3);
        assert!(registry.reservations.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_allocation_releases_reservation() {
        let (_temp, _runner, registry) = registry(
            EngineConfig::default()
                .with_max_sandboxes_per_owner(1)
                .with_max_workspaces(1),
        );
        let held = registry.create("bob", None).unwrap();

        let err = registry.create("alice", None).unwrap_err();
        assert!(matches!(err, SandboxError::Allocation(_)), "{err:?}");
        assert!(registry.reservations.lock().unwrap().is_empty());

        // The failed attempt did not use up alice's quota
        registry.destroy(held.id);
        registry.create("alice", None).unwrap();
    }

    #[test]
    fn test_execute_records_history_and_activity() {
        let (_temp, runner, registry) = registry(EngineConfig::default().with_history_len(2));
        let sb = registry.create("alice", None).unwrap();

        for line in ["git init", "git status", "ls"] {
            let result = registry.execute(sb.id, line).unwrap();
            assert!(result.success());
        }

        let snapshot = registry.status(sb.id).unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert!(snapshot.sandbox.last_activity_at >= sb.last_activity_at);
        let commands: Vec<_> = snapshot.history.iter().map(|h| h.command.as_str()).collect();
        assert_eq!(commands, vec!["git status", "ls"]);
        assert!(!snapshot.busy);
    }

    #[test]
    fn test_rejected_command_never_runs() {
        let (_temp, runner, registry) = registry(EngineConfig::default());
        let sb = registry.create("alice", None).unwrap();

        for line in ["ls | wc", "git status; rm -rf /", "echo $(id)", "python -c 1"] {
            assert!(registry.execute(sb.id, line).is_err(), "{line}");
        }

        let err = registry.execute(sb.id, "curl example.com").unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Rejected(ValidationError::CommandNotAllowed { .. })
        ));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        let snapshot = registry.status(sb.id).unwrap();
        assert_eq!(snapshot.sandbox.last_activity_at, sb.last_activity_at);
        assert!(snapshot.history.is_empty());
    }

    #[test]
    fn test_blank_input_is_a_no_op() {
        let (_temp, runner, registry) = registry(EngineConfig::default());
        let sb = registry.create("alice", None).unwrap();

        let result = registry.execute(sb.id, "   ").unwrap();
        assert!(!result.executed());
        assert_eq!(result.termination, Termination::NotRun);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (_temp, _runner, registry) = registry(EngineConfig::default());
        let sb = registry.create("alice", None).unwrap();

        assert!(registry.destroy(sb.id));
        assert!(!sb.workspace.exists());
        assert!(!registry.destroy(sb.id));

        assert!(matches!(
            registry.execute(sb.id, "ls"),
            Err(SandboxError::NotFound { .. })
        ));
        assert!(matches!(registry.status(sb.id), Err(SandboxError::NotFound { .. })));
    }

    #[test]
    fn test_unknown_sandbox() {
        let (_temp, _runner, registry) = registry(EngineConfig::default());
        let err = registry.execute(Uuid::new_v4(), "ls").unwrap_err();
        assert!(matches!(err, SandboxError::NotFound { .. }));
    }
}
