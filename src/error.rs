//! Error types for the command sandbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Each component owns its error enum; [`SandboxError`] is what callers of the
//! registry see.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application binary.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error")]
    #[diagnostic(code(sandbox::config))]
    Config(#[from] ConfigError),

    /// Host runtime requirements not met
    #[error("Runtime requirements check failed")]
    #[diagnostic(code(sandbox::requirements))]
    Requirements(#[from] RequirementsError),

    /// Workspace root could not be opened
    #[error("Workspace store error")]
    #[diagnostic(code(sandbox::workspace))]
    Workspace(#[from] WorkspaceError),

    /// HTTP server error
    #[error("HTTP server error")]
    #[diagnostic(code(sandbox::server))]
    Server(#[from] ServerError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(sandbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised while allocating or reclaiming workspaces.
#[derive(Error, Debug, Diagnostic)]
pub enum WorkspaceError {
    /// The sandbox already owns a workspace directory.
    #[error("Workspace already allocated for sandbox {id}")]
    #[diagnostic(code(sandbox::workspace::already_allocated))]
    AlreadyAllocated { id: String },

    /// Too many live workspaces under the root.
    #[error("Workspace capacity exhausted: {limit} workspaces already allocated")]
    #[diagnostic(
        code(sandbox::workspace::capacity),
        help("Raise max_workspaces or wait for the reaper to reclaim idle sandboxes")
    )]
    CapacityExceeded { limit: usize },

    /// The disk quota for the workspace root is used up.
    #[error("Disk quota for workspace root exceeded: {used} of {quota} bytes in use")]
    #[diagnostic(code(sandbox::workspace::disk_quota))]
    DiskQuotaExceeded { used: u64, quota: u64 },

    /// The configured root is unusable or a path escaped it.
    #[error("Workspace boundary violation: {0}")]
    #[diagnostic(code(sandbox::workspace::boundary))]
    BoundaryViolation(String),

    /// Filesystem operation failed
    #[error("Workspace I/O error: {context}")]
    #[diagnostic(code(sandbox::workspace::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Validator rejections. These are normal outcomes of player input.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ValidationError {
    /// Shell syntax (pipes, redirects, chaining, substitution) or malformed quoting.
    #[error("Disallowed syntax in command: {token}")]
    #[diagnostic(
        code(sandbox::validator::disallowed_syntax),
        help("Type one program with its arguments; pipes, redirects and chaining are not supported")
    )]
    DisallowedSyntax { token: String },

    /// Program is not on the allow-list.
    #[error("Command not allowed: {program}")]
    #[diagnostic(code(sandbox::validator::command_not_allowed))]
    CommandNotAllowed { program: String },

    /// Git subcommand is not permitted for this sandbox.
    #[error("Git subcommand not allowed: {subcommand}")]
    #[diagnostic(code(sandbox::validator::git_subcommand_not_allowed))]
    GitSubcommandNotAllowed { subcommand: String },

    /// Git global option before the subcommand is not permitted.
    #[error("Git option not allowed: {option}")]
    #[diagnostic(code(sandbox::validator::git_option_not_allowed))]
    GitOptionNotAllowed { option: String },

    /// A blocked argument was passed to an allowed program.
    #[error("Argument not allowed for {program}: {argument}")]
    #[diagnostic(code(sandbox::validator::argument_not_allowed))]
    ArgumentNotAllowed { program: String, argument: String },

    /// An argument names a path outside the sandbox's workspace.
    #[error("Path outside the workspace not allowed for {program}: {argument}")]
    #[diagnostic(
        code(sandbox::validator::disallowed_path),
        help("Use paths relative to the workspace, without `..`")
    )]
    DisallowedPath { program: String, argument: String },
}

impl ValidationError {
    /// Stable machine-readable code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DisallowedSyntax { .. } => "disallowed_syntax",
            Self::CommandNotAllowed { .. } => "command_not_allowed",
            Self::GitSubcommandNotAllowed { .. } => "git_subcommand_not_allowed",
            Self::GitOptionNotAllowed { .. } => "git_option_not_allowed",
            Self::ArgumentNotAllowed { .. } => "argument_not_allowed",
            Self::DisallowedPath { .. } => "disallowed_path",
        }
    }
}

/// Errors from the process runner. A non-zero exit is not an error.
#[derive(Error, Debug, Diagnostic)]
pub enum RunnerError {
    /// The working directory vanished before the command could start.
    #[error("Workspace missing: {}", path.display())]
    #[diagnostic(code(sandbox::runner::workspace_missing))]
    WorkspaceMissing { path: PathBuf },

    /// No executable for the program on the fixed search path.
    #[error("Program not found on sandbox search path: {program}")]
    #[diagnostic(
        code(sandbox::runner::program_not_found),
        help("Install the program under /usr/bin or /bin, or remove it from the allow-list")
    )]
    ProgramNotFound { program: String },

    /// The OS refused to start the process.
    #[error("Failed to spawn {program}")]
    #[diagnostic(code(sandbox::runner::spawn))]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child failed.
    #[error("Failed to wait for {program}")]
    #[diagnostic(code(sandbox::runner::wait))]
    WaitFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced by the sandbox registry to its callers.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// Workspace allocation failed.
    #[error("Workspace allocation failed")]
    #[diagnostic(code(sandbox::allocation))]
    Allocation(#[from] WorkspaceError),

    /// The owner already holds the maximum number of sandboxes.
    #[error("Sandbox quota exceeded for {owner}: limit is {limit}")]
    #[diagnostic(
        code(sandbox::quota_exceeded),
        help("Clean up an existing sandbox before creating a new one")
    )]
    QuotaExceeded { owner: String, limit: usize },

    /// Unknown, expired or destroyed sandbox.
    #[error("Sandbox not found: {id}")]
    #[diagnostic(code(sandbox::not_found))]
    NotFound { id: String },

    /// Another command is already running in this sandbox.
    #[error("Sandbox busy: {id} is already executing a command")]
    #[diagnostic(code(sandbox::busy))]
    Busy { id: String },

    /// The validator refused the command.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Rejected(#[from] ValidationError),

    /// The command could not be started.
    #[error("Command could not be started")]
    #[diagnostic(code(sandbox::spawn))]
    Spawn(#[from] RunnerError),

    /// Initial repository state could not be applied.
    #[error("Failed to seed sandbox repository: {reason}")]
    #[diagnostic(code(sandbox::seed))]
    Seed { reason: String },
}

impl SandboxError {
    /// Returns true for outcomes caused by player input rather than the environment.
    #[must_use]
    pub fn is_player_error(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. } | Self::NotFound { .. } | Self::Busy { .. } | Self::Rejected(_)
        )
    }
}

/// Errors related to loading configuration.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {}", path.display())]
    #[diagnostic(code(sandbox::config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("Failed to parse config file {}", path.display())]
    #[diagnostic(code(sandbox::config::parse))]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(sandbox::config::invalid))]
    Invalid(String),
}

/// Errors related to host runtime requirements.
#[derive(Error, Debug, Diagnostic)]
pub enum RequirementsError {
    /// git binary not found
    #[error("git executable not found on the sandbox search path")]
    #[diagnostic(
        code(sandbox::requirements::git_missing),
        help("Install git under /usr/bin, or start with --skip-checks")
    )]
    GitMissing,

    /// git is too old for the environment hardening we rely on
    #[error("git version {found} is below minimum required {required}")]
    #[diagnostic(
        code(sandbox::requirements::git_version),
        help("GIT_CONFIG_COUNT support requires git 2.31 or later")
    )]
    GitTooOld { found: String, required: String },

    /// Workspace root is not writable
    #[error("Workspace root is not writable: {}", path.display())]
    #[diagnostic(code(sandbox::requirements::root_not_writable))]
    RootNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to the HTTP server.
#[derive(Error, Debug, Diagnostic)]
pub enum ServerError {
    /// Failed to bind the listen address
    #[error("Failed to bind {addr}")]
    #[diagnostic(code(sandbox::server::bind))]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Server loop failed
    #[error("Server error: {0}")]
    #[diagnostic(code(sandbox::server::serve))]
    Serve(#[source] std::io::Error),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
