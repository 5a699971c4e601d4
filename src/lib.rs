//! Command Sandbox - per-session command execution for interactive Git lessons.
//!
//! Each player session gets a private workspace directory in which they may
//! run a curated set of commands: `git` plus a handful of harmless file
//! utilities. Commands are tokenised and checked against an allow-list before
//! anything is spawned; spawned processes run with a scrubbed environment, a
//! timeout and bounded output capture.
//!
//! # Components
//!
//! - [`workspace`]: allocation and reclamation of workspace directories
//! - [`command`]: the command validator and its policy
//! - [`sandbox`]: the process runner
//! - [`registry`]: sandbox lifecycle, quotas and per-sandbox serialisation
//! - [`reaper`]: background expiry of idle sandboxes
//! - [`server`]: the HTTP surface
//!
//! # Platform Requirements
//!
//! - Unix (process groups are used to kill whole command trees)
//! - git 2.31 or later under `/usr/bin` or `/bin`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use command_sandbox::{EngineConfig, Reaper, SandboxRegistry, server};
//! use miette::IntoDiagnostic;
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let config = EngineConfig::default();
//!     let registry = Arc::new(SandboxRegistry::open(&config)?);
//!     let _reaper = Reaper::new(Arc::clone(&registry)).spawn().into_diagnostic()?;
//!
//!     server::run(registry, "127.0.0.1:8080", async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod reaper;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod system;
pub mod workspace;

// Re-export commonly used types
pub use command::{CommandPolicy, CommandValidator, Program};
pub use config::{EngineConfig, FileConfig};
pub use error::{Error, Result, SandboxError, ValidationError};
pub use reaper::{Reaper, ReaperHandle, SweepReport};
pub use registry::{HealthReport, RepoSeed, RepoState, Sandbox, SandboxId, SandboxRegistry, SandboxStatus};
pub use sandbox::{CommandResult, ProcessRunner, RunnerConfig, Termination};
pub use workspace::{WorkspaceLimits, WorkspaceStore};
