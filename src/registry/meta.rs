//! Sandbox metadata and per-sandbox command history.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sandbox::{CommandResult, Termination};

/// Unique identifier for a sandbox.
pub type SandboxId = uuid::Uuid;

/// State of a sandbox in its lifecycle.
///
/// `Expired` and `Destroyed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Accepting commands.
    Active,
    /// Removed by the reaper after sitting idle.
    Expired,
    /// Removed on request.
    Destroyed,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Metadata for one sandbox. Only the registry mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sandbox {
    /// Unique sandbox identifier.
    pub id: SandboxId,

    /// Player that created the sandbox.
    pub owner: String,

    /// Lesson or challenge the sandbox belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,

    /// Private working directory.
    pub workspace: PathBuf,

    /// When the sandbox was created.
    pub created_at: DateTime<Utc>,

    /// Last time a command ran.
    pub last_activity_at: DateTime<Utc>,

    /// Current lifecycle state.
    pub status: SandboxStatus,
}

impl Sandbox {
    /// Creates active metadata for a freshly allocated workspace.
    #[must_use]
    pub fn new(id: SandboxId, owner: impl Into<String>, lesson_id: Option<String>, workspace: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner: owner.into(),
            lesson_id,
            workspace,
            created_at: now,
            last_activity_at: now,
            status: SandboxStatus::Active,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SandboxStatus::Active
    }

    /// Records activity. Terminal sandboxes are left untouched.
    pub fn touch(&mut self) {
        if self.is_active() {
            self.last_activity_at = Utc::now();
        }
    }

    /// Time since the last activity, zero if the clock went backwards.
    #[must_use]
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Moves an active sandbox to a terminal state.
    pub(crate) fn finish(&mut self, status: SandboxStatus) {
        if self.is_active() {
            self.status = status;
        }
    }
}

/// One executed command, kept for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub executed_at: DateTime<Utc>,
    pub truncated: bool,
    pub timed_out: bool,
    pub termination: Termination,
}

impl From<&CommandResult> for HistoryEntry {
    fn from(result: &CommandResult) -> Self {
        Self {
            command: result.command.clone(),
            success: result.success(),
            exit_code: result.exit_code,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            executed_at: Utc::now(),
            truncated: result.truncated(),
            timed_out: result.timed_out(),
            termination: result.termination,
        }
    }
}

/// Point-in-time view of a sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSnapshot {
    /// Metadata at the time of the query.
    #[serde(flatten)]
    pub sandbox: Sandbox,
    /// A command is running right now.
    pub busy: bool,
    /// Most recent results, oldest first.
    pub history: Vec<HistoryEntry>,
}
