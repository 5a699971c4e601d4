//! Engine configuration.
//!
//! [`EngineConfig`] is built from defaults, then an optional TOML file, then
//! command-line overrides. Every key in the file is optional:
//!
//! ```toml
//! listen = "127.0.0.1:8080"
//! workspace_root = "/var/lib/gitquest/sandboxes"
//! max_sandboxes_per_owner = 3
//! max_workspaces = 1024
//! disk_quota_bytes = 1073741824
//! command_timeout_ms = 10000
//! output_limit_bytes = 65536
//! idle_timeout_secs = 1800
//! reaper_interval_secs = 60
//! history_len = 20
//!
//! [env]
//! GIT_AUTHOR_NAME = "Ada"
//!
//! [policy]
//! programs = ["git", "ls", "cat", "pwd"]
//!
//! [policy.lesson_git_subcommands]
//! intro = ["init", "status", "add", "commit"]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::command::CommandPolicy;
use crate::error::ConfigError;
use crate::sandbox::{DEFAULT_OUTPUT_LIMIT, DEFAULT_TIMEOUT, RunnerConfig};
use crate::workspace::{WorkspaceLimits, default_root};

/// Default address for the HTTP surface.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Configuration for the whole engine.
///
/// # Example
///
/// ```
/// use command_sandbox::config::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_workspace_root("/tmp/sandboxes")
///     .with_max_sandboxes_per_owner(2)
///     .with_command_timeout(Duration::from_secs(5))
///     .with_idle_timeout(Duration::from_secs(600));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding every sandbox workspace.
    pub workspace_root: PathBuf,

    /// Concurrent sandboxes one owner may hold.
    pub max_sandboxes_per_owner: usize,

    /// Live workspaces across all owners.
    pub max_workspaces: usize,

    /// Byte quota for everything under the root.
    pub disk_quota_bytes: Option<u64>,

    /// Time budget per command.
    pub command_timeout: Duration,

    /// Captured bytes per output stream.
    pub output_limit: usize,

    /// Inactivity after which the reaper destroys a sandbox.
    pub idle_timeout: Duration,

    /// Time between reaper sweeps.
    pub reaper_interval: Duration,

    /// Results kept per sandbox for status queries.
    pub history_len: usize,

    /// Extra environment for sandboxed commands.
    pub env_vars: BTreeMap<String, String>,

    /// The command allow-list and its refinements.
    pub policy: CommandPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_root(),
            max_sandboxes_per_owner: 3,
            max_workspaces: WorkspaceLimits::default().max_workspaces,
            disk_quota_bytes: None,
            command_timeout: DEFAULT_TIMEOUT,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            idle_timeout: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(60),
            history_len: 20,
            env_vars: BTreeMap::new(),
            policy: CommandPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the workspace root.
    #[must_use]
    pub fn with_workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_root = path.into();
        self
    }

    /// Sets the per-owner sandbox quota.
    #[must_use]
    pub fn with_max_sandboxes_per_owner(mut self, limit: usize) -> Self {
        self.max_sandboxes_per_owner = limit;
        self
    }

    /// Sets the total workspace limit.
    #[must_use]
    pub fn with_max_workspaces(mut self, limit: usize) -> Self {
        self.max_workspaces = limit;
        self
    }

    /// Sets the disk quota for the workspace root.
    #[must_use]
    pub fn with_disk_quota_bytes(mut self, quota: u64) -> Self {
        self.disk_quota_bytes = Some(quota);
        self
    }

    /// Sets the per-command time budget.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the per-stream output cap.
    #[must_use]
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Sets the idle-expiry threshold.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the reaper sweep interval.
    #[must_use]
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets how many results are kept per sandbox.
    #[must_use]
    pub fn with_history_len(mut self, len: usize) -> Self {
        self.history_len = len;
        self
    }

    /// Adds an environment variable for sandboxed commands.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Replaces the command policy.
    #[must_use]
    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runner settings derived from this configuration.
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_timeout(self.command_timeout)
            .with_output_limit(self.output_limit)
            .with_envs(self.env_vars.clone())
    }

    /// Workspace store limits derived from this configuration.
    #[must_use]
    pub fn workspace_limits(&self) -> WorkspaceLimits {
        WorkspaceLimits {
            max_workspaces: self.max_workspaces,
            disk_quota_bytes: self.disk_quota_bytes,
        }
    }

    /// Rejects values that would make the engine unusable.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.max_sandboxes_per_owner == 0, "max_sandboxes_per_owner must be at least 1"),
            (self.max_workspaces == 0, "max_workspaces must be at least 1"),
            (self.disk_quota_bytes == Some(0), "disk_quota_bytes must be positive"),
            (self.command_timeout.is_zero(), "command timeout must be positive"),
            (self.output_limit == 0, "output limit must be positive"),
            (self.idle_timeout.is_zero(), "idle timeout must be positive"),
            (self.reaper_interval.is_zero(), "reaper interval must be positive"),
        ];

        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, message)) => Err(ConfigError::Invalid((*message).to_string())),
            None if self.policy.is_empty() => Err(ConfigError::Invalid(
                "policy must allow at least one program".to_string(),
            )),
            None => Ok(()),
        }
    }
}

/// On-disk configuration. Absent keys keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub max_sandboxes_per_owner: Option<usize>,
    pub max_workspaces: Option<usize>,
    pub disk_quota_bytes: Option<u64>,
    pub command_timeout_ms: Option<u64>,
    pub output_limit_bytes: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub reaper_interval_secs: Option<u64>,
    pub history_len: Option<usize>,
    pub env: BTreeMap<String, String>,
    pub policy: Option<CommandPolicy>,
}

impl FileConfig {
    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` or `ConfigError::Parse`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let parsed = Self::parse(&content, path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(parsed)
    }

    /// Parses TOML text; `origin` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the text does not match the schema.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            source: e,
        })
    }

    /// Merges the file's values over `base`.
    #[must_use]
    pub fn apply(self, mut base: EngineConfig) -> EngineConfig {
        if let Some(root) = self.workspace_root {
            base.workspace_root = root;
        }
        if let Some(limit) = self.max_sandboxes_per_owner {
            base.max_sandboxes_per_owner = limit;
        }
        if let Some(limit) = self.max_workspaces {
            base.max_workspaces = limit;
        }
        if self.disk_quota_bytes.is_some() {
            base.disk_quota_bytes = self.disk_quota_bytes;
        }
        if let Some(ms) = self.command_timeout_ms {
            base.command_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = self.output_limit_bytes {
            base.output_limit = limit;
        }
        if let Some(secs) = self.idle_timeout_secs {
            base.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.reaper_interval_secs {
            base.reaper_interval = Duration::from_secs(secs);
        }
        if let Some(len) = self.history_len {
            base.history_len = len;
        }
        base.env_vars.extend(self.env);
        if let Some(policy) = self.policy {
            base.policy = policy;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Program;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_sandboxes_per_owner, 3);
        assert_eq!(config.max_workspaces, 1024);
        assert_eq!(config.disk_quota_bytes, None);
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.output_limit, 64 * 1024);
        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.reaper_interval, Duration::from_secs(60));
        assert_eq!(config.history_len, 20);
        assert!(config.workspace_root.ends_with("gitquest-sandboxes"));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let err = EngineConfig::default()
            .with_command_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("command timeout"));

        assert!(EngineConfig::default().with_max_sandboxes_per_owner(0).validate().is_err());
        assert!(EngineConfig::default().with_output_limit(0).validate().is_err());
        assert!(
            EngineConfig::default()
                .with_policy(CommandPolicy::default().with_programs([]))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_derived_settings() {
        let config = EngineConfig::default()
            .with_command_timeout(Duration::from_millis(1500))
            .with_output_limit(1024)
            .with_max_workspaces(7)
            .with_disk_quota_bytes(4096)
            .with_env("GIT_AUTHOR_NAME", "Ada");

        let runner = config.runner_config();
        assert_eq!(runner.timeout, Duration::from_millis(1500));
        assert_eq!(runner.output_limit, 1024);
        assert_eq!(runner.env_vars.get("GIT_AUTHOR_NAME"), Some(&"Ada".to_string()));

        assert_eq!(
            config.workspace_limits(),
            WorkspaceLimits {
                max_workspaces: 7,
                disk_quota_bytes: Some(4096)
            }
        );
    }

    #[test]
    fn test_file_config_merges_over_defaults() {
        let toml = r#"
            listen = "0.0.0.0:9000"
            workspace_root = "/srv/sandboxes"
            command_timeout_ms = 2500
            idle_timeout_secs = 120

            [env]
            LESSON = "branches"

            [policy]
            programs = ["git", "ls"]
        "#;

        let file = FileConfig::parse(toml, Path::new("test.toml")).expect("valid toml");
        assert_eq!(file.listen.as_deref(), Some("0.0.0.0:9000"));

        let config = file.apply(EngineConfig::default());
        assert_eq!(config.workspace_root, PathBuf::from("/srv/sandboxes"));
        assert_eq!(config.command_timeout, Duration::from_millis(2500));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.max_sandboxes_per_owner, 3);
        assert_eq!(config.env_vars.get("LESSON"), Some(&"branches".to_string()));
        assert!(config.policy.allows_program(Program::Git));
        assert!(!config.policy.allows_program(Program::Cat));
    }

    #[test]
    fn test_file_config_rejects_unknown_keys() {
        let err = FileConfig::parse("timeout = 5", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = FileConfig::load(Path::new("/nonexistent/gitquest.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
