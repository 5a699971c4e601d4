//! Configuration for the process runner.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::system::default_search_path;

/// Default time budget for a single command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default cap on captured bytes per output stream.
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Configuration for running sandboxed commands.
///
/// Use the builder methods to customize runner behavior.
///
/// # Example
///
/// ```
/// use command_sandbox::sandbox::RunnerConfig;
/// use std::time::Duration;
///
/// let config = RunnerConfig::default()
///     .with_timeout(Duration::from_secs(5))
///     .with_output_limit(16 * 1024)
///     .with_env("GIT_AUTHOR_NAME", "Ada");
/// ```
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum time a command may run before its process group is killed.
    pub timeout: Duration,

    /// Bytes kept per stream; the rest is read and discarded.
    pub output_limit: usize,

    /// Extra environment variables, applied over the built-in set.
    pub env_vars: BTreeMap<String, String>,

    /// Directories searched for program executables.
    pub search_path: Vec<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            env_vars: BTreeMap::new(),
            search_path: default_search_path(),
        }
    }
}

impl RunnerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the command time budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-stream output cap in bytes.
    #[must_use]
    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Adds multiple environment variables from an iterator.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env_vars.insert(k.into(), v.into());
        }
        self
    }

    /// Replaces the program search path.
    #[must_use]
    pub fn with_search_path<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_path = dirs.into_iter().map(Into::into).collect();
        self
    }
}
