//! Process runner: executes one validated command inside a workspace.
//!
//! Commands run as direct children (no shell), in their own process group,
//! with a cleared environment and bounded time and output.
//!
//! # Example
//!
//! ```no_run
//! use command_sandbox::command::Program;
//! use command_sandbox::sandbox::{CancelToken, CommandRunner, Invocation, ProcessRunner, RunnerConfig};
//! use std::time::Duration;
//!
//! let runner = ProcessRunner::new(RunnerConfig::default().with_timeout(Duration::from_secs(5)));
//! let invocation = Invocation::new(Program::Git, ["init"], "/tmp/gitquest-sandboxes/ws");
//!
//! let result = runner.run(&invocation, &CancelToken::new()).unwrap();
//! println!("{}", result.stdout_text());
//! ```

mod config;
mod output;
mod runner;

pub use config::{DEFAULT_OUTPUT_LIMIT, DEFAULT_TIMEOUT, RunnerConfig};
pub use output::CapturedStream;
pub use runner::{CancelToken, CommandResult, CommandRunner, Invocation, ProcessRunner, Termination};
