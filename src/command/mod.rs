//! Command validation: turns a raw input line into a known program and its arguments.
//!
//! # Example
//!
//! ```
//! use command_sandbox::command::{CommandPolicy, CommandValidator, Program, Validated};
//!
//! let validator = CommandValidator::new(CommandPolicy::default());
//!
//! match validator.validate("git status", None).unwrap() {
//!     Validated::Command(cmd) => assert_eq!(cmd.program, Program::Git),
//!     Validated::Empty => unreachable!(),
//! }
//!
//! assert!(validator.validate("ls | wc -l", None).is_err());
//! ```

mod policy;
mod program;
mod validator;

pub use policy::{
    CommandPolicy, DEFAULT_BLOCKED_FIND_PREDICATES, DEFAULT_BLOCKED_GIT_ARGUMENTS,
    DEFAULT_GIT_CONFIG_KEYS, DEFAULT_GIT_SUBCOMMANDS,
};
pub use program::Program;
pub use validator::{CommandValidator, Validated, ValidatedCommand};
