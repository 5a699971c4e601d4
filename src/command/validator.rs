//! Classification of raw player input before any process is spawned.
//!
//! The validator is a pure function of its policy and the input line: it
//! never touches the filesystem and never spawns anything. Input is accepted
//! only when it is exactly one allow-listed program followed by arguments.
//!
//! # Rejection order
//!
//! 1. Shell metacharacters anywhere in the line (even inside quotes)
//! 2. Malformed quoting
//! 3. Program not on the allow-list
//! 4. Program-specific argument checks (`git`, `find`)
//! 5. Paths that leave the workspace (absolute, `~`, or with a `..` component)
//! 6. File-modifying programs touching repository metadata (`.git/...`)
//!
//! Every command runs with the workspace as its working directory, so a
//! relative path without `..` cannot name another sandbox's files. `echo`
//! never opens files and is exempt; git commit messages are free text.

use tracing::{instrument, trace};

use super::policy::ALLOWED_GIT_GLOBAL_OPTIONS;
use super::{CommandPolicy, Program};
use crate::error::ValidationError;

/// Characters that would turn a command into shell syntax.
///
/// Covers pipes, chaining, backgrounding, redirects and both forms of
/// command substitution.
const SHELL_METACHARACTERS: &[char] = &['|', ';', '&', '`', '$', '>', '<', '\n', '\r', '\0'];

/// Options that run a command or a pager for specific git subcommands.
///
/// An argument is rejected when it equals, or starts with, one of the listed
/// options (short options may carry their value attached, e.g. `-xsh`).
const GIT_SUBCOMMAND_GUARDS: &[(&str, &[&str])] = &[
    ("rebase", &["-x", "--exec"]),
    ("grep", &["-O", "--open-files-in-pager"]),
    ("clone", &["-u", "--upload-pack", "-c", "--config"]),
    ("config", &["-e", "--edit", "-f", "--file", "--blob"]),
];

/// Leading positional arguments that make a git subcommand run a program.
const GIT_SUBCOMMAND_ACTIONS: &[(&str, &str)] = &[("bisect", "run"), ("submodule", "foreach")];

/// Directory whose contents git reads configuration and hooks from.
const GIT_DIR_NAME: &str = ".git";

/// A command that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    /// The trimmed input line.
    pub raw: String,
    /// Resolved program.
    pub program: Program,
    /// Arguments after tokenisation.
    pub args: Vec<String>,
}

/// Outcome of validating one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validated {
    /// Blank input; nothing should be executed.
    Empty,
    /// A runnable command.
    Command(ValidatedCommand),
}

/// Decides whether a line of player input may run at all.
#[derive(Debug, Clone, Default)]
pub struct CommandValidator {
    policy: CommandPolicy,
}

impl CommandValidator {
    /// Creates a validator for the given policy.
    #[must_use]
    pub fn new(policy: CommandPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy in force.
    #[must_use]
    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Validates one input line, optionally in the context of a lesson.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] describing the first rule the line breaks.
    #[instrument(skip(self), level = "debug")]
    pub fn validate(&self, line: &str, lesson: Option<&str>) -> Result<Validated, ValidationError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Validated::Empty);
        }

        if let Some(c) = trimmed.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            return Err(ValidationError::DisallowedSyntax {
                token: describe_char(c),
            });
        }

        let tokens = shlex::split(trimmed).ok_or_else(|| ValidationError::DisallowedSyntax {
            token: "unbalanced quotes".to_string(),
        })?;

        let Some((name, args)) = tokens.split_first() else {
            return Ok(Validated::Empty);
        };

        let program = Program::from_name(name)
            .filter(|p| self.policy.allows_program(*p))
            .ok_or_else(|| ValidationError::CommandNotAllowed {
                program: name.clone(),
            })?;

        match program {
            Program::Git => self.check_git(args, lesson)?,
            Program::Echo => {}
            Program::Find => {
                self.check_find(args)?;
                check_confined(program, args)?;
            }
            p => check_confined(p, args)?,
        }
        if !program.is_read_only() {
            check_repository_paths(program, args)?;
        }

        trace!(%program, argc = args.len(), "Command accepted");
        Ok(Validated::Command(ValidatedCommand {
            raw: trimmed.to_string(),
            program,
            args: args.to_vec(),
        }))
    }

    fn check_git(&self, args: &[String], lesson: Option<&str>) -> Result<(), ValidationError> {
        // Global options before the subcommand
        let mut rest = args;
        while let Some((first, tail)) = rest.split_first() {
            if !first.starts_with('-') {
                break;
            }
            if !ALLOWED_GIT_GLOBAL_OPTIONS.contains(&first.as_str()) {
                return Err(ValidationError::GitOptionNotAllowed {
                    option: first.clone(),
                });
            }
            rest = tail;
        }

        let Some((subcommand, sub_args)) = rest.split_first() else {
            // `git`, `git --version`
            return Ok(());
        };

        if !self.policy.allows_git_subcommand(subcommand, lesson) {
            return Err(ValidationError::GitSubcommandNotAllowed {
                subcommand: subcommand.clone(),
            });
        }

        if let Some((_, action)) = GIT_SUBCOMMAND_ACTIONS
            .iter()
            .find(|(sub, action)| sub == subcommand && sub_args.iter().any(|a| a == action))
        {
            return Err(git_argument_error(action));
        }

        if let Some((_, guarded)) = GIT_SUBCOMMAND_GUARDS.iter().find(|(sub, _)| sub == subcommand) {
            for arg in sub_args {
                if guarded.iter().any(|opt| arg == opt || arg.starts_with(opt)) {
                    return Err(git_argument_error(arg));
                }
            }
        }

        let mut skip_value = false;
        for arg in sub_args {
            if skip_value {
                // Commit messages are free text
                skip_value = false;
                continue;
            }
            if arg == "-m" || arg == "--message" {
                skip_value = true;
                continue;
            }
            if arg.starts_with("--message=") {
                continue;
            }
            if self.policy.blocked_git_argument(arg).is_some() {
                return Err(git_argument_error(arg));
            }
            // Local clone and fetch sources are paths too
            if escapes_workspace(arg) || arg.to_ascii_lowercase().starts_with("file:") {
                return Err(path_error(Program::Git, arg));
            }
        }

        if subcommand == "config" {
            self.check_git_config(sub_args)?;
        }

        Ok(())
    }

    fn check_git_config(&self, args: &[String]) -> Result<(), ValidationError> {
        // The key is the first positional argument; listing needs none.
        let key = args.iter().find(|a| !a.starts_with('-'));
        match key {
            Some(key) if !self.policy.allows_git_config_key(key) => Err(git_argument_error(key)),
            _ => Ok(()),
        }
    }

    fn check_find(&self, args: &[String]) -> Result<(), ValidationError> {
        match args.iter().find(|a| self.policy.is_blocked_find_predicate(a)) {
            Some(arg) => Err(ValidationError::ArgumentNotAllowed {
                program: Program::Find.name().to_string(),
                argument: arg.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Rejects any argument that names a location outside the workspace.
fn check_confined(program: Program, args: &[String]) -> Result<(), ValidationError> {
    match args.iter().find(|arg| escapes_workspace(arg)) {
        Some(arg) => Err(path_error(program, arg)),
        None => Ok(()),
    }
}

/// Whether an argument could resolve outside the working directory.
///
/// The value of `--option=value` is checked like a bare argument, and a short
/// option with an attached path (`-f/etc/passwd`) counts as a path.
fn escapes_workspace(arg: &str) -> bool {
    let value = match arg.split_once('=') {
        Some((option, value)) if option.starts_with('-') => value,
        _ => arg,
    };
    let attached_path = arg.starts_with('-') && !arg.starts_with("--") && arg.contains('/');

    attached_path
        || value.starts_with('/')
        || value.starts_with('~')
        || value.split('/').any(|component| component == "..")
}

fn path_error(program: Program, argument: &str) -> ValidationError {
    ValidationError::DisallowedPath {
        program: program.name().to_string(),
        argument: argument.to_string(),
    }
}

/// Rejects file-modifying arguments that reach into `.git`.
///
/// Writing `.git/config` directly would bypass the git config key checks.
fn check_repository_paths(program: Program, args: &[String]) -> Result<(), ValidationError> {
    let touches_git_dir = |arg: &&String| {
        arg.split('/')
            .any(|component| component.eq_ignore_ascii_case(GIT_DIR_NAME))
    };

    match args.iter().find(touches_git_dir) {
        Some(arg) => Err(ValidationError::ArgumentNotAllowed {
            program: program.name().to_string(),
            argument: arg.clone(),
        }),
        None => Ok(()),
    }
}

fn git_argument_error(argument: &str) -> ValidationError {
    ValidationError::ArgumentNotAllowed {
        program: Program::Git.name().to_string(),
        argument: argument.to_string(),
    }
}

fn describe_char(c: char) -> String {
    match c {
        '\n' => "newline".to_string(),
        '\r' => "carriage return".to_string(),
        '\0' => "NUL".to_string(),
        other => other.to_string(),
    }
}
