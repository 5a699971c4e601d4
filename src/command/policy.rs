//! Allow-list configuration for the command validator.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use super::Program;

/// Git subcommands permitted when no narrower set is configured.
pub const DEFAULT_GIT_SUBCOMMANDS: &[&str] = &[
    "init",
    "status",
    "add",
    "commit",
    "log",
    "diff",
    "show",
    "branch",
    "checkout",
    "switch",
    "merge",
    "rebase",
    "reset",
    "restore",
    "revert",
    "tag",
    "stash",
    "fetch",
    "pull",
    "push",
    "clone",
    "remote",
    "reflog",
    "cherry-pick",
    "bisect",
    "config",
    "mv",
    "rm",
    "clean",
    "blame",
    "grep",
    "describe",
    "worktree",
    "submodule",
    "ls-files",
    "ls-tree",
    "cat-file",
    "rev-parse",
    "shortlog",
    "whatchanged",
    "for-each-ref",
];

/// Git arguments that are rejected wherever they appear.
///
/// Matching is case-insensitive. An entry matches an argument exactly or as
/// the key of `key=value`; entries starting with `.` or ending in `:` or `.`
/// match as substrings.
pub const DEFAULT_BLOCKED_GIT_ARGUMENTS: &[&str] = &[
    "--global",
    "--system",
    "--exec-path",
    "--exec",
    "--upload-pack",
    "--receive-pack",
    "--template",
    "ext::",
    "fd::",
    "core.pager",
    "core.editor",
    "core.sshcommand",
    "core.hookspath",
    "core.fsmonitor",
    "core.askpass",
    "diff.external",
    "gpg.program",
    "credential.helper",
    "sequence.editor",
    "alias.",
    "include.",
    "includeif.",
    ".textconv",
    ".clean",
    ".smudge",
    ".process",
    ".driver",
    ".command",
    ".uploadpack",
    ".receivepack",
];

/// Keys `git config` may read or write. Entries ending in `.` match as prefixes.
pub const DEFAULT_GIT_CONFIG_KEYS: &[&str] = &[
    "user.name",
    "user.email",
    "init.defaultbranch",
    "core.autocrlf",
    "core.ignorecase",
    "core.quotepath",
    "color.",
    "merge.ff",
    "pull.rebase",
    "pull.ff",
    "push.default",
    "log.decorate",
    "advice.",
];

/// `find` predicates that would run or write outside the validator's control.
pub const DEFAULT_BLOCKED_FIND_PREDICATES: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-fprint", "-fprint0", "-fprintf", "-fls",
];

/// Git options accepted before the subcommand.
pub const ALLOWED_GIT_GLOBAL_OPTIONS: &[&str] =
    &["--version", "--help", "-h", "-v", "--no-pager", "-P"];

/// Process-wide command allow-list, read-only during normal operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandPolicy {
    /// Programs the validator accepts.
    pub programs: BTreeSet<Program>,

    /// Git subcommands accepted in any lesson. `None` allows every subcommand.
    pub git_subcommands: Option<BTreeSet<String>>,

    /// Per-lesson git subcommand sets; replace `git_subcommands` for that lesson.
    pub lesson_git_subcommands: BTreeMap<String, BTreeSet<String>>,

    /// Blocked git arguments, see [`DEFAULT_BLOCKED_GIT_ARGUMENTS`].
    pub blocked_git_arguments: Vec<String>,

    /// Keys `git config` may touch, see [`DEFAULT_GIT_CONFIG_KEYS`].
    pub git_config_keys: Vec<String>,

    /// Blocked `find` predicates.
    pub blocked_find_predicates: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            programs: Program::ALL.iter().copied().collect(),
            git_subcommands: Some(to_set(DEFAULT_GIT_SUBCOMMANDS)),
            lesson_git_subcommands: BTreeMap::new(),
            blocked_git_arguments: DEFAULT_BLOCKED_GIT_ARGUMENTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            git_config_keys: DEFAULT_GIT_CONFIG_KEYS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            blocked_find_predicates: DEFAULT_BLOCKED_FIND_PREDICATES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl CommandPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the program allow-list.
    #[must_use]
    pub fn with_programs<I: IntoIterator<Item = Program>>(mut self, programs: I) -> Self {
        self.programs = programs.into_iter().collect();
        self
    }

    /// Allows every git subcommand.
    #[must_use]
    pub fn allow_all_git_subcommands(mut self) -> Self {
        self.git_subcommands = None;
        self
    }

    /// Restricts git to the given subcommands.
    #[must_use]
    pub fn with_git_subcommands<I, S>(mut self, subcommands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.git_subcommands = Some(subcommands.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts git to the given subcommands while a lesson is active.
    #[must_use]
    pub fn with_lesson_git_subcommands<I, S>(mut self, lesson: impl Into<String>, subcommands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lesson_git_subcommands
            .insert(lesson.into(), subcommands.into_iter().map(Into::into).collect());
        self
    }

    /// Returns true if the program is on the allow-list.
    #[must_use]
    pub fn allows_program(&self, program: Program) -> bool {
        self.programs.contains(&program)
    }

    /// Returns true if no program is allowed at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Returns true if the git subcommand may run in the given lesson.
    #[must_use]
    pub fn allows_git_subcommand(&self, subcommand: &str, lesson: Option<&str>) -> bool {
        if let Some(set) = lesson.and_then(|l| self.lesson_git_subcommands.get(l)) {
            return set.contains(subcommand);
        }
        match &self.git_subcommands {
            Some(set) => set.contains(subcommand),
            None => true,
        }
    }

    /// Returns the blocked entry matching a git argument, if any.
    #[must_use]
    pub fn blocked_git_argument(&self, argument: &str) -> Option<&str> {
        let arg = argument.to_ascii_lowercase();
        self.blocked_git_arguments
            .iter()
            .find(|entry| {
                let entry = entry.to_ascii_lowercase();
                if entry.starts_with('.') || entry.ends_with(':') || entry.ends_with('.') {
                    arg.contains(&entry)
                } else {
                    arg == entry || arg.starts_with(&format!("{entry}="))
                }
            })
            .map(String::as_str)
    }

    /// Returns true if `git config` may touch the key.
    #[must_use]
    pub fn allows_git_config_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.git_config_keys.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            if allowed.ends_with('.') {
                key.starts_with(&allowed)
            } else {
                key == allowed
            }
        })
    }

    /// Returns true if the argument is a blocked `find` predicate.
    #[must_use]
    pub fn is_blocked_find_predicate(&self, argument: &str) -> bool {
        self.blocked_find_predicates.iter().any(|p| p == argument)
    }
}

fn to_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_allows_everything_known() {
        let policy = CommandPolicy::default();
        for program in Program::ALL {
            assert!(policy.allows_program(*program));
        }
        assert!(policy.allows_git_subcommand("commit", None));
        assert!(!policy.allows_git_subcommand("daemon", None));
    }

    #[test]
    fn test_lesson_override_replaces_global_set() {
        let policy = CommandPolicy::default().with_lesson_git_subcommands("lesson-1", ["init", "status"]);

        assert!(policy.allows_git_subcommand("status", Some("lesson-1")));
        assert!(!policy.allows_git_subcommand("commit", Some("lesson-1")));
        // Unknown lessons fall back to the global set
        assert!(policy.allows_git_subcommand("commit", Some("lesson-2")));
    }

    #[test]
    fn test_allow_all_git_subcommands() {
        let policy = CommandPolicy::default().allow_all_git_subcommands();
        assert!(policy.allows_git_subcommand("daemon", None));
    }

    #[test]
    fn test_blocked_git_argument_matching() {
        let policy = CommandPolicy::default();
        assert_eq!(policy.blocked_git_argument("--global"), Some("--global"));
        assert_eq!(policy.blocked_git_argument("--upload-pack=evil"), Some("--upload-pack"));
        assert_eq!(policy.blocked_git_argument("ext::sh -c id"), Some("ext::"));
        assert_eq!(policy.blocked_git_argument("Core.Pager"), Some("core.pager"));
        assert_eq!(policy.blocked_git_argument("alias.st"), Some("alias."));
        assert_eq!(
            policy.blocked_git_argument("diff.evil.textconv=sh"),
            Some(".textconv")
        );
        assert_eq!(policy.blocked_git_argument("--oneline"), None);
        assert_eq!(policy.blocked_git_argument("--globally"), None);
    }

    #[test]
    fn test_git_config_keys() {
        let policy = CommandPolicy::default();
        assert!(policy.allows_git_config_key("user.name"));
        assert!(policy.allows_git_config_key("User.Email"));
        assert!(policy.allows_git_config_key("color.ui"));
        assert!(!policy.allows_git_config_key("core.pager"));
        assert!(!policy.allows_git_config_key("user.signingkey"));
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: CommandPolicy = toml::from_str(
            r#"
            programs = ["git", "ls"]
            blocked_find_predicates = []

            [lesson_git_subcommands]
            basics = ["init"]
            "#,
        )
        .unwrap();

        assert!(policy.allows_program(Program::Git));
        assert!(!policy.allows_program(Program::Rm));
        assert!(policy.allows_git_subcommand("init", Some("basics")));
        assert!(!policy.is_blocked_find_predicate("-exec"));
        // Unspecified keys keep their defaults
        assert!(policy.blocked_git_argument("--global").is_some());
    }
}
