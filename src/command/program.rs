//! The closed set of programs a player may run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A program identifier resolved once at validation time.
///
/// Later stages work with this enum and never re-parse the raw input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Program {
    Git,
    Ls,
    Pwd,
    Cat,
    Echo,
    Mkdir,
    Touch,
    Rm,
    Cp,
    Mv,
    Find,
    Head,
    Tail,
    Wc,
    Grep,
}

impl Program {
    /// Every known program, in declaration order.
    pub const ALL: &'static [Program] = &[
        Program::Git,
        Program::Ls,
        Program::Pwd,
        Program::Cat,
        Program::Echo,
        Program::Mkdir,
        Program::Touch,
        Program::Rm,
        Program::Cp,
        Program::Mv,
        Program::Find,
        Program::Head,
        Program::Tail,
        Program::Wc,
        Program::Grep,
    ];

    /// Executable name looked up on the sandbox search path.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Ls => "ls",
            Self::Pwd => "pwd",
            Self::Cat => "cat",
            Self::Echo => "echo",
            Self::Mkdir => "mkdir",
            Self::Touch => "touch",
            Self::Rm => "rm",
            Self::Cp => "cp",
            Self::Mv => "mv",
            Self::Find => "find",
            Self::Head => "head",
            Self::Tail => "tail",
            Self::Wc => "wc",
            Self::Grep => "grep",
        }
    }

    /// Looks up a program by its executable name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    /// Returns true for programs that only inspect the workspace.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::Ls
                | Self::Pwd
                | Self::Cat
                | Self::Echo
                | Self::Find
                | Self::Head
                | Self::Tail
                | Self::Wc
                | Self::Grep
        )
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Program {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown program: {s}"))
    }
}
