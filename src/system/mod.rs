//! Host runtime requirements validation.
//!
//! This module provides functions to check that the host can run sandboxed
//! commands: a recent enough git on the fixed search path and a writable
//! workspace root.

mod requirements;

pub use requirements::{
    DEFAULT_SEARCH_PATH, MIN_GIT_VERSION, RuntimeRequirements, check_all, check_git,
    check_root_writable, default_search_path, find_program, git_version, parse_git_version,
};
