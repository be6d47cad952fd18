//! CLI surface: `<prog> <directory> [--watch]`. Parsing itself is a thin collaborator
//! the core consumes (out of scope per the spec); this is the minimal implementation of
//! that collaborator — a positional path and one flag do not warrant a parser crate.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub watch: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingDirectory,
    UnknownArgument(String),
    NotADirectory(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingDirectory => write!(f, "usage: dupewatch <directory> [--watch]"),
            ConfigError::UnknownArgument(arg) => write!(f, "unknown argument: {arg}"),
            ConfigError::NotADirectory(path) => write!(f, "not a directory: {}", path.display()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parses `args` (excluding argv[0]) into a `Config`. Checks that the directory argument
/// actually names a directory, so an argument error and a failed root handle are both
/// caught before the supervisor starts (spec: exit code 1 for either).
pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Config, ConfigError> {
    let mut root = None;
    let mut watch = false;

    for arg in args {
        if arg == "--watch" {
            watch = true;
        } else if arg.starts_with("--") {
            return Err(ConfigError::UnknownArgument(arg));
        } else if root.is_none() {
            root = Some(PathBuf::from(arg));
        } else {
            return Err(ConfigError::UnknownArgument(arg));
        }
    }

    let root = root.ok_or(ConfigError::MissingDirectory)?;
    if !root.is_dir() {
        return Err(ConfigError::NotADirectory(root));
    }

    Ok(Config { root, watch })
}
