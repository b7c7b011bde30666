// src/deps/mod.rs

//! Dependency variants and their derived glob/edge views.
//!
//! Each variant knows how to contribute to three things:
//! - the fingerprint of the runnable that declares it (`fingerprint.rs`)
//! - the glob sets used by `--since` and `--watch` filtering
//! - the implicit edges of the runnable DAG
//!
//! [`fingerprint`] holds the resolver that turns dependency declarations
//! into canonical digests.

pub mod fingerprint;

use std::fs;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::venv::Space;

pub use fingerprint::{Edge, Resolver, FINGERPRINT_VERSION};

/// Compile config glob patterns into a `GlobSet`.
///
/// Dependency globs are written in git pathspec style, where `**.py` is
/// legal and matches at any depth. `globset` only accepts `**` as a full
/// path component, so mixed components are rewritten (`a/**.py` becomes
/// `a/**/*.py`) before compilation.
pub fn build_globset<I, S>(patterns: I) -> Result<GlobSet>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let normalized = normalize_glob(pattern);
        let glob = Glob::new(&normalized)
            .map_err(|e| Error::ConfigParse(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::ConfigParse(format!("building glob set: {e}")))
}

fn normalize_glob(pattern: &str) -> String {
    let mut components = Vec::new();
    for component in pattern.split('/') {
        if component != "**" && component.contains("**") {
            components.push("**".to_string());
            components.push(component.replace("**", "*"));
        } else {
            components.push(component.to_string());
        }
    }
    components.join("/")
}

/// A concrete dependency of a runnable, after template expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dep {
    /// Tracked files matching a glob pattern.
    Glob(String),
    /// A constant value contributed verbatim.
    Const(String),
    /// The installed version of a python distribution.
    Pydist(String),
    /// Another command; contributes its fingerprint and a DAG edge.
    Command {
        name: String,
        strict: bool,
        isolated: Option<bool>,
    },
    /// A plugin-emitted lockfile: hashed like a glob, with a strict edge to
    /// the command that produces it. `default` globs apply to watch/since
    /// filtering until the lockfile exists.
    Lock {
        path: String,
        cmd: String,
        default: Vec<String>,
    },
}

/// The serialized contents of a lockfile artifact: glob patterns and
/// distributions discovered by the emitting plugin.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LockContents {
    #[serde(default)]
    pub globs: Vec<String>,

    #[serde(default)]
    pub pydists: Vec<String>,
}

impl LockContents {
    /// Read a lockfile artifact. Unreadable or unparsable files resolve to
    /// `None` so callers fall back to the dependency's default globs.
    pub fn read(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        toml::from_str(&contents).ok()
    }
}

impl Dep {
    /// Glob patterns consulted when deciding whether a filesystem change
    /// (watch mode) affects the declaring runnable.
    pub fn watch_globs(&self, root: &Path) -> Vec<String> {
        match self {
            Dep::Glob(pattern) => vec![pattern.clone()],
            Dep::Const(_) | Dep::Pydist(_) | Dep::Command { .. } => Vec::new(),
            Dep::Lock { path, default, .. } => {
                let mut globs = match LockContents::read(&root.join(path)) {
                    Some(contents) => contents.globs,
                    None => default.clone(),
                };
                globs.push(path.clone());
                globs
            }
        }
    }

    /// Glob patterns consulted for `--since` filtering.
    ///
    /// Deps not directly tied to git contribute globs that encapsulate
    /// their changes: consts are pinned by the config file itself, pydists
    /// by the space's venv lock files.
    pub fn since_globs(&self, root: &Path, space: &Space) -> Result<Vec<String>> {
        match self {
            Dep::Const(_) => Ok(vec!["*qik.toml".to_string()]),
            Dep::Pydist(_) => {
                let lock = space.venv.as_ref().map(|v| v.lock.clone()).unwrap_or_default();
                if lock.is_empty() {
                    return Err(Error::LockFileRequired(space.name.clone()));
                }
                Ok(lock)
            }
            _ => Ok(self.watch_globs(root)),
        }
    }
}
