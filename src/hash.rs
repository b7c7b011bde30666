// src/hash.rs

//! Content hashing sources.
//!
//! File hashes come from the git index so that fingerprints track the
//! version-controlled state of the tree instead of filesystem timestamps.
//! Untracked files are invisible. The `git` binary is the only external
//! process invoked here, through one narrow wrapper.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context};
use tracing::debug;

use crate::config::model::PydistConf;
use crate::errors::{Error, Result};
use crate::venv::{normalize_dist_name, Space};

/// Hash used for deleted-but-indexed files.
const GONE_HASH: &str = "0000000000000000000000000000000000000000";

/// Resolution result for a distribution version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistVersion {
    Version(String),
    /// Missing but suppressed via `[pydist] ignore-missing`; contributes a
    /// sentinel to fingerprints.
    Ignored,
}

/// The hashing seam consumed by the dependency resolver.
///
/// Implementations must be deterministic: two calls against the same tree
/// state return identical output, with paths root-relative, `/`-separated
/// and sorted lexicographically.
pub trait HashSource: Send + Sync {
    /// Map glob patterns to the tracked files matching them and their
    /// content hashes.
    fn hash_files(&self, globs: &[String]) -> Result<Vec<(String, String)>>;

    /// Resolve the installed version of a distribution within a space.
    fn dist_version(&self, name: &str, space: &Space) -> Result<DistVersion>;
}

/// The production hash source, backed by the git index.
pub struct GitHashSource {
    root: PathBuf,
    overrides: BTreeMap<String, String>,
    ignore_missing: bool,
}

impl GitHashSource {
    pub fn new(root: impl Into<PathBuf>, pydist: &PydistConf) -> Self {
        let overrides = pydist
            .versions
            .iter()
            .map(|(name, version)| (normalize_dist_name(name), version.clone()))
            .collect();

        Self {
            root: root.into(),
            overrides,
            ignore_missing: pydist.ignore_missing,
        }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("running git {}", args.join(" ")))?;

        if !output.status.success() {
            return Err(Error::Internal(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl HashSource for GitHashSource {
    /// List tracked files matching the globs with their index object names.
    ///
    /// `git ls-files -cm` prints modified files twice (cached + modified);
    /// those are re-hashed from the working tree with `git hash-object` so
    /// the fingerprint reflects unstaged edits. Files deleted from the
    /// working tree but still in the index hash to a fixed all-zero value.
    fn hash_files(&self, globs: &[String]) -> Result<Vec<(String, String)>> {
        if globs.is_empty() {
            return Ok(Vec::new());
        }

        let mut patterns: Vec<&str> = globs.iter().map(|s| s.as_str()).collect();
        patterns.sort_unstable();
        patterns.dedup();

        let mut args = vec!["ls-files", "-cm", "--format", "%(path)\t%(objectname)", "--"];
        args.extend(patterns.iter().copied());

        let stdout = self.git(&args)?;

        let mut hashes: BTreeMap<String, String> = BTreeMap::new();
        let mut seen_twice: Vec<String> = Vec::new();

        for line in stdout.lines() {
            let Some((path, hash)) = line.split_once('\t') else {
                continue;
            };
            if hashes.insert(path.to_string(), hash.to_string()).is_some()
                && !seen_twice.iter().any(|p| p == path)
            {
                seen_twice.push(path.to_string());
            }
        }

        for path in seen_twice {
            let abs = self.root.join(&path);
            if abs.is_file() {
                let rehash = self.git(&["hash-object", &path])?;
                hashes.insert(path, rehash.trim().to_string());
            } else {
                hashes.insert(path, GONE_HASH.to_string());
            }
        }

        debug!(files = hashes.len(), "hashed glob set from git index");
        Ok(hashes.into_iter().collect())
    }

    /// Consults, in order: the configured override map, the space's
    /// site-packages metadata, and the venv lock files.
    fn dist_version(&self, name: &str, space: &Space) -> Result<DistVersion> {
        let normalized = normalize_dist_name(name);

        if let Some(version) = self.overrides.get(&normalized) {
            return Ok(DistVersion::Version(version.clone()));
        }

        match &space.venv {
            Some(venv) => {
                if let Some(version) = venv.dist_version(name) {
                    return Ok(DistVersion::Version(version));
                }
                if let Some(version) = venv.lockfile_version(&self.root, name) {
                    return Ok(DistVersion::Version(version));
                }
            }
            None if !self.ignore_missing => {
                return Err(Error::VenvNotConfigured(space.name.clone()));
            }
            None => {}
        }

        if self.ignore_missing {
            Ok(DistVersion::Ignored)
        } else {
            Err(Error::MissingDist {
                name: name.to_string(),
                space: space.name.clone(),
            })
        }
    }
}

/// Names of files changed in the working tree since a git ref.
///
/// Paths are returned root-relative with `/` separators, suitable for glob
/// matching against dependency patterns.
pub fn changed_since(root: &Path, git_ref: &str) -> Result<Vec<String>> {
    let output = Command::new("git")
        .args(["diff", "--name-only", git_ref, "--", "."])
        .current_dir(root)
        .output()
        .context("running git diff --name-only")?;

    if !output.status.success() {
        return Err(Error::Internal(anyhow!(
            "git diff --name-only {git_ref} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Hex digest of a byte sequence.
pub fn digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
