// src/deps/fingerprint.rs

//! Deterministic fingerprints for runnables.
//!
//! The digest covers, in order: the resolved shell string, each
//! dependency's contribution in declaration order, and the artifact glob
//! list. Every piece is length-framed so no contribution can collide with
//! another's concatenation, and the whole serialization carries a version
//! tag so future format changes invalidate caches deterministically.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::trace;

use crate::cmd::{Runnable, RunnableTable};
use crate::config::loader::Project;
use crate::deps::Dep;
use crate::errors::Result;
use crate::hash::{digest, DistVersion, HashSource};
use crate::venv::Space;

/// Version tag of the fingerprint serialization format.
pub const FINGERPRINT_VERSION: &str = "qik/v1";

/// A DAG edge derived from a dependency declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Slug of the upstream runnable.
    pub upstream: String,
    /// Selection of the upstream pulls this runnable back in.
    pub strict: bool,
    /// Tri-state isolation flag: `Some(false)` edges survive `--isolated`,
    /// `Some(true)` edges do not propagate upstream failure, unset edges
    /// follow the defaults for both.
    pub isolated: Option<bool>,
}

/// Length-framed byte accumulator.
struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    fn new() -> Self {
        Self {
            buf: FINGERPRINT_VERSION.as_bytes().to_vec(),
        }
    }

    fn frame(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(bytes);
    }

    fn finish(self) -> String {
        digest(&self.buf)
    }
}

/// Computes fingerprints and edges for runnables.
///
/// Fingerprints are memoized per resolver (one resolver per run), so the
/// recursion through `command` dependencies touches each runnable once.
pub struct Resolver<'a> {
    root: PathBuf,
    source: &'a dyn HashSource,
    table: &'a RunnableTable,
    spaces: BTreeMap<String, Space>,
    memo: Mutex<HashMap<String, String>>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        project: &Project,
        source: &'a dyn HashSource,
        table: &'a RunnableTable,
    ) -> Self {
        let spaces = Space::load_all(project)
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        Self {
            root: project.root().to_path_buf(),
            source,
            table,
            spaces,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// The fingerprint of a runnable; deterministic for a given tree state
    /// and configuration.
    pub fn fingerprint(&self, runnable: &Runnable) -> Result<String> {
        if let Some(cached) = self.memo.lock().expect("memo lock").get(&runnable.slug) {
            return Ok(cached.clone());
        }

        let mut framer = Framer::new();
        framer.frame(runnable.exec.as_bytes());

        for dep in &runnable.deps {
            let contribution = self.contribution(runnable, dep)?;
            framer.frame(&contribution);
        }

        for artifact in &runnable.artifacts {
            framer.frame(artifact.as_bytes());
        }

        let fingerprint = framer.finish();
        trace!(slug = %runnable.slug, fingerprint = %fingerprint, "computed fingerprint");

        self.memo
            .lock()
            .expect("memo lock")
            .insert(runnable.slug.clone(), fingerprint.clone());
        Ok(fingerprint)
    }

    fn contribution(&self, runnable: &Runnable, dep: &Dep) -> Result<Vec<u8>> {
        match dep {
            Dep::Glob(pattern) => self.glob_contribution(std::slice::from_ref(pattern)),
            Dep::Const(val) => Ok(val.as_bytes().to_vec()),
            Dep::Pydist(name) => {
                let space = self.space_of(runnable);
                let version = self.source.dist_version(name, space)?;
                let rendered = match version {
                    DistVersion::Version(v) => format!("{name}={v}"),
                    DistVersion::Ignored => format!("{name}=?"),
                };
                Ok(rendered.into_bytes())
            }
            Dep::Command { name, .. } => {
                let mut buf = Vec::new();
                for slug in self.table.command_slugs(name, runnable.module.as_deref()) {
                    if let Some(upstream) = self.table.get(&slug) {
                        buf.extend_from_slice(self.fingerprint(upstream)?.as_bytes());
                    }
                }
                Ok(buf)
            }
            // The lockfile artifact is hashed like any tracked file; its
            // contents only influence watch/since filtering.
            Dep::Lock { path, .. } => self.glob_contribution(std::slice::from_ref(path)),
        }
    }

    fn glob_contribution(&self, globs: &[String]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for (path, hash) in self.source.hash_files(globs)? {
            buf.extend_from_slice(path.as_bytes());
            buf.push(0);
            buf.extend_from_slice(hash.as_bytes());
            buf.push(b'\n');
        }
        Ok(buf)
    }

    fn space_of(&self, runnable: &Runnable) -> &Space {
        self.spaces
            .get(runnable.space_name())
            .or_else(|| self.spaces.get("default"))
            .expect("default space always resolves")
    }

    /// DAG edges implied by the runnable's dependencies.
    pub fn edges(&self, runnable: &Runnable) -> Vec<Edge> {
        let mut edges = Vec::new();

        for dep in &runnable.deps {
            match dep {
                Dep::Command {
                    name,
                    strict,
                    isolated,
                } => {
                    for slug in self.table.command_slugs(name, runnable.module.as_deref()) {
                        let upstream_default =
                            self.table.get(&slug).and_then(|r| r.isolated);
                        edges.push(Edge {
                            upstream: slug,
                            strict: *strict,
                            isolated: (*isolated).or(upstream_default),
                        });
                    }
                }
                Dep::Lock { cmd, .. } => {
                    for slug in self.table.command_slugs(cmd, runnable.module.as_deref()) {
                        let upstream_default =
                            self.table.get(&slug).and_then(|r| r.isolated);
                        edges.push(Edge {
                            upstream: slug,
                            strict: true,
                            isolated: upstream_default,
                        });
                    }
                }
                _ => {}
            }
        }

        edges
    }

    /// Watch globs of a runnable: the union of its deps' watch views.
    pub fn watch_globs(&self, runnable: &Runnable) -> Vec<String> {
        let mut globs: Vec<String> = runnable
            .deps
            .iter()
            .flat_map(|dep| dep.watch_globs(&self.root))
            .collect();
        globs.sort_unstable();
        globs.dedup();
        globs
    }

    /// Since globs of a runnable: like watch globs, with consts and
    /// pydists mapped onto the git-visible files that pin them.
    pub fn since_globs(&self, runnable: &Runnable) -> Result<Vec<String>> {
        let space = self.space_of(runnable);
        let mut globs = Vec::new();
        for dep in &runnable.deps {
            globs.extend(dep.since_globs(&self.root, space)?);
        }
        globs.sort_unstable();
        globs.dedup();
        Ok(globs)
    }
}
