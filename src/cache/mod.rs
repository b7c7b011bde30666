// src/cache/mod.rs

//! Cache backends.
//!
//! A cache entry is keyed by `(slug, fingerprint)` and is immutable after
//! write. Backends publish entries atomically (write to a temp location,
//! then rename) so a partially written entry is never visible to `get`.
//!
//! - [`local`]: private working directory, artifacts included.
//! - [`repo`]: tracked working directory, manifest + exit code only.
//! - [`remote`]: local cache write-through plus a [`Transport`] to an
//!   object store; unreachable remotes degrade to local-only.

pub mod local;
pub mod remote;
pub mod repo;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cmd::Runnable;
use crate::config::loader::Project;
use crate::config::model::CachePolicy;
use crate::errors::{Error, Result};
use crate::plugin::Registry;

pub use local::LocalCache;
pub use remote::{DirTransport, RemoteCache, Transport};
pub use repo::RepoCache;

/// Manifest stored alongside every cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub slug: String,
    pub fingerprint: String,
    pub code: i32,

    /// Artifact files with their content hashes, root-relative.
    #[serde(default)]
    pub artifacts: Vec<ArtifactEntry>,

    /// Truncated output, inlined for backends that do not store the full
    /// `out` blob (the repo cache).
    #[serde(default)]
    pub out_excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub hash: String,
}

/// A cache hit.
#[derive(Debug, Clone)]
pub struct Entry {
    pub manifest: Manifest,
    /// Captured combined stdout/stderr, when the backend stores it.
    pub out: Option<String>,
}

impl Entry {
    pub fn code(&self) -> i32 {
        self.manifest.code
    }
}

/// A terminal run, as produced by the executor.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub out: String,
    /// Terminated by an externally-delivered signal rather than a normal
    /// exit.
    pub signaled: bool,
}

/// Whether a terminal run should be stored under the given policy.
pub fn should_store(policy: CachePolicy, output: &RunOutput) -> bool {
    match policy {
        CachePolicy::Never => false,
        CachePolicy::Success => !output.signaled && output.code == 0,
        CachePolicy::Finished => !output.signaled,
        CachePolicy::Always => true,
    }
}

/// The cache protocol.
///
/// `get` is idempotent and side-effect-free apart from artifact
/// restoration; probing with `restore_artifacts = false` must not mutate
/// any backend state. Concurrent `get`s for one key both succeed;
/// concurrent `put`s serialize so the last writer's entry is fully
/// visible.
pub trait CacheBackend: Send + Sync {
    /// Backend type tag ("local", "repo", "remote", "none").
    fn kind(&self) -> &'static str;

    fn get(
        &self,
        runnable: &Runnable,
        fingerprint: &str,
        restore_artifacts: bool,
    ) -> Result<Option<Entry>>;

    fn put(&self, runnable: &Runnable, fingerprint: &str, output: &RunOutput) -> Result<()>;
}

/// The null backend: every lookup misses, every store is dropped.
pub struct Uncached;

impl CacheBackend for Uncached {
    fn kind(&self) -> &'static str {
        "none"
    }

    fn get(&self, _: &Runnable, _: &str, _: bool) -> Result<Option<Entry>> {
        Ok(None)
    }

    fn put(&self, _: &Runnable, _: &str, _: &RunOutput) -> Result<()> {
        Ok(())
    }
}

/// Every cache backend a run may touch, resolved once up front.
#[derive(Clone)]
pub struct CacheSet {
    backends: BTreeMap<String, Arc<dyn CacheBackend>>,
}

impl CacheSet {
    /// Instantiate the builtin backends plus every `[caches]` entry.
    pub fn load(project: &Project, registry: &Registry) -> Result<Self> {
        let mut backends: BTreeMap<String, Arc<dyn CacheBackend>> = BTreeMap::new();

        backends.insert("none".into(), Arc::new(Uncached));
        backends.insert("local".into(), Arc::new(LocalCache::new(project)));
        backends.insert("repo".into(), Arc::new(RepoCache::new(project)));

        for (name, conf) in project.config().caches.iter() {
            let backend = registry.make_cache(name, conf, project)?;
            backends.insert(name.clone(), backend.into());
        }

        Ok(Self { backends })
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn CacheBackend>> {
        self.backends
            .get(name)
            .ok_or_else(|| Error::UnknownCache(name.to_string()))
    }

    /// The backend a runnable stores into, honoring a CLI-level override.
    pub fn for_runnable<'a>(
        &'a self,
        runnable: &Runnable,
        override_name: Option<&str>,
    ) -> Result<&'a Arc<dyn CacheBackend>> {
        self.get(override_name.unwrap_or(&runnable.cache))
    }
}
