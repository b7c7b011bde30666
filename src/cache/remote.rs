// src/cache/remote.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::cache::{CacheBackend, Entry, LocalCache, RunOutput};
use crate::cmd::Runnable;
use crate::config::loader::Project;
use crate::config::model::CacheConf;
use crate::errors::{Error, Result};

/// Transfer of whole cache entries to and from a remote store.
///
/// The key is `<slug>/<fingerprint>`; an entry is the directory produced
/// by the local backend. Transports do not interpret entry contents.
pub trait Transport: Send + Sync {
    fn download(&self, key: &str, dest_dir: &Path) -> Result<()>;
    fn upload(&self, key: &str, src_dir: &Path) -> Result<()>;
}

/// A directory-backed transport (`url = "dir:/mnt/shared/qik-cache"`),
/// useful for shared network mounts and for exercising the remote
/// protocol without an object store.
pub struct DirTransport {
    base: PathBuf,
}

impl DirTransport {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl Transport for DirTransport {
    fn download(&self, key: &str, dest_dir: &Path) -> Result<()> {
        let src = self.base.join(key);
        if !src.is_dir() {
            return Err(Error::RemoteCacheUnavailable(format!(
                "no remote entry at {}",
                src.display()
            )));
        }
        copy_tree(&src, dest_dir)
    }

    fn upload(&self, key: &str, src_dir: &Path) -> Result<()> {
        let dest = self.base.join(key);
        let tmp = self.base.join(format!(".tmp-{}", std::process::id()));
        if tmp.exists() {
            fs::remove_dir_all(&tmp).ok();
        }
        copy_tree(src_dir, &tmp)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::RemoteCacheUnavailable(format!("publishing {key}: {e}")))?;
        }
        if dest.exists() {
            fs::remove_dir_all(&dest).ok();
        }
        fs::rename(&tmp, &dest)
            .map_err(|e| Error::RemoteCacheUnavailable(format!("publishing {key}: {e}")))?;
        Ok(())
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .with_context(|| format!("creating {}", dest.display()))?;
    for entry in fs::read_dir(src)
        .with_context(|| format!("reading {}", src.display()))?
        .flatten()
    {
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("copying {}", from.display()))?;
        }
    }
    Ok(())
}

/// Remote cache: a local cache with read-through / write-through to a
/// transport.
///
/// On miss, the entry is downloaded into the local layout first and then
/// served from there; on store, the local write happens first and the
/// upload follows. Transport failures never fail the runnable: `get`
/// degrades to a miss and `put` degrades to local-only with a warning.
pub struct RemoteCache {
    local: LocalCache,
    transport: Box<dyn Transport>,
}

impl RemoteCache {
    pub fn new(local: LocalCache, transport: Box<dyn Transport>) -> Self {
        Self { local, transport }
    }

    /// Build from a `[caches.<name>]` entry. The only builtin transport is
    /// `dir:`; object-store transports register through the plugin
    /// registry.
    pub fn from_conf(project: &Project, name: &str, conf: &CacheConf) -> Result<Self> {
        let url = conf
            .options
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::UnknownCache(format!("{name} (missing url)")))?;

        let transport: Box<dyn Transport> = match url.split_once(':') {
            Some(("dir", path)) => Box::new(DirTransport::new(path)),
            _ => {
                return Err(Error::UnknownCache(format!(
                    "{name} (unsupported url '{url}')"
                )))
            }
        };

        Ok(Self::new(LocalCache::new(project), transport))
    }

    fn key(runnable: &Runnable, fingerprint: &str) -> String {
        format!("{}/{}", runnable.slug, fingerprint)
    }
}

impl CacheBackend for RemoteCache {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn get(
        &self,
        runnable: &Runnable,
        fingerprint: &str,
        restore_artifacts: bool,
    ) -> Result<Option<Entry>> {
        if let Some(entry) = self.local.get(runnable, fingerprint, restore_artifacts)? {
            return Ok(Some(entry));
        }

        let key = Self::key(runnable, fingerprint);
        let dest = self.local.entry_dir_for(runnable, fingerprint);
        match self.transport.download(&key, &dest) {
            Ok(()) => {
                debug!(key, "downloaded remote cache entry");
                self.local.get(runnable, fingerprint, restore_artifacts)
            }
            Err(err) => {
                debug!(key, error = %err, "remote cache miss");
                Ok(None)
            }
        }
    }

    fn put(&self, runnable: &Runnable, fingerprint: &str, output: &RunOutput) -> Result<()> {
        self.local.put(runnable, fingerprint, output)?;

        let key = Self::key(runnable, fingerprint);
        let src = self.local.entry_dir_for(runnable, fingerprint);
        if let Err(err) = self.transport.upload(&key, &src) {
            warn!(key, error = %err, "remote cache unreachable; entry stored locally only");
        }
        Ok(())
    }
}
