// src/cache/local.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::cache::{ArtifactEntry, CacheBackend, Entry, Manifest, RunOutput};
use crate::cmd::Runnable;
use crate::config::loader::Project;
use crate::deps::build_globset;
use crate::errors::{Error, Result};
use crate::hash::digest;

/// Cache under the private working directory.
///
/// Layout: `._qik/cache/<slug>/<fingerprint>/{manifest,out,exit,artifacts/}`.
/// Entries are assembled in a temp directory next to their final location
/// and published with a single rename, so readers never observe a partial
/// entry.
pub struct LocalCache {
    root: PathBuf,
    cache_dir: PathBuf,
}

impl LocalCache {
    pub fn new(project: &Project) -> Self {
        Self {
            root: project.root().to_path_buf(),
            cache_dir: project.priv_work_dir().join("cache"),
        }
    }

    fn entry_dir(&self, slug: &str, fingerprint: &str) -> PathBuf {
        self.cache_dir.join(slug).join(fingerprint)
    }

    /// Entry directory accessor for the remote backend, which downloads
    /// into the local layout before serving from it.
    pub(crate) fn entry_dir_for(&self, runnable: &Runnable, fingerprint: &str) -> PathBuf {
        self.entry_dir(&runnable.slug, fingerprint)
    }

    fn ensure_gitignore(&self) -> Result<()> {
        let priv_dir = self
            .cache_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cache_dir.clone());
        fs::create_dir_all(&priv_dir)
            .with_context(|| format!("creating {}", priv_dir.display()))?;

        let gitignore = priv_dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n").context("writing private dir .gitignore")?;
        }
        Ok(())
    }

    fn read_entry(
        &self,
        runnable: &Runnable,
        fingerprint: &str,
        restore_artifacts: bool,
    ) -> Result<Option<Entry>> {
        let dir = self.entry_dir(&runnable.slug, fingerprint);
        let manifest_path = dir.join("manifest");

        let contents = match fs::read_to_string(&manifest_path) {
            Ok(contents) => contents,
            Err(_) => return Ok(None),
        };

        let manifest: Manifest = toml::from_str(&contents)
            .map_err(|e| Error::CacheIo(format!("corrupt manifest in {}: {e}", dir.display())))?;

        if manifest.fingerprint != fingerprint {
            return Ok(None);
        }

        let out = fs::read_to_string(dir.join("out")).ok();

        if restore_artifacts {
            for artifact in &manifest.artifacts {
                let stored = dir.join("artifacts").join(&artifact.path);
                let target = self.root.join(&artifact.path);
                restore_file(&stored, &target)?;
            }
        }

        Ok(Some(Entry {
            manifest,
            out,
        }))
    }
}

impl CacheBackend for LocalCache {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn get(
        &self,
        runnable: &Runnable,
        fingerprint: &str,
        restore_artifacts: bool,
    ) -> Result<Option<Entry>> {
        self.read_entry(runnable, fingerprint, restore_artifacts)
    }

    fn put(&self, runnable: &Runnable, fingerprint: &str, output: &RunOutput) -> Result<()> {
        self.ensure_gitignore()?;

        let final_dir = self.entry_dir(&runnable.slug, fingerprint);
        let parent = final_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cache_dir.clone());
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating {}", parent.display()))?;

        let tmp_dir = parent.join(format!(".tmp-{}-{}", fingerprint, std::process::id()));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).ok();
        }
        fs::create_dir_all(&tmp_dir).context("creating cache temp dir")?;

        let artifacts = store_artifacts(&self.root, runnable, &tmp_dir)?;

        let manifest = Manifest {
            slug: runnable.slug.clone(),
            fingerprint: fingerprint.to_string(),
            code: output.code,
            artifacts,
            out_excerpt: None,
        };

        let manifest_toml = toml::to_string(&manifest)
            .map_err(|e| Error::CacheIo(format!("serializing manifest: {e}")))?;
        fs::write(tmp_dir.join("manifest"), manifest_toml).context("writing manifest")?;
        fs::write(tmp_dir.join("out"), &output.out).context("writing out")?;
        fs::write(tmp_dir.join("exit"), format!("{}\n", output.code)).context("writing exit")?;

        // Publish atomically. A lost race leaves the other writer's entry
        // in place, which satisfies last-writer-wins closely enough: both
        // entries were computed from the same fingerprint.
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir).ok();
        }
        if let Err(err) = fs::rename(&tmp_dir, &final_dir) {
            fs::remove_dir_all(&tmp_dir).ok();
            if !final_dir.join("manifest").is_file() {
                return Err(Error::CacheIo(format!(
                    "publishing cache entry {}: {err}",
                    final_dir.display()
                )));
            }
        }

        debug!(slug = %runnable.slug, fingerprint, "stored local cache entry");
        Ok(())
    }
}

/// Copy stored artifacts for the runnable into the entry's `artifacts/`
/// tree, returning manifest entries with content hashes.
fn store_artifacts(
    root: &Path,
    runnable: &Runnable,
    entry_dir: &Path,
) -> Result<Vec<ArtifactEntry>> {
    if runnable.artifacts.is_empty() {
        return Ok(Vec::new());
    }

    let set = build_globset(&runnable.artifacts)?;

    let mut entries = Vec::new();
    let mut paths = Vec::new();
    walk_matching(root, root, &set, &mut paths)?;
    paths.sort();

    for rel in paths {
        let src = root.join(&rel);
        let bytes = fs::read(&src)
            .with_context(|| format!("reading artifact {}", src.display()))?;
        let dest = entry_dir.join("artifacts").join(&rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("creating artifact dir")?;
        }
        link_or_copy(&src, &dest)?;
        entries.push(ArtifactEntry {
            path: rel,
            hash: digest(&bytes),
        });
    }

    Ok(entries)
}

/// Recursively collect files under `dir` matching the glob set, as
/// root-relative `/`-separated paths. The VCS and work directories are
/// skipped.
fn walk_matching(
    root: &Path,
    dir: &Path,
    set: &globset::GlobSet,
    out: &mut Vec<String>,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if path.is_dir() {
            if name == ".git" || name == "._qik" || name == ".qik" {
                continue;
            }
            walk_matching(root, &path, set, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            if set.is_match(&rel) {
                out.push(rel);
            }
        }
    }

    Ok(())
}

/// Hardlink if possible, else full copy.
fn link_or_copy(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_file(dest).ok();
    }
    if fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)
        .map(|_| ())
        .with_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
    Ok(())
}

fn restore_file(stored: &Path, target: &Path) -> Result<()> {
    if !stored.is_file() {
        warn!(path = %stored.display(), "cached artifact missing; skipping restore");
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).context("creating artifact target dir")?;
    }
    link_or_copy(stored, target)
}
