// src/cache/repo.rs

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use anyhow::Context;
use tracing::{debug, warn};

use crate::cache::{CacheBackend, Entry, Manifest, RunOutput};
use crate::cmd::Runnable;
use crate::config::loader::Project;
use crate::errors::{Error, Result};

/// Maximum captured output inlined into a repo manifest.
const OUT_EXCERPT_LIMIT: usize = 16 * 1024;

/// The `.gitattributes` rule that routes cache entries through the custom
/// merge driver. The driver keeps the acting party's side: `ours` on merge,
/// `theirs` on rebase (during a rebase "theirs" is the rebased branch).
const ATTRS_LINE: &str = ".qik/cache/** merge=qik-cache -diff\n";

// git index manipulation is process-global state.
static GIT_LOCK: Mutex<()> = Mutex::new(());

/// Cache committed to the repository.
///
/// Layout: `.qik/cache/<slug>/<fingerprint>/{manifest,exit}`. Artifact
/// bytes are never stored; output is truncated into the manifest. Entries
/// are registered with `git add -N` so they show up as intent-to-add.
pub struct RepoCache {
    root: PathBuf,
    cache_dir: PathBuf,
}

impl RepoCache {
    pub fn new(project: &Project) -> Self {
        Self {
            root: project.root().to_path_buf(),
            cache_dir: project.pub_work_dir().join("cache"),
        }
    }

    fn entry_dir(&self, slug: &str, fingerprint: &str) -> PathBuf {
        self.cache_dir.join(slug).join(fingerprint)
    }

    fn ensure_gitattributes(&self) -> Result<()> {
        let attrs_path = self.root.join(".gitattributes");
        let existing = fs::read_to_string(&attrs_path).unwrap_or_default();
        if !existing.contains("merge=qik-cache") {
            fs::write(&attrs_path, format!("{ATTRS_LINE}{existing}"))
                .context("writing .gitattributes")?;
            self.git_add_intent(&[".gitattributes".to_string()]);
        }
        Ok(())
    }

    /// `git add -N` the given root-relative paths. Index failures are
    /// warnings: the cache entry itself is already on disk.
    fn git_add_intent(&self, paths: &[String]) {
        let _guard = GIT_LOCK.lock().expect("git lock");
        let status = Command::new("git")
            .arg("add")
            .arg("-N")
            .arg("--")
            .args(paths)
            .current_dir(&self.root)
            .status();

        match status {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(?status, "git add -N for repo cache entry failed"),
            Err(err) => warn!(error = %err, "could not invoke git for repo cache entry"),
        }
    }
}

impl CacheBackend for RepoCache {
    fn kind(&self) -> &'static str {
        "repo"
    }

    fn get(
        &self,
        runnable: &Runnable,
        fingerprint: &str,
        _restore_artifacts: bool,
    ) -> Result<Option<Entry>> {
        let dir = self.entry_dir(&runnable.slug, fingerprint);
        let contents = match fs::read_to_string(dir.join("manifest")) {
            Ok(contents) => contents,
            Err(_) => return Ok(None),
        };

        let manifest: Manifest = toml::from_str(&contents)
            .map_err(|e| Error::CacheIo(format!("corrupt manifest in {}: {e}", dir.display())))?;

        if manifest.fingerprint != fingerprint {
            return Ok(None);
        }

        let out = manifest.out_excerpt.clone();
        Ok(Some(Entry { manifest, out }))
    }

    fn put(&self, runnable: &Runnable, fingerprint: &str, output: &RunOutput) -> Result<()> {
        let final_dir = self.entry_dir(&runnable.slug, fingerprint);
        let parent = final_dir
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.cache_dir.clone());
        fs::create_dir_all(&parent)
            .with_context(|| format!("creating {}", parent.display()))?;

        let mut excerpt = output.out.clone();
        if excerpt.len() > OUT_EXCERPT_LIMIT {
            let cut = excerpt
                .char_indices()
                .take_while(|(i, _)| *i < OUT_EXCERPT_LIMIT)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            excerpt.truncate(cut);
            excerpt.push_str("\n[truncated]\n");
        }

        let manifest = Manifest {
            slug: runnable.slug.clone(),
            fingerprint: fingerprint.to_string(),
            code: output.code,
            artifacts: Vec::new(),
            out_excerpt: Some(excerpt),
        };

        let tmp_dir = parent.join(format!(".tmp-{}-{}", fingerprint, std::process::id()));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).ok();
        }
        fs::create_dir_all(&tmp_dir).context("creating cache temp dir")?;

        let manifest_toml = toml::to_string(&manifest)
            .map_err(|e| Error::CacheIo(format!("serializing manifest: {e}")))?;
        fs::write(tmp_dir.join("manifest"), manifest_toml).context("writing manifest")?;
        fs::write(tmp_dir.join("exit"), format!("{}\n", output.code)).context("writing exit")?;

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

        self.ensure_gitattributes()?;

        let rel = |name: &str| {
            final_dir
                .join(name)
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| final_dir.join(name).to_string_lossy().to_string())
        };
        self.git_add_intent(&[rel("manifest"), rel("exit")]);

        debug!(slug = %runnable.slug, fingerprint, "stored repo cache entry");
        Ok(())
    }
}
