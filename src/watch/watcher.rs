// src/watch/watcher.rs

use std::path::{Path, PathBuf};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};

/// A filesystem change, already classified and relativized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    /// A path under the project root, `/`-separated and root-relative.
    Repo(String),
    /// A path under the site-packages of a space's venv.
    Venv { space: String },
    /// The configuration file itself changed.
    Config,
}

/// Handle keeping the underlying watcher alive. Dropping it stops
/// observation.
pub struct WatcherHandle {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle").finish()
    }
}

/// Spawn a filesystem watcher over the project root (recursively, so
/// directory creation is covered) plus the site-packages directory of
/// every space with a venv.
///
/// Classified changes are forwarded over `change_tx`; the debouncing is
/// the caller's job.
pub fn spawn_watcher(
    root: impl Into<PathBuf>,
    venv_dirs: Vec<(String, PathBuf)>,
    change_tx: mpsc::Sender<Change>,
) -> Result<WatcherHandle> {
    let root = root.into();
    let root = root.canonicalize().unwrap_or_else(|_| root.clone());

    // Channel from the blocking notify callback into the async world.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            // A closed receiver means the loop is shutting down.
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(err) => {
                eprintln!("qik: file watch error: {err}");
            }
        },
        Config::default(),
    )
    .map_err(|e| Error::Internal(anyhow::anyhow!("starting watcher: {e}")))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| Error::Internal(anyhow::anyhow!("watching {}: {e}", root.display())))?;

    for (space, dir) in &venv_dirs {
        if dir.is_dir() {
            if let Err(err) = watcher.watch(dir, RecursiveMode::Recursive) {
                warn!(space = %space, error = %err, "could not watch venv dir");
            }
        }
    }

    info!(root = %root.display(), venvs = venv_dirs.len(), "file watcher started");

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !is_mutation(&event.kind) {
                continue;
            }

            for path in &event.paths {
                if let Some(change) = classify(&root, &venv_dirs, path) {
                    debug!(?change, "watch event");
                    if change_tx.send(change).await.is_err() {
                        return;
                    }
                }
            }
        }
        debug!("file watcher loop ended");
    });

    Ok(WatcherHandle { _inner: watcher })
}

fn is_mutation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn classify(root: &Path, venv_dirs: &[(String, PathBuf)], path: &Path) -> Option<Change> {
    // Venv roots usually live inside the (hidden) private work dir, so
    // they must be classified before the hidden-path filter below.
    for (space, dir) in venv_dirs {
        if path.starts_with(dir) {
            return Some(Change::Venv {
                space: space.clone(),
            });
        }
    }

    if let Ok(rel) = path.strip_prefix(root) {
        let rel = rel.to_string_lossy().replace('\\', "/");

        if rel.ends_with("qik.toml") {
            return Some(Change::Config);
        }

        // Hidden files and the work directories never trigger runs; venv
        // changes are classified below by their own watch roots.
        if rel.split('/').any(|part| part.starts_with('.')) {
            return None;
        }
        if rel.split('/').any(|part| part == "__pycache__") {
            return None;
        }

        return Some(Change::Repo(rel));
    }

    None
}
