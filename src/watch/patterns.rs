// src/watch/patterns.rs

use std::collections::BTreeMap;
use std::fmt;

use globset::GlobSet;

use crate::cmd::Runnable;
use crate::config::loader::Project;
use crate::deps::{build_globset, Dep, Resolver};
use crate::errors::Result;
use crate::venv::Space;

/// Compiled watch globs for a single runnable.
///
/// Patterns are relative to the project root; the watcher passes relative
/// `/`-separated paths into `matches`.
#[derive(Clone)]
pub struct WatchProfile {
    slug: String,
    space: String,
    has_pydist: bool,
    set: GlobSet,
}

impl fmt::Debug for WatchProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchProfile")
            .field("slug", &self.slug)
            .finish_non_exhaustive()
    }
}

impl WatchProfile {
    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// True if this runnable is affected by a change to the given
    /// root-relative path.
    pub fn matches(&self, rel_path: &str) -> bool {
        self.set.is_match(rel_path)
    }

    /// True if this runnable is affected by a change inside the venv of
    /// the given space.
    pub fn matches_venv(&self, space: &str) -> bool {
        self.has_pydist && self.space == space
    }
}

/// Build a watch profile for every selected runnable.
///
/// Beyond each dependency's own watch globs, runnables with `pydist` deps
/// also watch their space's venv lock files, so a re-lock triggers them
/// even before the venv itself changes.
pub fn build_watch_profiles<'a>(
    project: &Project,
    resolver: &Resolver<'_>,
    runnables: impl Iterator<Item = &'a Runnable>,
) -> Result<Vec<WatchProfile>> {
    let spaces: BTreeMap<String, Space> = Space::load_all(project)
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();
    let mut profiles = Vec::new();

    for runnable in runnables {
        let mut globs = resolver.watch_globs(runnable);
        let has_pydist = runnable.deps.iter().any(|d| matches!(d, Dep::Pydist(_)));
        if has_pydist {
            if let Some(venv) = spaces
                .get(runnable.space_name())
                .and_then(|s| s.venv.as_ref())
            {
                globs.extend(venv.lock.iter().cloned());
            }
        }
        let set = build_globset(&globs)?;

        profiles.push(WatchProfile {
            slug: runnable.slug.clone(),
            space: runnable.space_name().to_string(),
            has_pydist,
            set,
        });
    }

    Ok(profiles)
}
