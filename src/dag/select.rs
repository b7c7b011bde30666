// src/dag/select.rs

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::cache::CacheSet;
use crate::cmd::RunnableTable;
use crate::config::loader::Project;
use crate::dag::graph::DagGraph;
use crate::deps::{build_globset, Resolver};
use crate::errors::{Error, Result};
use crate::hash;
use crate::venv::Space;

/// Cache status filter for `--cache-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Warm,
    Cold,
}

/// Everything the CLI can ask the selector for. Filters intersect.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// Command names, exact or glob. Empty selects everything.
    pub commands: Vec<String>,
    pub modules: Vec<String>,
    pub spaces: Vec<String>,
    pub cache_types: Vec<String>,
    pub cache_status: Option<CacheStatus>,
    /// Git ref for `--since` filtering.
    pub since: Option<String>,
    /// Drop transitive upstreams unless an edge opts out with
    /// `isolated = false`.
    pub isolated: bool,
}

/// A selected subset of the DAG. Nodes are tagged `primary` (explicitly
/// matched) or transitive (pulled in along edges).
#[derive(Debug, Clone, Default)]
pub struct Selection {
    nodes: BTreeMap<String, bool>,
}

impl Selection {
    pub fn contains(&self, slug: &str) -> bool {
        self.nodes.contains_key(slug)
    }

    pub fn is_primary(&self, slug: &str) -> bool {
        self.nodes.get(slug).copied().unwrap_or(false)
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop nodes not present in `other`. Watch ticks stay within the
    /// invocation's original selection.
    pub fn retain_within(&mut self, other: &Selection) {
        self.nodes.retain(|slug, _| other.contains(slug));
    }
}

/// Filter the DAG down to the requested subset and expand it along
/// upstream and strict-downstream edges.
pub fn select(
    project: &Project,
    table: &RunnableTable,
    graph: &DagGraph,
    resolver: &Resolver<'_>,
    caches: &CacheSet,
    opts: &SelectOptions,
) -> Result<Selection> {
    let mut primary: BTreeSet<String> = table.slugs().map(|s| s.to_string()).collect();

    if !opts.commands.is_empty() {
        let matcher = command_matcher(table, &opts.commands)?;
        primary.retain(|slug| matcher.contains(slug));
    }

    if !opts.modules.is_empty() {
        validate_modules(project, &opts.modules)?;
        let wanted: BTreeSet<&str> = opts.modules.iter().map(|s| s.as_str()).collect();
        primary.retain(|slug| {
            let runnable = table.get(slug).expect("selected slug exists");
            match runnable.module.as_deref() {
                Some(module) => wanted.contains(module),
                None => true,
            }
        });
    }

    if !opts.spaces.is_empty() {
        let wanted: BTreeSet<&str> = opts.spaces.iter().map(|s| s.as_str()).collect();
        primary.retain(|slug| {
            let runnable = table.get(slug).expect("selected slug exists");
            wanted.contains(runnable.space_name())
        });
    }

    if !opts.cache_types.is_empty() {
        let wanted: BTreeSet<String> = opts
            .cache_types
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        let mut kept = BTreeSet::new();
        for slug in primary {
            let runnable = table.get(&slug).expect("selected slug exists");
            let backend = caches.get(&runnable.cache)?;
            if wanted.contains(backend.kind()) {
                kept.insert(slug);
            }
        }
        primary = kept;
    }

    if let Some(status) = opts.cache_status {
        // Probing computes fingerprints and consults backends without
        // executing anything or touching cache state.
        let mut kept = BTreeSet::new();
        for slug in primary {
            let runnable = table.get(&slug).expect("selected slug exists");
            let fingerprint = resolver.fingerprint(runnable)?;
            let backend = caches.get(&runnable.cache)?;
            let entry = backend.get(runnable, &fingerprint, false)?;
            let warm = entry.is_some();
            if (status == CacheStatus::Warm) == warm {
                kept.insert(slug);
            }
        }
        primary = kept;
    }

    if let Some(git_ref) = &opts.since {
        let changed = hash::changed_since(project.root(), git_ref)?;
        let mut kept = BTreeSet::new();
        for slug in primary {
            let runnable = table.get(&slug).expect("selected slug exists");
            if matches_any(&resolver.since_globs(runnable)?, &changed)? {
                kept.insert(slug);
            }
        }
        primary = kept;
    }

    let mut selection = Selection::default();
    for slug in &primary {
        selection.nodes.insert(slug.clone(), true);
    }

    expand_strict_downstream(graph, &mut selection);
    expand_upstream(graph, &mut selection, opts.isolated);

    debug!(
        primary = primary.len(),
        total = selection.len(),
        "computed selection"
    );
    Ok(selection)
}

/// Build a selection from an already-known primary set, applying the same
/// strict-downstream and upstream expansion as [`select`]. Used by the
/// watch loop, where the primaries come from filesystem changes.
pub fn selection_from_primaries(
    graph: &DagGraph,
    primaries: impl IntoIterator<Item = String>,
    isolated: bool,
) -> Selection {
    let mut selection = Selection::default();
    for slug in primaries {
        selection.nodes.insert(slug, true);
    }
    expand_strict_downstream(graph, &mut selection);
    expand_upstream(graph, &mut selection, isolated);
    selection
}

/// Resolve command-name selectors to the set of matching slugs. Exact
/// names that match nothing are selection errors.
fn command_matcher(table: &RunnableTable, commands: &[String]) -> Result<BTreeSet<String>> {
    let mut matched = BTreeSet::new();

    for selector in commands {
        if selector.contains(['*', '?', '[']) {
            let set = build_globset([selector.as_str()])?;

            for runnable in table.iter() {
                if set.is_match(&runnable.name) {
                    matched.insert(runnable.slug.clone());
                }
            }
        } else {
            if !table.contains_command(selector) {
                return Err(Error::UnknownCommand(selector.clone()));
            }
            for slug in table.command_slugs(selector, None) {
                matched.insert(slug);
            }
        }
    }

    Ok(matched)
}

fn validate_modules(project: &Project, modules: &[String]) -> Result<()> {
    let known: BTreeSet<String> = Space::load_all(project)
        .into_iter()
        .flat_map(|s| s.modules.into_iter().map(|m| m.name))
        .collect();

    for module in modules {
        if !known.contains(module) {
            return Err(Error::UnknownModule(module.clone()));
        }
    }
    Ok(())
}

/// True if any changed path matches any of the glob patterns.
fn matches_any(globs: &[String], changed: &[String]) -> Result<bool> {
    if globs.is_empty() || changed.is_empty() {
        return Ok(false);
    }

    let set = build_globset(globs)?;
    Ok(changed.iter().any(|path| set.is_match(path)))
}

/// Pull strict downstreams of every selected node into the selection.
fn expand_strict_downstream(graph: &DagGraph, selection: &mut Selection) {
    let mut stack: Vec<String> = selection.nodes.keys().cloned().collect();

    while let Some(slug) = stack.pop() {
        let downstream: Vec<String> = graph
            .downstreams_of(&slug)
            .filter(|(_, info)| info.strict)
            .map(|(down, _)| down.to_string())
            .collect();

        for down in downstream {
            if !selection.nodes.contains_key(&down) {
                selection.nodes.insert(down.clone(), false);
                stack.push(down);
            }
        }
    }
}

/// Pull upstreams of every selected node into the selection. Under
/// `--isolated`, only edges explicitly marked `isolated = false` are
/// followed.
fn expand_upstream(graph: &DagGraph, selection: &mut Selection, isolated: bool) {
    let mut stack: Vec<String> = selection.nodes.keys().cloned().collect();

    while let Some(slug) = stack.pop() {
        let upstream: Vec<String> = graph
            .upstreams_of(&slug)
            .filter(|(_, info)| !isolated || info.survives_isolated())
            .map(|(up, _)| up.to_string())
            .collect();

        for up in upstream {
            if !selection.nodes.contains_key(&up) {
                selection.nodes.insert(up.clone(), false);
                stack.push(up);
            }
        }
    }
}
