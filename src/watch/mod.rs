// src/watch/mod.rs

//! File watching and the reactive re-run loop.
//!
//! A single observer produces filesystem events ([`watcher`]); bursts are
//! coalesced by a debounce window; each tick re-derives the affected
//! subset of the current selection ([`patterns`]) and hands it to the
//! scheduler. The loop never terminates on its own: it ends on interrupt
//! or when the configuration file itself changes.

pub mod patterns;
pub mod watcher;

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cache::CacheSet;
use crate::cmd::RunnableTable;
use crate::config::loader::Project;
use crate::dag::graph::DagGraph;
use crate::dag::scheduler::{Scheduler, SchedulerOptions};
use crate::dag::select::{selection_from_primaries, Selection};
use crate::deps::Resolver;
use crate::errors::Result;
use crate::exec::sink::OutputSink;
use crate::hash::HashSource;
use crate::venv::Space;

pub use patterns::{build_watch_profiles, WatchProfile};
pub use watcher::{spawn_watcher, Change, WatcherHandle};

/// Watch loop behaviour.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
    /// `[watch] while-running = "cancel"`: cancel the active run when new
    /// changes arrive instead of waiting it out.
    pub cancel_prior: bool,
    pub isolated: bool,
}

/// Run the reactive loop until interrupted.
///
/// Returns the process exit code: `1` when the loop had to stop because
/// the configuration changed underneath it, `0` on interrupt.
#[allow(clippy::too_many_arguments)]
pub async fn watch_loop(
    project: &Project,
    table: &RunnableTable,
    graph: &DagGraph,
    source: &dyn HashSource,
    caches: &CacheSet,
    sink: &OutputSink,
    base: &Selection,
    sched_opts: &SchedulerOptions,
    watch_opts: &WatchOptions,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<i32> {
    let venv_dirs: Vec<_> = Space::load_all(project)
        .into_iter()
        .filter_map(|space| {
            let venv = space.venv.as_ref()?;
            let dir = venv.site_packages_dir().unwrap_or_else(|| venv.dir.clone());
            Some((space.name, dir))
        })
        .collect();

    let (change_tx, mut change_rx) = mpsc::channel::<Change>(256);
    let _handle = spawn_watcher(project.root(), venv_dirs, change_tx)?;

    info!("watching for changes");

    let mut pending: BTreeSet<Change> = BTreeSet::new();
    let sleep = tokio::time::sleep(watch_opts.debounce);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            change = change_rx.recv() => {
                let Some(change) = change else { break };
                if change == Change::Config {
                    warn!("qik.toml changed; restart the watcher");
                    return Ok(1);
                }
                pending.insert(change);
                sleep
                    .as_mut()
                    .reset(tokio::time::Instant::now() + watch_opts.debounce);
            }
            _ = &mut sleep, if !pending.is_empty() => {
                // Re-arm before the tick; a completed Sleep must not be
                // polled again without a reset.
                sleep
                    .as_mut()
                    .reset(tokio::time::Instant::now() + watch_opts.debounce);
                let changes = std::mem::take(&mut pending);
                let outcome = run_for_changes(
                    project,
                    table,
                    graph,
                    source,
                    caches,
                    sink,
                    base,
                    sched_opts,
                    watch_opts,
                    &mut change_rx,
                    &mut pending,
                    &mut cancel_rx,
                    changes,
                )
                .await?;

                match outcome {
                    TickOutcome::Continue => {}
                    TickOutcome::ConfigChanged => {
                        warn!("qik.toml changed; restart the watcher");
                        return Ok(1);
                    }
                    TickOutcome::Interrupted => return Ok(0),
                }
            }
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    info!("watch loop interrupted");
                    return Ok(0);
                }
            }
        }
    }

    Ok(0)
}

enum TickOutcome {
    Continue,
    ConfigChanged,
    Interrupted,
}

/// One watch tick: compute the affected subset and run the scheduler on
/// it. Depending on the configured policy, changes arriving mid-run either
/// accumulate for the next tick or cancel the run in flight.
#[allow(clippy::too_many_arguments)]
async fn run_for_changes(
    project: &Project,
    table: &RunnableTable,
    graph: &DagGraph,
    source: &dyn HashSource,
    caches: &CacheSet,
    sink: &OutputSink,
    base: &Selection,
    sched_opts: &SchedulerOptions,
    watch_opts: &WatchOptions,
    change_rx: &mut mpsc::Receiver<Change>,
    pending: &mut BTreeSet<Change>,
    cancel_rx: &mut watch::Receiver<bool>,
    changes: BTreeSet<Change>,
) -> Result<TickOutcome> {
    // Fingerprint memoization is per run, so every tick gets a fresh
    // resolver.
    let resolver = Resolver::new(project, source, table);

    let selected_runnables = base
        .slugs()
        .filter_map(|slug| table.get(slug));
    let profiles = build_watch_profiles(project, &resolver, selected_runnables)?;

    let mut affected: BTreeSet<String> = BTreeSet::new();
    for change in &changes {
        for profile in &profiles {
            let hit = match change {
                Change::Repo(path) => profile.matches(path),
                Change::Venv { space } => profile.matches_venv(space),
                Change::Config => false,
            };
            if hit {
                affected.insert(profile.slug().to_string());
            }
        }
    }

    if affected.is_empty() {
        debug!(changes = changes.len(), "changes affect no selected runnable");
        return Ok(TickOutcome::Continue);
    }

    info!(
        changes = changes.len(),
        runnables = affected.len(),
        "re-running for detected changes"
    );

    let mut selection = selection_from_primaries(graph, affected, watch_opts.isolated);
    selection.retain_within(base);

    let scheduler = Scheduler::new(
        project,
        table,
        graph,
        &selection,
        caches,
        sink,
        sched_opts.clone(),
    );

    let (run_cancel_tx, run_cancel_rx) = watch::channel(false);
    let run = scheduler.run(&resolver, run_cancel_rx);
    tokio::pin!(run);

    let mut interrupted = false;
    let mut config_changed = false;
    let mut changes_open = true;

    let report = loop {
        tokio::select! {
            report = &mut run => break report?,
            change = change_rx.recv(), if changes_open => {
                match change {
                    Some(Change::Config) => {
                        config_changed = true;
                        let _ = run_cancel_tx.send(true);
                    }
                    Some(change) => {
                        pending.insert(change);
                        if watch_opts.cancel_prior {
                            debug!("new changes while running; cancelling active run");
                            let _ = run_cancel_tx.send(true);
                        }
                    }
                    None => changes_open = false,
                }
            }
            changed = cancel_rx.changed(), if !interrupted => {
                if changed.is_err() || *cancel_rx.borrow() {
                    interrupted = true;
                    let _ = run_cancel_tx.send(true);
                }
            }
        }
    };

    debug!(exit = report.exit_code(), "watch tick finished");

    if interrupted {
        Ok(TickOutcome::Interrupted)
    } else if config_changed {
        Ok(TickOutcome::ConfigChanged)
    } else {
        Ok(TickOutcome::Continue)
    }
}
