// src/dag/scheduler.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::{should_store, CacheBackend, CacheSet, Entry};
use crate::cmd::{Runnable, RunnableTable};
use crate::config::loader::Project;
use crate::config::model::CachePolicy;
use crate::dag::graph::DagGraph;
use crate::dag::select::Selection;
use crate::deps::Resolver;
use crate::errors::Result;
use crate::exec::command::{compose_env, log_path, run_shell};
use crate::exec::sink::{OutputEvent, OutputSink};
use crate::venv::Space;

/// Per-run status of a selected runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Waiting on upstream runnables.
    Pending,
    /// Dependencies satisfied; about to be handed to a worker.
    Ready,
    /// A worker owns it.
    Running,
    Success,
    Failure,
    /// Never started because the run was cancelled.
    Skipped,
    /// Never started because a non-isolated upstream failed.
    UpstreamFailed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success
                | RunStatus::Failure
                | RunStatus::Skipped
                | RunStatus::UpstreamFailed
        )
    }
}

/// Scheduler configuration for one run.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    /// Bypass cache reads (`-f`). Stores still happen.
    pub force: bool,
    /// `--cache`: route every store/lookup through this backend.
    pub cache_override: Option<String>,
    /// `--cache-when`: override every runnable's policy.
    pub cache_when_override: Option<CachePolicy>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            force: false,
            cache_override: None,
            cache_when_override: None,
        }
    }
}

/// Outcome of a scheduler run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub statuses: BTreeMap<String, RunStatus>,
    pub exit_codes: BTreeMap<String, i32>,
    /// Runnables served from cache.
    pub cached: BTreeSet<String>,
}

impl RunReport {
    /// Process exit code: non-zero when any selected runnable failed or
    /// was blocked by a failure.
    pub fn exit_code(&self) -> i32 {
        let failed = self.statuses.values().any(|s| {
            matches!(s, RunStatus::Failure | RunStatus::UpstreamFailed)
        });
        if failed {
            1
        } else {
            0
        }
    }
}

/// What a worker reports back to the coordinator.
#[derive(Debug)]
struct Completion {
    slug: String,
    status: RunStatus,
    code: i32,
    cached: bool,
}

/// The parallel DAG executor.
///
/// A single coordinator loop owns all mutable run state. Workers are
/// spawned tasks gated by a semaphore of `workers` permits; they report
/// terminal results over a bounded completion channel and never inspect
/// each other's state.
pub struct Scheduler<'a> {
    project: &'a Project,
    table: &'a RunnableTable,
    graph: &'a DagGraph,
    selection: &'a Selection,
    caches: &'a CacheSet,
    sink: &'a OutputSink,
    opts: SchedulerOptions,
    spaces: BTreeMap<String, Space>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        project: &'a Project,
        table: &'a RunnableTable,
        graph: &'a DagGraph,
        selection: &'a Selection,
        caches: &'a CacheSet,
        sink: &'a OutputSink,
        opts: SchedulerOptions,
    ) -> Self {
        let spaces = Space::load_all(project)
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();

        Self {
            project,
            table,
            graph,
            selection,
            caches,
            sink,
            opts,
            spaces,
        }
    }

    /// Execute the selection and return the per-runnable report.
    pub async fn run(
        &self,
        resolver: &Resolver<'_>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        // Fingerprints first: cheap, memoized, and any resolution error
        // (missing dist, git failure) aborts before anything executes.
        let mut fingerprints: BTreeMap<String, String> = BTreeMap::new();
        for slug in self.graph.topo_order() {
            if self.selection.contains(slug) {
                let runnable = self.table.get(slug).expect("selected slug exists");
                fingerprints.insert(slug.clone(), resolver.fingerprint(runnable)?);
            }
        }

        let mut statuses: BTreeMap<String, RunStatus> = self
            .selection
            .slugs()
            .map(|s| (s.to_string(), RunStatus::Pending))
            .collect();
        let mut report = RunReport::default();

        let semaphore = Arc::new(Semaphore::new(self.opts.workers.max(1)));
        let worker_ids = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(64);

        let mut cancel_watch = cancel_rx.clone();
        let mut cancelled = *cancel_watch.borrow();

        info!(
            selected = statuses.len(),
            workers = self.opts.workers,
            "scheduler run starting"
        );

        loop {
            if !cancelled {
                self.settle(&mut statuses);
                for slug in self.ready_slugs(&statuses) {
                    statuses.insert(slug.clone(), RunStatus::Ready);
                    self.dispatch(
                        &slug,
                        &fingerprints,
                        Arc::clone(&semaphore),
                        Arc::clone(&worker_ids),
                        done_tx.clone(),
                        cancel_rx.clone(),
                    );
                    statuses.insert(slug, RunStatus::Running);
                }
            } else {
                for status in statuses.values_mut() {
                    if *status == RunStatus::Pending {
                        *status = RunStatus::Skipped;
                    }
                }
            }

            let active = statuses
                .values()
                .any(|s| matches!(s, RunStatus::Ready | RunStatus::Running));
            let pending = statuses.values().any(|s| *s == RunStatus::Pending);

            if !active && (!pending || cancelled) {
                break;
            }

            tokio::select! {
                completion = done_rx.recv() => {
                    let Some(completion) = completion else { break };
                    debug!(
                        slug = %completion.slug,
                        status = ?completion.status,
                        "worker completed"
                    );
                    statuses.insert(completion.slug.clone(), completion.status);
                    report
                        .exit_codes
                        .insert(completion.slug.clone(), completion.code);
                    if completion.cached {
                        report.cached.insert(completion.slug);
                    }
                }
                changed = cancel_watch.changed(), if !cancelled => {
                    if changed.is_err() || *cancel_watch.borrow() {
                        info!("cancellation requested; skipping pending runnables");
                        cancelled = true;
                    }
                }
            }
        }

        report.statuses = statuses;
        info!(exit = report.exit_code(), "scheduler run finished");
        Ok(report)
    }

    /// Mark every pending runnable whose upstream outcome is already
    /// decided: blocked ones become `UpstreamFailed`.
    fn settle(&self, statuses: &mut BTreeMap<String, RunStatus>) {
        loop {
            let mut blocked: Vec<String> = Vec::new();

            for (slug, status) in statuses.iter() {
                if *status != RunStatus::Pending {
                    continue;
                }

                let has_blocker = self.graph.upstreams_of(slug).any(|(up, info)| {
                    statuses.get(up).is_some_and(|s| {
                        s.is_terminal()
                            && *s != RunStatus::Success
                            && info.propagates_failure()
                    })
                });

                if has_blocker {
                    blocked.push(slug.clone());
                }
            }

            if blocked.is_empty() {
                return;
            }
            for slug in blocked {
                warn!(slug = %slug, "upstream failed; not executing");
                statuses.insert(slug, RunStatus::UpstreamFailed);
            }
        }
    }

    /// Pending runnables whose selected upstreams are all terminal and
    /// non-blocking.
    fn ready_slugs(&self, statuses: &BTreeMap<String, RunStatus>) -> Vec<String> {
        statuses
            .iter()
            .filter(|(slug, status)| {
                **status == RunStatus::Pending
                    && self.graph.upstreams_of(slug).all(|(up, info)| {
                        match statuses.get(up) {
                            // Outside the selection: no ordering obligation.
                            None => true,
                            Some(RunStatus::Success) => true,
                            Some(s) if s.is_terminal() => !info.propagates_failure(),
                            Some(_) => false,
                        }
                    })
            })
            .map(|(slug, _)| slug.clone())
            .collect()
    }

    fn dispatch(
        &self,
        slug: &str,
        fingerprints: &BTreeMap<String, String>,
        semaphore: Arc<Semaphore>,
        worker_ids: Arc<AtomicUsize>,
        done_tx: mpsc::Sender<Completion>,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let runnable = self.table.get(slug).expect("selected slug exists").clone();
        let fingerprint = fingerprints.get(slug).cloned().unwrap_or_default();
        let backend = self
            .caches
            .for_runnable(&runnable, self.opts.cache_override.as_deref())
            .map(Arc::clone);
        let policy = self
            .opts
            .cache_when_override
            .unwrap_or(runnable.cache_when);
        let force = self.opts.force;
        let root = self.project.root().to_path_buf();
        let log = log_path(&self.project.priv_work_dir(), &runnable);
        let space = self
            .spaces
            .get(runnable.space_name())
            .or_else(|| self.spaces.get("default"))
            .cloned()
            .expect("default space always resolves");
        let sink = self.sink.clone();

        tokio::spawn(async move {
            let skipped = || Completion {
                slug: runnable.slug.clone(),
                status: RunStatus::Skipped,
                code: -1,
                cached: false,
            };

            let completion = match (semaphore.acquire_owned().await, backend) {
                // Semaphore closed: the run is shutting down.
                (Err(_), _) => skipped(),
                (Ok(_permit), Err(err)) => {
                    warn!(slug = %runnable.slug, error = %err, "no cache backend");
                    Completion {
                        slug: runnable.slug.clone(),
                        status: RunStatus::Failure,
                        code: -1,
                        cached: false,
                    }
                }
                (Ok(_permit), Ok(backend)) => {
                    if *cancel_rx.borrow() {
                        skipped()
                    } else {
                        execute_one(
                            &root,
                            &runnable,
                            &fingerprint,
                            backend,
                            policy,
                            force,
                            &space,
                            &log,
                            &sink,
                            worker_ids.fetch_add(1, Ordering::Relaxed) + 1,
                            cancel_rx,
                        )
                        .await
                    }
                }
            };

            let _ = done_tx.send(completion).await;
        });
    }
}

/// Whether a cached entry may be replayed under the runnable's policy.
fn replayable(policy: CachePolicy, entry: &Entry) -> bool {
    match policy {
        CachePolicy::Never => false,
        CachePolicy::Success => entry.code() == 0,
        CachePolicy::Finished | CachePolicy::Always => true,
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute_one(
    root: &std::path::Path,
    runnable: &Runnable,
    fingerprint: &str,
    backend: Arc<dyn CacheBackend>,
    policy: CachePolicy,
    force: bool,
    space: &Space,
    log: &std::path::Path,
    sink: &OutputSink,
    worker_id: usize,
    cancel_rx: watch::Receiver<bool>,
) -> Completion {
    // Cache lookup. I/O failures degrade to a miss.
    if !force && policy != CachePolicy::Never {
        let entry = match backend.get(runnable, fingerprint, true) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(slug = %runnable.slug, error = %err, "cache get failed; treating as miss");
                None
            }
        };

        if let Some(entry) = entry.filter(|e| replayable(policy, e)) {
            return replay(runnable, &entry, sink).await;
        }
    }

    sink.send(OutputEvent::Started {
        slug: runnable.slug.clone(),
        exec: runnable.exec.clone(),
        cached: false,
    })
    .await;

    let env = match compose_env(root, runnable, space, worker_id) {
        Ok(env) => env,
        Err(err) => {
            warn!(slug = %runnable.slug, error = %err, "environment composition failed");
            return Completion {
                slug: runnable.slug.clone(),
                status: RunStatus::Failure,
                code: -1,
                cached: false,
            };
        }
    };

    let output = match run_shell(root, runnable, &env, log, sink, cancel_rx).await {
        Ok(output) => output,
        Err(err) => {
            warn!(slug = %runnable.slug, error = %err, "subprocess error");
            sink.send(OutputEvent::Finished {
                slug: runnable.slug.clone(),
                code: -1,
                cached: false,
            })
            .await;
            return Completion {
                slug: runnable.slug.clone(),
                status: RunStatus::Failure,
                code: -1,
                cached: false,
            };
        }
    };

    // The store is sequenced after the subprocess has fully exited and its
    // output is flushed. Store failures degrade to a warning.
    if should_store(policy, &output) {
        if let Err(err) = backend.put(runnable, fingerprint, &output) {
            warn!(slug = %runnable.slug, error = %err, "cache put failed");
        }
    }

    sink.send(OutputEvent::Finished {
        slug: runnable.slug.clone(),
        code: output.code,
        cached: false,
    })
    .await;

    let status = if output.code == 0 && !output.signaled {
        RunStatus::Success
    } else {
        RunStatus::Failure
    };

    Completion {
        slug: runnable.slug.clone(),
        status,
        code: output.code,
        cached: false,
    }
}

/// Replay a cache hit: captured output in order, then the recorded exit
/// code. Artifacts were restored by the backend during `get`.
async fn replay(runnable: &Runnable, entry: &Entry, sink: &OutputSink) -> Completion {
    sink.send(OutputEvent::Started {
        slug: runnable.slug.clone(),
        exec: runnable.exec.clone(),
        cached: true,
    })
    .await;

    if let Some(out) = &entry.out {
        for line in out.lines() {
            sink.send(OutputEvent::Line {
                slug: runnable.slug.clone(),
                line: line.to_string(),
            })
            .await;
        }
    }

    let code = entry.code();
    sink.send(OutputEvent::Finished {
        slug: runnable.slug.clone(),
        code,
        cached: true,
    })
    .await;

    Completion {
        slug: runnable.slug.clone(),
        status: if code == 0 {
            RunStatus::Success
        } else {
            RunStatus::Failure
        },
        code,
        cached: true,
    }
}
