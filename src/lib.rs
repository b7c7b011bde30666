// src/lib.rs

pub mod cache;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod ctx;
pub mod dag;
pub mod deps;
pub mod errors;
pub mod exec;
pub mod hash;
pub mod logging;
pub mod plugin;
pub mod venv;
pub mod watch;

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch as watch_channel;
use tracing::{debug, info};

use crate::cli::CliArgs;
use crate::cache::CacheSet;
use crate::config::loader::{load_and_validate, Project};
use crate::ctx::{Ctx, CtxValue};
use crate::dag::graph::DagGraph;
use crate::dag::scheduler::{Scheduler, SchedulerOptions};
use crate::dag::select::{select, SelectOptions};
use crate::deps::Resolver;
use crate::errors::Result;
use crate::exec::sink::OutputSink;
use crate::hash::GitHashSource;
use crate::plugin::Registry;
use crate::watch::{watch_loop, WatchOptions};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and the plugin registry
/// - context resolution (profile, env overrides, CLI overlays)
/// - command expansion, graph construction, selection
/// - the scheduler
/// - (optional) the watch loop
/// - Ctrl-C handling
///
/// Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let mut registry = Registry::builtin();
    let cwd = std::env::current_dir()
        .map_err(|e| errors::Error::Internal(anyhow::anyhow!("no working directory: {e}")))?;
    let project = load_and_validate(&cwd, &mut registry)?;

    let mut ctx = Ctx::resolve(project.config(), args.profile.clone())?;
    overlay_cli(&mut ctx, &args);

    let table = cmd::expand(&project, &ctx, &registry)?;
    let source = GitHashSource::new(project.root(), &project.config().pydist);
    let resolver = Resolver::new(&project, &source, &table);
    let graph = DagGraph::build(&table, &resolver)?;
    let caches = CacheSet::load(&project, &registry)?;

    // Running from inside a space's root implies `-s` for that space.
    let mut spaces = args.spaces.clone();
    if spaces.is_empty() {
        if let Some(space) = working_space(&project, &cwd) {
            debug!(space = %space, "selecting working space from cwd");
            spaces.push(space);
        }
    }

    let select_opts = SelectOptions {
        commands: args.commands.clone(),
        modules: args.modules.clone(),
        spaces,
        cache_types: args.cache_types.clone(),
        cache_status: args.cache_status.map(Into::into),
        since: args.since.clone(),
        isolated: ctx.isolated(),
    };
    let selection = select(&project, &table, &graph, &resolver, &caches, &select_opts)?;

    // --ls lists, --fail gates; neither executes anything.
    if args.ls {
        for slug in selection.slugs() {
            println!("{slug}");
        }
    }
    if args.fail {
        return Ok(if selection.is_empty() { 0 } else { 1 });
    }
    if args.ls {
        return Ok(0);
    }

    // Ctrl-C flips the run-wide cancellation flag.
    let (cancel_tx, cancel_rx) = watch_channel::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            let _ = cancel_tx.send(true);
        }
    });

    let (sink, sink_handle) = OutputSink::spawn();

    let sched_opts = SchedulerOptions {
        workers: ctx.workers(),
        force: ctx.force(),
        cache_override: args.cache.clone(),
        cache_when_override: args.cache_when.map(Into::into),
    };

    let scheduler = Scheduler::new(
        &project,
        &table,
        &graph,
        &selection,
        &caches,
        &sink,
        sched_opts.clone(),
    );
    let report = scheduler.run(&resolver, cancel_rx.clone()).await?;

    if report
        .statuses
        .values()
        .any(|s| *s == dag::scheduler::RunStatus::Skipped)
    {
        return Err(errors::Error::Cancelled);
    }

    let mut code = report.exit_code();

    let watching = args.watch
        || ctx
            .get("qik", "watch")
            .map(|v| v.as_bool())
            .unwrap_or(false);

    if watching && !*cancel_rx.borrow() {
        let watch_conf = &project.config().watch;
        let watch_opts = WatchOptions {
            debounce: Duration::from_millis(watch_conf.debounce_ms),
            cancel_prior: watch_conf.while_running == "cancel",
            isolated: ctx.isolated(),
        };
        code = watch_loop(
            &project,
            &table,
            &graph,
            &source,
            &caches,
            &sink,
            &selection,
            &sched_opts,
            &watch_opts,
            cancel_rx,
        )
        .await?;
    }

    drop(sink);
    let _ = sink_handle.await;

    Ok(code)
}

/// Overlay CLI flags onto the resolved context; the CLI wins over env and
/// profile values.
fn overlay_cli(ctx: &mut Ctx, args: &CliArgs) {
    if let Some(workers) = args.workers {
        ctx.set("qik", "workers", CtxValue::Int(workers as i64));
    }
    if args.force {
        ctx.set("qik", "force", CtxValue::Bool(true));
    }
    if args.isolated {
        ctx.set("qik", "isolated", CtxValue::Bool(true));
    }
    if args.watch {
        ctx.set("qik", "watch", CtxValue::Bool(true));
    }
    if let Some(verbosity) = args.verbosity {
        ctx.set("qik", "verbosity", CtxValue::Int(verbosity as i64));
    }
}

/// The space whose `root` contains the working directory, if any.
fn working_space(project: &Project, cwd: &Path) -> Option<String> {
    let rel = cwd.strip_prefix(project.root()).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    let location = format!("{}/", rel.to_string_lossy().replace('\\', "/"));

    project
        .spaces()
        .iter()
        .find(|(_, conf)| {
            conf.root.as_ref().is_some_and(|root| {
                let prefix = format!("{}/", root.trim_end_matches('/'));
                location.starts_with(&prefix)
            })
        })
        .map(|(name, _)| name.clone())
}
