// tests/scheduler_run.rs

//! End-to-end scheduler behavior against real subprocesses.

mod common;

use std::error::Error;
use std::fs;

use common::{expand, project, FakeSource};
use qik::cache::CacheSet;
use qik::dag::{select, DagGraph, RunStatus, Scheduler, SchedulerOptions, SelectOptions};
use qik::deps::Resolver;
use qik::exec::OutputSink;
use qik::plugin::Registry;
use tempfile::TempDir;
use tokio::sync::watch;

type TestResult = Result<(), Box<dyn Error>>;

struct Harness {
    proj: qik::config::loader::Project,
    source: FakeSource,
    _tmp: TempDir,
}

impl Harness {
    fn new(config: &str) -> Result<Self, Box<dyn Error>> {
        let tmp = TempDir::new()?;
        fs::write(tmp.path().join("in.txt"), "seed")?;
        Ok(Self {
            proj: project(tmp.path(), config),
            source: FakeSource::with_files([("in.txt", "aaa")]),
            _tmp: tmp,
        })
    }

    async fn run(&self, opts: SchedulerOptions) -> Result<qik::dag::RunReport, Box<dyn Error>> {
        let table = expand(&self.proj);
        let resolver = Resolver::new(&self.proj, &self.source, &table);
        let graph = DagGraph::build(&table, &resolver)?;
        let registry = Registry::builtin();
        let caches = CacheSet::load(&self.proj, &registry)?;
        let selection = select(
            &self.proj,
            &table,
            &graph,
            &resolver,
            &caches,
            &SelectOptions::default(),
        )?;

        let (sink, _sink_handle) = OutputSink::spawn();
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let scheduler = Scheduler::new(
            &self.proj,
            &table,
            &graph,
            &selection,
            &caches,
            &sink,
            opts,
        );
        let report = scheduler.run(&resolver, cancel_rx).await?;
        Ok(report)
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.proj.root().join(name)).unwrap_or_default()
    }
}

fn two_workers() -> SchedulerOptions {
    SchedulerOptions {
        workers: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn upstream_runs_before_downstream() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.first]
exec = "printf a >> order.txt"
deps = ["in.txt"]
cache = "local"

[commands.second]
exec = "printf b >> order.txt"
deps = [{ type = "command", name = "first" }]
cache = "local"
"#,
    )?;

    let report = harness.run(two_workers()).await?;
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.statuses["first"], RunStatus::Success);
    assert_eq!(report.statuses["second"], RunStatus::Success);
    assert_eq!(harness.read("order.txt"), "ab");
    Ok(())
}

#[tokio::test]
async fn second_run_replays_from_cache() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.build]
exec = "printf x >> ran.txt"
deps = ["in.txt"]
cache = "local"
"#,
    )?;

    let first = harness.run(two_workers()).await?;
    assert!(first.cached.is_empty());
    assert_eq!(harness.read("ran.txt"), "x");

    let second = harness.run(two_workers()).await?;
    assert!(second.cached.contains("build"));
    assert_eq!(second.statuses["build"], RunStatus::Success);
    assert_eq!(second.exit_codes["build"], 0);
    // The subprocess did not run again.
    assert_eq!(harness.read("ran.txt"), "x");
    Ok(())
}

#[tokio::test]
async fn force_bypasses_cache_reads() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.build]
exec = "printf x >> ran.txt"
deps = ["in.txt"]
cache = "local"
"#,
    )?;

    harness.run(two_workers()).await?;
    let forced = harness
        .run(SchedulerOptions {
            workers: 2,
            force: true,
            ..Default::default()
        })
        .await?;

    assert!(forced.cached.is_empty());
    assert_eq!(harness.read("ran.txt"), "xx");
    Ok(())
}

#[tokio::test]
async fn never_policy_never_stores() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.build]
exec = "printf x >> ran.txt"
deps = ["in.txt"]
cache = "local"
cache-when = "never"
"#,
    )?;

    harness.run(two_workers()).await?;
    harness.run(two_workers()).await?;

    assert_eq!(harness.read("ran.txt"), "xx");
    assert!(!harness.proj.priv_work_dir().join("cache/build").exists());
    Ok(())
}

#[tokio::test]
async fn failure_blocks_downstream() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.first]
exec = "exit 3"
deps = ["in.txt"]

[commands.second]
exec = "printf b > blocked.txt"
deps = [{ type = "command", name = "first" }]
"#,
    )?;

    let report = harness.run(two_workers()).await?;
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.statuses["first"], RunStatus::Failure);
    assert_eq!(report.exit_codes["first"], 3);
    assert_eq!(report.statuses["second"], RunStatus::UpstreamFailed);
    assert_eq!(harness.read("blocked.txt"), "");
    Ok(())
}

#[tokio::test]
async fn isolated_true_edges_do_not_propagate_failure() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.flaky]
exec = "exit 1"
deps = ["in.txt"]

[commands.robust]
exec = "printf r > r.txt"
deps = [{ type = "command", name = "flaky", isolated = true }]
"#,
    )?;

    let report = harness.run(two_workers()).await?;
    assert_eq!(report.statuses["flaky"], RunStatus::Failure);
    assert_eq!(report.statuses["robust"], RunStatus::Success);
    assert_eq!(harness.read("r.txt"), "r");
    // The flaky runnable itself still fails the invocation.
    assert_eq!(report.exit_code(), 1);
    Ok(())
}

#[tokio::test]
async fn captured_output_round_trips_through_the_cache() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.speak]
exec = "echo hello; echo world >&2"
deps = ["in.txt"]
cache = "local"
"#,
    )?;

    harness.run(two_workers()).await?;

    // The per-runnable log file holds the combined output.
    let log = harness.read("._qik/out/speak.log");
    assert!(log.contains("hello"));
    assert!(log.contains("world"));

    let second = harness.run(two_workers()).await?;
    assert!(second.cached.contains("speak"));
    Ok(())
}

#[tokio::test]
async fn parallel_module_runnables_all_execute() -> TestResult {
    let harness = Harness::new(
        r#"
[commands.fmt]
exec = "mkdir -p {module.dir} && touch {module.dir}/.ok"
deps = ["{module.dir}/*"]
cache = "local"

[spaces.default]
modules = ["libs/a", "libs/b", "libs/c"]
"#,
    )?;

    let report = harness
        .run(SchedulerOptions {
            workers: 3,
            ..Default::default()
        })
        .await?;

    assert_eq!(report.exit_code(), 0);
    for module in ["a", "b", "c"] {
        assert_eq!(report.statuses[&format!("fmt@{module}")], RunStatus::Success);
        assert!(harness
            .proj
            .root()
            .join(format!("libs/{module}/.ok"))
            .exists());
    }
    Ok(())
}
