// tests/graph.rs

//! DAG construction: cycles, ordering, transitive closures.

mod common;

use std::error::Error;
use std::path::Path;

use common::{expand, project, FakeSource};
use qik::dag::DagGraph;
use qik::deps::Resolver;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn mutual_command_deps_are_rejected_with_a_cycle_path() -> TestResult {
    let config = r#"
[commands.a]
exec = "echo a"
deps = [{ type = "command", name = "b" }]

[commands.b]
exec = "echo b"
deps = [{ type = "command", name = "a" }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();
    let resolver = Resolver::new(&proj, &source, &table);

    let err = DagGraph::build(&table, &resolver).unwrap_err();
    assert_eq!(err.code(), "graph0");

    let message = err.to_string();
    assert!(message.contains("a"), "cycle message names 'a': {message}");
    assert!(message.contains("b"), "cycle message names 'b': {message}");
    Ok(())
}

#[test]
fn topological_order_is_stable_and_respects_edges() -> TestResult {
    let config = r#"
[commands.zeta]
exec = "echo z"

[commands.alpha]
exec = "echo a"

[commands.build]
exec = "echo build"
deps = [{ type = "command", name = "alpha" }, { type = "command", name = "zeta" }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();
    let resolver = Resolver::new(&proj, &source, &table);

    let graph = DagGraph::build(&table, &resolver)?;
    let order: Vec<&str> = graph.topo_order().iter().map(|s| s.as_str()).collect();
    assert_eq!(order, vec!["alpha", "zeta", "build"]);
    Ok(())
}

#[test]
fn transitive_upstreams_cover_the_whole_chain() -> TestResult {
    let config = r#"
[commands.a]
exec = "echo a"

[commands.b]
exec = "echo b"
deps = [{ type = "command", name = "a" }]

[commands.c]
exec = "echo c"
deps = [{ type = "command", name = "b" }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();
    let resolver = Resolver::new(&proj, &source, &table);

    let graph = DagGraph::build(&table, &resolver)?;
    let ups = graph.transitive_upstreams("c");
    assert!(ups.contains("a"));
    assert!(ups.contains("b"));
    assert_eq!(ups.len(), 2);
    Ok(())
}

#[test]
fn lock_deps_impose_strict_edges_to_the_lock_command() -> TestResult {
    let config = r#"
[commands.lock]
exec = "lock-it"
artifacts = [".qik/graph.lock"]

[commands.test]
exec = "pytest"
deps = [{ type = "lock", path = ".qik/graph.lock", cmd = "lock", default = ["**.py"] }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();
    let resolver = Resolver::new(&proj, &source, &table);

    let graph = DagGraph::build(&table, &resolver)?;
    let edge = graph
        .upstreams_of("test")
        .find(|(up, _)| *up == "lock")
        .map(|(_, info)| info)
        .expect("edge to lock command exists");
    assert!(edge.strict);
    Ok(())
}

#[test]
fn module_parametric_upstreams_link_per_module() -> TestResult {
    let config = r#"
[commands.fmt]
exec = "fmt {module.dir}"
deps = ["{module.dir}/*"]

[commands.check]
exec = "check {module.dir}"
deps = [{ type = "command", name = "fmt" }]

[spaces.default]
modules = ["libs/a", "libs/b"]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();
    let resolver = Resolver::new(&proj, &source, &table);

    let graph = DagGraph::build(&table, &resolver)?;

    let ups_a: Vec<_> = graph.upstreams_of("check@a").map(|(up, _)| up.to_string()).collect();
    assert_eq!(ups_a, vec!["fmt@a"]);

    let ups_b: Vec<_> = graph.upstreams_of("check@b").map(|(up, _)| up.to_string()).collect();
    assert_eq!(ups_b, vec!["fmt@b"]);
    Ok(())
}
