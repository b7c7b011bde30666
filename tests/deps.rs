// tests/deps.rs

//! Dependency views: watch/since globs and lockfile handling.

mod common;

use std::error::Error;
use std::fs;
use std::path::Path;

use common::{expand, project, FakeSource};
use qik::deps::{build_globset, Dep, Resolver};
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn pathspec_style_recursive_globs_compile() -> TestResult {
    let set = build_globset(["libs/a/**.py"])?;
    assert!(set.is_match("libs/a/mod.py"));
    assert!(set.is_match("libs/a/deep/nested/mod.py"));
    assert!(!set.is_match("libs/b/mod.py"));

    let set = build_globset(["**.py"])?;
    assert!(set.is_match("top.py"));
    assert!(set.is_match("a/b/c.py"));
    Ok(())
}

#[test]
fn const_deps_watch_nothing_but_since_the_config() -> TestResult {
    let dep = Dep::Const("value".into());
    let root = Path::new("/repo");
    let space = qik::venv::Space {
        name: "default".into(),
        root: None,
        modules: vec![],
        venv: None,
        dotenv: vec![],
        fence: vec![],
    };

    assert!(dep.watch_globs(root).is_empty());
    assert_eq!(dep.since_globs(root, &space)?, vec!["*qik.toml".to_string()]);
    Ok(())
}

#[test]
fn pydist_since_requires_a_lock_file() -> TestResult {
    let dep = Dep::Pydist("ruff".into());
    let root = Path::new("/repo");
    let space = qik::venv::Space {
        name: "main".into(),
        root: None,
        modules: vec![],
        venv: None,
        dotenv: vec![],
        fence: vec![],
    };

    let err = dep.since_globs(root, &space).unwrap_err();
    assert_eq!(err.code(), "venv2");
    Ok(())
}

#[test]
fn lock_deps_fall_back_to_defaults_until_the_lockfile_exists() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();

    let dep = Dep::Lock {
        path: ".qik/graph.lock".into(),
        cmd: "lock".into(),
        default: vec!["**.py".into()],
    };

    let globs = dep.watch_globs(root);
    assert!(globs.contains(&"**.py".to_string()));
    assert!(globs.contains(&".qik/graph.lock".to_string()));

    // Once the lock command has produced the artifact, its serialized
    // globs take over.
    fs::create_dir_all(root.join(".qik"))?;
    fs::write(
        root.join(".qik/graph.lock"),
        "globs = [\"libs/a/**.py\"]\npydists = [\"requests\"]\n",
    )?;

    let globs = dep.watch_globs(root);
    assert!(globs.contains(&"libs/a/**.py".to_string()));
    assert!(!globs.contains(&"**.py".to_string()));
    Ok(())
}

#[test]
fn watch_globs_union_all_deps() -> TestResult {
    let config = r#"
[commands.test]
exec = "pytest"
deps = ["src/**.py", "conftest.py", { type = "const", val = "x" }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();
    let resolver = Resolver::new(&proj, &source, &table);

    let globs = resolver.watch_globs(table.get("test").unwrap());
    assert_eq!(globs, vec!["conftest.py".to_string(), "src/**.py".to_string()]);
    Ok(())
}
