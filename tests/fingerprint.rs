// tests/fingerprint.rs

//! Fingerprint determinism and sensitivity.

mod common;

use std::error::Error;
use std::path::Path;

use common::{expand, project, FakeSource};
use qik::deps::Resolver;

type TestResult = Result<(), Box<dyn Error>>;

const CONFIG: &str = r#"
[commands.lock]
exec = "pip compile > requirements.txt"
deps = ["requirements.in", { type = "const", val = "v1" }]
artifacts = ["requirements.txt"]

[commands.test]
exec = "pytest"
deps = ["tests/conftest.py", { type = "command", name = "lock" }]
"#;

fn fingerprint_of(source: &FakeSource, slug: &str) -> String {
    let proj = project(Path::new("/repo"), CONFIG);
    let table = expand(&proj);
    let resolver = Resolver::new(&proj, source, &table);
    let runnable = table.get(slug).expect("runnable exists");
    resolver.fingerprint(runnable).expect("fingerprint resolves")
}

#[test]
fn identical_tree_state_produces_identical_fingerprints() -> TestResult {
    let source = FakeSource::with_files([
        ("requirements.in", "aaa"),
        ("tests/conftest.py", "bbb"),
    ]);

    assert_eq!(fingerprint_of(&source, "lock"), fingerprint_of(&source, "lock"));
    assert_eq!(fingerprint_of(&source, "test"), fingerprint_of(&source, "test"));
    Ok(())
}

#[test]
fn glob_content_change_invalidates() -> TestResult {
    let mut source = FakeSource::with_files([
        ("requirements.in", "aaa"),
        ("tests/conftest.py", "bbb"),
    ]);
    let before = fingerprint_of(&source, "lock");

    source.set_file("requirements.in", "zzz");
    let after = fingerprint_of(&source, "lock");

    assert_ne!(before, after);
    Ok(())
}

#[test]
fn upstream_command_change_invalidates_downstream() -> TestResult {
    let mut source = FakeSource::with_files([
        ("requirements.in", "aaa"),
        ("tests/conftest.py", "bbb"),
    ]);
    let before = fingerprint_of(&source, "test");

    // Only the upstream's own dep changes; the downstream must follow.
    source.set_file("requirements.in", "zzz");
    let after = fingerprint_of(&source, "test");

    assert_ne!(before, after);
    Ok(())
}

#[test]
fn const_change_invalidates() -> TestResult {
    let source = FakeSource::with_files([
        ("requirements.in", "aaa"),
        ("tests/conftest.py", "bbb"),
    ]);

    let changed = CONFIG.replace("val = \"v1\"", "val = \"v2\"");
    let proj_a = project(Path::new("/repo"), CONFIG);
    let proj_b = project(Path::new("/repo"), &changed);
    let table_a = expand(&proj_a);
    let table_b = expand(&proj_b);

    let fp_a = Resolver::new(&proj_a, &source, &table_a)
        .fingerprint(table_a.get("lock").unwrap())?;
    let fp_b = Resolver::new(&proj_b, &source, &table_b)
        .fingerprint(table_b.get("lock").unwrap())?;

    assert_ne!(fp_a, fp_b);
    Ok(())
}

#[test]
fn exec_change_invalidates() -> TestResult {
    let source = FakeSource::with_files([
        ("requirements.in", "aaa"),
        ("tests/conftest.py", "bbb"),
    ]);

    let changed = CONFIG.replace("pip compile", "uv pip compile");
    let proj_a = project(Path::new("/repo"), CONFIG);
    let proj_b = project(Path::new("/repo"), &changed);
    let table_a = expand(&proj_a);
    let table_b = expand(&proj_b);

    let fp_a = Resolver::new(&proj_a, &source, &table_a)
        .fingerprint(table_a.get("lock").unwrap())?;
    let fp_b = Resolver::new(&proj_b, &source, &table_b)
        .fingerprint(table_b.get("lock").unwrap())?;

    assert_ne!(fp_a, fp_b);
    Ok(())
}

#[test]
fn pydist_version_change_invalidates() -> TestResult {
    let config = r#"
[commands.check]
exec = "ruff check ."
deps = [{ type = "pydist", name = "ruff" }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);

    let mut source = FakeSource::default();
    source.set_dist("ruff", "0.5.0");
    let before = Resolver::new(&proj, &source, &table)
        .fingerprint(table.get("check").unwrap())?;

    source.set_dist("ruff", "0.6.0");
    let after = Resolver::new(&proj, &source, &table)
        .fingerprint(table.get("check").unwrap())?;

    assert_ne!(before, after);
    Ok(())
}

#[test]
fn missing_dist_is_an_error() -> TestResult {
    let config = r#"
[commands.check]
exec = "ruff check ."
deps = [{ type = "pydist", name = "ruff" }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();

    let err = Resolver::new(&proj, &source, &table)
        .fingerprint(table.get("check").unwrap())
        .unwrap_err();
    assert_eq!(err.code(), "venv0");
    Ok(())
}

#[test]
fn contribution_framing_prevents_concatenation_collisions() -> TestResult {
    let config_a = r#"
[commands.c]
exec = "true"
deps = [{ type = "const", val = "ab" }, { type = "const", val = "c" }]
"#;
    let config_b = r#"
[commands.c]
exec = "true"
deps = [{ type = "const", val = "a" }, { type = "const", val = "bc" }]
"#;
    let source = FakeSource::default();

    let proj_a = project(Path::new("/repo"), config_a);
    let proj_b = project(Path::new("/repo"), config_b);
    let table_a = expand(&proj_a);
    let table_b = expand(&proj_b);

    let fp_a = Resolver::new(&proj_a, &source, &table_a)
        .fingerprint(table_a.get("c").unwrap())?;
    let fp_b = Resolver::new(&proj_b, &source, &table_b)
        .fingerprint(table_b.get("c").unwrap())?;

    assert_ne!(fp_a, fp_b);
    Ok(())
}

#[test]
fn base_deps_contribute_to_every_runnable() -> TestResult {
    let with_base = r#"
[commands.solo]
exec = "true"

[base]
deps = [{ type = "const", val = "shared" }]
"#;
    let without_base = r#"
[commands.solo]
exec = "true"
"#;
    let source = FakeSource::default();

    let proj_a = project(Path::new("/repo"), with_base);
    let proj_b = project(Path::new("/repo"), without_base);
    let table_a = expand(&proj_a);
    let table_b = expand(&proj_b);

    let fp_a = Resolver::new(&proj_a, &source, &table_a)
        .fingerprint(table_a.get("solo").unwrap())?;
    let fp_b = Resolver::new(&proj_b, &source, &table_b)
        .fingerprint(table_b.get("solo").unwrap())?;

    assert_ne!(fp_a, fp_b);
    Ok(())
}
