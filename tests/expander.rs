// tests/expander.rs

//! Command expansion: parametrization, placeholders, context resolution.

mod common;

use std::error::Error;
use std::path::Path;

use common::{expand, project, FakeSource};
use qik::cmd;
use qik::ctx::Ctx;
use qik::deps::{Dep, Resolver};
use qik::plugin::Registry;

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn module_parametric_commands_expand_per_module() -> TestResult {
    let config = r#"
[commands.lint]
exec = "ruff check {module.dir}"
deps = ["{module.dir}/**.py"]

[spaces.default]
modules = ["libs/core", { name = "web", path = "apps/web" }]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);

    let slugs: Vec<_> = table.slugs().collect();
    assert_eq!(slugs, vec!["lint@core", "lint@web"]);

    let core = table.get("lint@core").unwrap();
    assert_eq!(core.exec, "ruff check libs/core");
    assert_eq!(core.module.as_deref(), Some("core"));

    let web = table.get("lint@web").unwrap();
    assert_eq!(web.exec, "ruff check apps/web");
    assert!(web.deps.contains(&Dep::Glob("apps/web/**.py".into())));
    Ok(())
}

#[test]
fn space_parametric_commands_expand_per_space() -> TestResult {
    let config = r#"
[commands.install]
exec = "pip sync --space {space}"

[spaces.default]

[spaces.py312]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);

    let slugs: Vec<_> = table.slugs().collect();
    assert_eq!(slugs, vec!["install", "install@py312"]);
    assert_eq!(
        table.get("install@py312").unwrap().exec,
        "pip sync --space py312"
    );
    assert_eq!(table.get("install").unwrap().exec, "pip sync --space default");
    Ok(())
}

#[test]
fn non_parametric_commands_emit_exactly_one_runnable() -> TestResult {
    let config = r#"
[commands.docs]
exec = "mkdocs build"

[spaces.default]
modules = ["libs/a", "libs/b"]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    assert_eq!(table.len(), 1);
    assert!(table.get("docs").is_some());
    Ok(())
}

#[test]
fn pyimport_placeholder_dots_the_path() -> TestResult {
    let config = r#"
[commands.typecheck]
exec = "mypy -m {module.pyimport}"

[spaces.default]
modules = ["libs/core"]
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    assert_eq!(table.get("typecheck@core").unwrap().exec, "mypy -m libs.core");
    Ok(())
}

#[test]
fn ctx_placeholders_resolve_from_the_active_profile() -> TestResult {
    let config = r#"
vars = ["target"]

[commands.build]
exec = "cargo build --target {ctx.project.target}"

[ctx.default.project]
target = "x86_64-unknown-linux-gnu"
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    assert_eq!(
        table.get("build").unwrap().exec,
        "cargo build --target x86_64-unknown-linux-gnu"
    );
    Ok(())
}

#[test]
fn required_var_without_value_fails() -> TestResult {
    let config = r#"
vars = ["target"]

[commands.build]
exec = "echo {ctx.project.target}"
"#;
    let proj = project(Path::new("/repo"), config);
    let err = Ctx::resolve(proj.config(), None).unwrap_err();
    assert_eq!(err.code(), "ctx0");
    Ok(())
}

#[test]
fn var_type_cast_failure_is_reported() -> TestResult {
    let config = r#"
vars = [{ name = "count", type = "int" }]

[commands.noop]
exec = "true"

[ctx.default.project]
count = "not-a-number"
"#;
    let proj = project(Path::new("/repo"), config);
    let err = Ctx::resolve(proj.config(), None).unwrap_err();
    assert_eq!(err.code(), "ctx1");
    Ok(())
}

#[test]
fn bool_vars_accept_the_documented_literals() -> TestResult {
    let config = r#"
vars = [{ name = "strict", type = "bool" }]

[commands.noop]
exec = "true"

[ctx.default.project]
strict = "Yes"
"#;
    let proj = project(Path::new("/repo"), config);
    let ctx = Ctx::resolve(proj.config(), None)?;
    assert!(ctx.get("project", "strict").unwrap().as_bool());
    Ok(())
}

#[test]
fn unknown_profile_is_rejected() -> TestResult {
    let proj = project(Path::new("/repo"), "[commands.noop]\nexec = \"true\"\n");
    let err = Ctx::resolve(proj.config(), Some("staging".into())).unwrap_err();
    assert_eq!(err.code(), "conf6");
    Ok(())
}

#[test]
fn unknown_placeholders_are_config_errors() -> TestResult {
    let config = r#"
[commands.broken]
exec = "echo {not.a.thing}"
"#;
    let proj = project(Path::new("/repo"), config);
    let registry = Registry::builtin();
    let ctx = Ctx::resolve(proj.config(), None)?;
    let err = cmd::expand(&proj, &ctx, &registry).unwrap_err();
    assert_eq!(err.code(), "conf1");
    Ok(())
}

#[test]
fn defaults_apply_to_cache_and_policy() -> TestResult {
    let config = r#"
[commands.build]
exec = "true"

[defaults]
cache = "repo"
cache-when = "finished"
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let runnable = table.get("build").unwrap();
    assert_eq!(runnable.cache, "repo");
    assert_eq!(
        runnable.cache_when,
        qik::config::model::CachePolicy::Finished
    );
    Ok(())
}

#[test]
fn venv_install_cmd_is_injected_as_a_strict_upstream() -> TestResult {
    let config = r#"
[commands.install]
exec = "uv pip sync lock.txt"
space = "main"

[commands.test]
exec = "pytest"
space = "main"

[spaces.main]
venv = { lock = ["lock.txt"], install-cmd = "install" }
"#;
    let proj = project(Path::new("/repo"), config);
    let table = expand(&proj);
    let source = FakeSource::default();
    let resolver = Resolver::new(&proj, &source, &table);

    let test = table.get("test@main").expect("test runnable");
    let edges = resolver.edges(test);
    assert!(edges.iter().any(|e| e.upstream == "install@main" && e.strict));

    // The install command itself must not depend on itself.
    let install = table.get("install@main").expect("install runnable");
    assert!(resolver.edges(install).is_empty());
    Ok(())
}
