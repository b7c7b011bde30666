// src/cmd/mod.rs

//! Command expansion: declarative command definitions become concrete
//! runnables.
//!
//! A command whose fields reference `{module...}` expands to one runnable
//! per (space, module) pair in scope; `{space}` alone expands per space.
//! Everything else emits exactly one runnable. Placeholder substitution is
//! handled by [`template`].

pub mod template;

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::loader::Project;
use crate::config::model::{CachePolicy, CmdConf, DepConf, DepSpec};
use crate::ctx::Ctx;
use crate::deps::Dep;
use crate::errors::Result;
use crate::plugin::Registry;
use crate::venv::{Module, Space};

pub use template::{format, TemplateEnv};

/// A concrete invocation produced by template expansion.
///
/// Identity is `(name, space, module)` and is globally unique; `slug` is
/// the filesystem-safe form of that identity.
#[derive(Debug, Clone)]
pub struct Runnable {
    /// The declaring command's name.
    pub name: String,
    /// `name[@space][@module]`.
    pub slug: String,
    /// Resolved shell string, placeholders substituted.
    pub exec: String,
    /// Concrete dependency list, base deps first.
    pub deps: Vec<Dep>,
    /// Artifact glob patterns.
    pub artifacts: Vec<String>,
    /// Cache backend name ("none" disables caching).
    pub cache: String,
    pub cache_when: CachePolicy,
    /// Space this runnable executes in.
    pub space: Option<String>,
    /// Module for module-parametric commands.
    pub module: Option<String>,
    /// Default `isolated` flag for edges pointing at this runnable.
    pub isolated: Option<bool>,
}

impl Runnable {
    pub fn space_name(&self) -> &str {
        self.space.as_deref().unwrap_or("default")
    }
}

fn make_slug(name: &str, space: Option<&str>, module: Option<&str>) -> String {
    let mut slug = name.to_string();
    if let Some(space) = space {
        if space != "default" {
            slug.push('@');
            slug.push_str(space);
        }
    }
    if let Some(module) = module {
        slug.push('@');
        slug.push_str(module);
    }
    slug
}

/// All runnables of a run, addressable by slug and by command name.
#[derive(Debug, Default)]
pub struct RunnableTable {
    by_slug: BTreeMap<String, Runnable>,
    by_command: BTreeMap<String, Vec<String>>,
}

impl RunnableTable {
    pub fn get(&self, slug: &str) -> Option<&Runnable> {
        self.by_slug.get(slug)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Runnable> {
        self.by_slug.values()
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.by_slug.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_slug.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slug.is_empty()
    }

    pub fn contains_command(&self, name: &str) -> bool {
        self.by_command.contains_key(name)
    }

    /// Slugs emitted by a command, filtered to those compatible with the
    /// given module: a module-parametric upstream only links to the
    /// downstream runnable of the same module.
    pub fn command_slugs(&self, name: &str, module: Option<&str>) -> Vec<String> {
        self.by_command
            .get(name)
            .map(|slugs| {
                slugs
                    .iter()
                    .filter(|slug| {
                        let upstream = &self.by_slug[*slug];
                        match (module, upstream.module.as_deref()) {
                            (Some(m), Some(um)) => m == um,
                            _ => true,
                        }
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert(&mut self, runnable: Runnable) {
        self.by_command
            .entry(runnable.name.clone())
            .or_default()
            .push(runnable.slug.clone());
        self.by_slug.insert(runnable.slug.clone(), runnable);
    }
}

/// Expand every configured command into runnables.
pub fn expand(project: &Project, ctx: &Ctx, registry: &Registry) -> Result<RunnableTable> {
    let cfg = project.config();
    let spaces = Space::load_all(project);
    let mut table = RunnableTable::default();

    for (name, conf) in cfg.commands.iter() {
        let text = parametric_text(conf);
        let scope: Vec<&Space> = match &conf.space {
            Some(wanted) => spaces.iter().filter(|s| &s.name == wanted).collect(),
            None => spaces.iter().collect(),
        };

        if template::is_module_parametric(&text) {
            for space in &scope {
                for module in &space.modules {
                    let runnable =
                        make_runnable(project, ctx, registry, name, conf, space, Some(module))?;
                    table.insert(runnable);
                }
            }
        } else if template::is_space_parametric(&text) {
            for space in &scope {
                let runnable = make_runnable(project, ctx, registry, name, conf, space, None)?;
                table.insert(runnable);
            }
        } else {
            let space_name = conf.space.as_deref().unwrap_or("default");
            let space = spaces
                .iter()
                .find(|s| s.name == space_name)
                .unwrap_or(&spaces[0]);
            let runnable = make_runnable(project, ctx, registry, name, conf, space, None)?;
            table.insert(runnable);
        }
    }

    debug!(runnables = table.len(), "expanded commands into runnables");
    Ok(table)
}

/// The concatenation of every templated field, used to decide whether a
/// command is parametric.
fn parametric_text(conf: &CmdConf) -> String {
    let mut text = conf.exec.clone();
    for artifact in &conf.artifacts {
        text.push_str(artifact);
    }
    for dep in &conf.deps {
        match dep {
            DepConf::Glob(glob) => text.push_str(glob),
            DepConf::Spec(spec) => match spec {
                DepSpec::Glob { pattern } => text.push_str(pattern),
                DepSpec::Const { val } => text.push_str(val),
                DepSpec::Pydist { name } => text.push_str(name),
                DepSpec::Command { name, .. } => text.push_str(name),
                DepSpec::Lock { path, .. } => text.push_str(path),
            },
            DepConf::Other(table) => {
                for val in table.values() {
                    if let toml::Value::String(s) = val {
                        text.push_str(s);
                    }
                }
            }
        }
    }
    text
}

fn make_runnable(
    project: &Project,
    ctx: &Ctx,
    registry: &Registry,
    name: &str,
    conf: &CmdConf,
    space: &Space,
    module: Option<&Module>,
) -> Result<Runnable> {
    let env = TemplateEnv {
        ctx,
        space: Some(&space.name),
        module,
    };
    let cfg = project.config();

    let mut deps = Vec::new();
    for dep in cfg.base.deps.iter().chain(conf.deps.iter()) {
        deps.push(resolve_dep(registry, dep, &env)?);
    }

    // Spaces with a managed venv get their install command as an implicit
    // upstream of everything that runs inside them.
    if let Some(install) = space.venv.as_ref().and_then(|v| v.install_cmd.clone()) {
        if install != name {
            deps.push(Dep::Command {
                name: install,
                strict: true,
                isolated: None,
            });
        }
    }

    let artifacts = conf
        .artifacts
        .iter()
        .map(|a| template::format(a, &env))
        .collect::<Result<Vec<_>>>()?;

    let space_field = if space.name == "default" && conf.space.is_none() {
        None
    } else {
        Some(space.name.clone())
    };

    Ok(Runnable {
        name: name.to_string(),
        slug: make_slug(
            name,
            space_field.as_deref(),
            module.map(|m| m.name.as_str()),
        ),
        exec: template::format(&conf.exec, &env)?,
        deps,
        artifacts,
        cache: template::format(&conf.effective_cache(&cfg.defaults), &env)?,
        cache_when: conf.effective_cache_when(&cfg.defaults),
        space: space_field,
        module: module.map(|m| m.name.clone()),
        isolated: conf.isolated,
    })
}

fn resolve_dep(registry: &Registry, dep: &DepConf, env: &TemplateEnv<'_>) -> Result<Dep> {
    let spec = match dep {
        DepConf::Glob(pattern) => DepSpec::Glob {
            pattern: pattern.clone(),
        },
        DepConf::Spec(spec) => spec.clone(),
        DepConf::Other(table) => registry.make_dep(table)?,
    };

    Ok(match spec {
        DepSpec::Glob { pattern } => Dep::Glob(template::format(&pattern, env)?),
        DepSpec::Const { val } => Dep::Const(template::format(&val, env)?),
        DepSpec::Pydist { name } => Dep::Pydist(template::format(&name, env)?),
        DepSpec::Command {
            name,
            strict,
            isolated,
        } => Dep::Command {
            name: template::format(&name, env)?,
            strict,
            isolated,
        },
        DepSpec::Lock { path, cmd, default } => Dep::Lock {
            path: template::format(&path, env)?,
            cmd: template::format(&cmd, env)?,
            default: default
                .iter()
                .map(|g| template::format(g, env))
                .collect::<Result<Vec<_>>>()?,
        },
    })
}
