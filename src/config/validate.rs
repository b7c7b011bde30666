// src/config/validate.rs

use std::collections::BTreeSet;

use crate::config::model::{ConfigFile, DepConf, DepSpec, VarConf};
use crate::errors::{Error, Result};
use crate::plugin::Registry;

/// Run semantic validation against a loaded configuration.
///
/// This checks:
/// - `command` / `lock` dependencies refer to existing commands
/// - command `space` assignments refer to existing spaces
/// - cache names refer to builtin backends or `[caches]` entries
/// - `[caches]` types are registered
/// - venv `install-cmd` references exist
/// - ctx sections only use known namespaces
///
/// Cycle detection happens later, when the DAG is built from the expanded
/// runnables — config-level names cannot see through parametrization.
pub fn validate_config(cfg: &ConfigFile, registry: &Registry) -> Result<()> {
    validate_command_refs(cfg)?;
    validate_space_refs(cfg)?;
    validate_cache_refs(cfg, registry)?;
    validate_ctx(cfg)?;
    validate_watch(cfg)?;
    Ok(())
}

fn validate_watch(cfg: &ConfigFile) -> Result<()> {
    match cfg.watch.while_running.as_str() {
        "queue" | "cancel" => Ok(()),
        other => Err(Error::ConfigParse(format!(
            "invalid [watch].while-running '{other}' (expected \"queue\" or \"cancel\")"
        ))),
    }
}

fn dep_command_name(dep: &DepConf) -> Option<&str> {
    match dep {
        DepConf::Spec(DepSpec::Command { name, .. }) => Some(name),
        DepConf::Spec(DepSpec::Lock { cmd, .. }) => Some(cmd),
        _ => None,
    }
}

fn validate_command_refs(cfg: &ConfigFile) -> Result<()> {
    let all_deps = cfg
        .commands
        .iter()
        .flat_map(|(name, cmd)| cmd.deps.iter().map(move |d| (name.as_str(), d)))
        .chain(cfg.base.deps.iter().map(|d| ("base", d)));

    for (_owner, dep) in all_deps {
        if let Some(target) = dep_command_name(dep) {
            if !cfg.commands.contains_key(target) {
                return Err(Error::UnknownCommand(target.to_string()));
            }
        }
    }

    for space in cfg.spaces.values() {
        if let Some(crate::config::model::VenvConf::Spec(spec)) = &space.venv {
            if let Some(install) = &spec.install_cmd {
                if !cfg.commands.contains_key(install) {
                    return Err(Error::UnknownCommand(install.clone()));
                }
            }
        }
    }

    Ok(())
}

fn validate_space_refs(cfg: &ConfigFile) -> Result<()> {
    let mut known: BTreeSet<&str> = cfg.spaces.keys().map(|s| s.as_str()).collect();
    known.insert("default");

    for (name, cmd) in cfg.commands.iter() {
        if let Some(space) = &cmd.space {
            if !known.contains(space.as_str()) {
                return Err(Error::ConfigParse(format!(
                    "command '{name}' is assigned to unknown space '{space}'"
                )));
            }
        }
    }

    Ok(())
}

fn validate_cache_refs(cfg: &ConfigFile, registry: &Registry) -> Result<()> {
    for (name, conf) in cfg.caches.iter() {
        if !registry.has_cache_type(&conf.r#type) {
            return Err(Error::UnknownCache(format!("{name} (type '{}')", conf.r#type)));
        }
    }

    for cmd in cfg.commands.values() {
        if let Some(cache) = &cmd.cache {
            if !is_known_cache(cfg, cache) {
                return Err(Error::UnknownCache(cache.clone()));
            }
        }
    }

    if let Some(cache) = &cfg.defaults.cache {
        if !is_known_cache(cfg, cache) {
            return Err(Error::UnknownCache(cache.clone()));
        }
    }

    Ok(())
}

fn is_known_cache(cfg: &ConfigFile, name: &str) -> bool {
    matches!(name, "local" | "repo" | "none") || cfg.caches.contains_key(name)
}

fn validate_ctx(cfg: &ConfigFile) -> Result<()> {
    let declared: BTreeSet<&str> = cfg
        .vars
        .iter()
        .map(|v| match v {
            VarConf::Name(name) => name.as_str(),
            VarConf::Spec(spec) => spec.name.as_str(),
        })
        .collect();

    for (profile, namespaces) in cfg.ctx.iter() {
        for (namespace, values) in namespaces.iter() {
            match namespace.as_str() {
                "qik" => {}
                "project" => {
                    for key in values.keys() {
                        if !declared.contains(key.as_str()) {
                            return Err(Error::CtxMissing(format!(
                                "project.{key} (set in profile '{profile}' but never declared in vars)"
                            )));
                        }
                    }
                }
                other => return Err(Error::CtxNamespace(other.to_string())),
            }
        }
    }

    Ok(())
}
