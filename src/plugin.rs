// src/plugin.rs

//! Compile-time plugin registry.
//!
//! Plugins register named types: cache variants, dependency variants, and
//! commands. There is no runtime code loading; a plugin is a function
//! compiled into the binary and keyed by its dotted module path. The
//! `[plugins]` config section selects which registered plugins are active
//! for a project.

use std::collections::BTreeMap;

use crate::cache::{CacheBackend, LocalCache, RemoteCache, RepoCache, Uncached};
use crate::config::loader::Project;
use crate::config::model::{CacheConf, CmdConf, DepSpec};
use crate::errors::{Error, Result};

/// Builds a cache backend from a `[caches.<name>]` entry.
pub type CacheFactory =
    fn(name: &str, conf: &CacheConf, project: &Project) -> Result<Box<dyn CacheBackend>>;

/// Builds a dependency from a raw config table with an unrecognized
/// `type` tag.
pub type DepFactory = fn(table: &BTreeMap<String, toml::Value>) -> Result<DepSpec>;

/// Entry point of a compiled-in plugin.
pub type PluginInit = fn(&mut Registry);

pub struct Registry {
    cache_types: BTreeMap<String, CacheFactory>,
    dep_types: BTreeMap<String, DepFactory>,
    commands: BTreeMap<String, CmdConf>,
    plugins: BTreeMap<String, PluginInit>,
}

impl Registry {
    /// A registry with the builtin types registered.
    pub fn builtin() -> Self {
        let mut registry = Self {
            cache_types: BTreeMap::new(),
            dep_types: BTreeMap::new(),
            commands: BTreeMap::new(),
            plugins: BTreeMap::new(),
        };

        registry.register_cache_type("local", |_, _, project| {
            Ok(Box::new(LocalCache::new(project)))
        });
        registry.register_cache_type("repo", |_, _, project| {
            Ok(Box::new(RepoCache::new(project)))
        });
        registry.register_cache_type("none", |_, _, _| Ok(Box::new(Uncached)));
        registry.register_cache_type("remote", |name, conf, project| {
            Ok(Box::new(RemoteCache::from_conf(project, name, conf)?))
        });

        registry
    }

    pub fn register_cache_type(&mut self, tag: &str, factory: CacheFactory) {
        self.cache_types.insert(tag.to_string(), factory);
    }

    pub fn register_dep_type(&mut self, tag: &str, factory: DepFactory) {
        self.dep_types.insert(tag.to_string(), factory);
    }

    /// Register a command contributed by a plugin. Project config wins on
    /// name collisions.
    pub fn register_command(&mut self, name: &str, conf: CmdConf) {
        self.commands.insert(name.to_string(), conf);
    }

    /// Make a compiled-in plugin available under its dotted path.
    pub fn register_plugin(&mut self, path: &str, init: PluginInit) {
        self.plugins.insert(path.to_string(), init);
    }

    /// Activate the plugins named in `[plugins]`.
    pub fn load_plugins(&mut self, declared: &BTreeMap<String, String>) -> Result<()> {
        // Collect first: init callbacks mutate the registry.
        let mut inits = Vec::new();
        for path in declared.values() {
            match self.plugins.get(path) {
                Some(init) => inits.push(*init),
                None => return Err(Error::UnknownPlugin(path.clone())),
            }
        }
        for init in inits {
            init(self);
        }
        Ok(())
    }

    pub fn has_cache_type(&self, tag: &str) -> bool {
        self.cache_types.contains_key(tag)
    }

    pub fn make_cache(
        &self,
        name: &str,
        conf: &CacheConf,
        project: &Project,
    ) -> Result<Box<dyn CacheBackend>> {
        match self.cache_types.get(&conf.r#type) {
            Some(factory) => factory(name, conf, project),
            None => Err(Error::UnknownCache(format!(
                "{name} (type '{}')",
                conf.r#type
            ))),
        }
    }

    pub fn make_dep(&self, table: &BTreeMap<String, toml::Value>) -> Result<DepSpec> {
        let tag = table
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ConfigParse("dependency table missing 'type'".into()))?;

        match self.dep_types.get(tag) {
            Some(factory) => factory(table),
            None => Err(Error::PluginImport(format!(
                "dep type '{tag}' not provided by any plugin"
            ))),
        }
    }

    pub fn commands(&self) -> &BTreeMap<String, CmdConf> {
        &self.commands
    }
}
