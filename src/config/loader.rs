// src/config/loader.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, SpaceConf};
use crate::config::validate::validate_config;
use crate::errors::{Error, Result};
use crate::plugin::Registry;

/// The resolved project: configuration plus the directory it was loaded
/// from. Immutable for the life of the process and threaded explicitly
/// through the components that need it.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    config: ConfigFile,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>, config: ConfigFile) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Absolute project root (the directory containing `qik.toml`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Private working directory. Never committed; a `.gitignore` is
    /// maintained inside it on first write.
    pub fn priv_work_dir(&self) -> PathBuf {
        self.root.join("._qik")
    }

    /// Repo-tracked working directory used by the `repo` cache.
    pub fn pub_work_dir(&self) -> PathBuf {
        self.root.join(".qik")
    }

    /// Spaces with the implicit `default` space materialized when no
    /// spaces are configured.
    pub fn spaces(&self) -> BTreeMap<String, SpaceConf> {
        let mut spaces = self.config.spaces.clone();
        spaces
            .entry("default".to_string())
            .or_insert_with(SpaceConf::default);
        spaces
    }

}

/// Walk upward from `start`, looking for `qik.toml`. The search stops at
/// the first directory containing `.git` (the repository boundary), taking
/// the deepest `qik.toml` found on the way up.
pub fn find_config_path(start: &Path) -> Result<PathBuf> {
    let mut found: Option<PathBuf> = None;

    for dir in start.ancestors() {
        let candidate = dir.join("qik.toml");
        if candidate.is_file() && found.is_none() {
            found = Some(candidate);
        }
        if dir.join(".git").is_dir() {
            break;
        }
    }

    found.ok_or(Error::ConfigNotFound)
}

/// Load a configuration file from a given path.
///
/// This only performs TOML deserialization; it does **not** perform
/// semantic validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|_| Error::ConfigNotFound)?;

    let config: ConfigFile =
        toml::from_str(&contents).map_err(|e| Error::ConfigParse(e.to_string()))?;

    debug!(path = %path.display(), "loaded qik.toml");
    Ok(config)
}

/// Discover, load and validate the project configuration.
///
/// This is the entry point for the rest of the application:
/// - walks up from `cwd` to find `qik.toml`
/// - parses the TOML
/// - resolves plugin registrations against the compiled-in registry
/// - validates command / cache / space references and ctx declarations
pub fn load_and_validate(cwd: &Path, registry: &mut Registry) -> Result<Project> {
    let path = find_config_path(cwd)?;
    let mut config = load_from_path(&path)?;

    // Plugins may contribute commands and backend types before validation.
    registry.load_plugins(&config.plugins)?;
    for (name, cmd) in registry.commands() {
        config.commands.entry(name.clone()).or_insert_with(|| cmd.clone());
    }

    validate_config(&config, registry)?;

    let root = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(Project::new(root, config))
}
