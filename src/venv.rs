// src/venv.rs

//! Spaces and their virtual environments.
//!
//! A space pairs a venv, dotenv files, and a set of modules. The runner
//! cares about three things here: the modules a parametric command expands
//! over, the environment additions applied to subprocesses, and the
//! site-packages directory used for `pydist` version resolution.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use regex::Regex;
use tracing::debug;

use crate::config::loader::Project;
use crate::config::model::{ModuleConf, SpaceConf, VenvConf};
use crate::errors::Result;

/// A module within a space: a directory usable in command templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    /// Repository-root-relative, `/`-separated directory.
    pub dir: String,
}

impl Module {
    /// Python import path for the module directory (`a/b` -> `a.b`).
    pub fn pyimport(&self) -> String {
        self.dir.replace('/', ".")
    }
}

/// A resolved space.
#[derive(Debug, Clone)]
pub struct Space {
    pub name: String,
    pub root: Option<String>,
    pub modules: Vec<Module>,
    pub venv: Option<Venv>,
    pub dotenv: Vec<String>,
    pub fence: Vec<String>,
}

/// A resolved virtual environment.
#[derive(Debug, Clone)]
pub struct Venv {
    /// Absolute venv directory.
    pub dir: PathBuf,
    /// Lock file paths, root-relative.
    pub lock: Vec<String>,
    /// Command injected as a strict upstream of every runnable in the
    /// space, when configured.
    pub install_cmd: Option<String>,
}

impl Space {
    /// Resolve every configured space, including the implicit `default`.
    pub fn load_all(project: &Project) -> Vec<Self> {
        project
            .spaces()
            .iter()
            .map(|(name, conf)| Self::from_conf(project, name, conf))
            .collect()
    }

    fn from_conf(project: &Project, name: &str, conf: &SpaceConf) -> Self {
        let modules = conf
            .modules
            .iter()
            .map(|m| module_from_conf(m))
            .collect();

        let venv = conf.venv.as_ref().map(|v| Venv::from_conf(project, name, v));

        Self {
            name: name.to_string(),
            root: conf.root.clone(),
            modules,
            venv,
            dotenv: conf.dotenv.clone(),
            fence: conf.fence.clone(),
        }
    }

    /// Environment additions applied on top of the process environment when
    /// running commands in this space.
    pub fn environ_additions(&self) -> Vec<(String, String)> {
        let mut additions = Vec::new();

        if let Some(venv) = &self.venv {
            additions.push((
                "VIRTUAL_ENV".to_string(),
                venv.dir.to_string_lossy().to_string(),
            ));
            let bin = venv.dir.join("bin");
            let path = std::env::var("PATH").unwrap_or_default();
            additions.push((
                "PATH".to_string(),
                format!("{}:{}", bin.to_string_lossy(), path),
            ));
        }

        additions
    }

    /// Parse the space's dotenv files into key/value pairs.
    ///
    /// Later files win over earlier ones; the caller decides precedence
    /// against the ambient environment.
    pub fn dotenv_vars(&self, root: &Path) -> Result<Vec<(String, String)>> {
        let mut vars: BTreeMap<String, String> = BTreeMap::new();

        for file in &self.dotenv {
            let path = root.join(file);
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading dotenv file {}", path.display()))?;

            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, val)) = line.split_once('=') {
                    let val = val.trim().trim_matches('"').trim_matches('\'');
                    vars.insert(key.trim().to_string(), val.to_string());
                }
            }
        }

        Ok(vars.into_iter().collect())
    }
}

fn module_from_conf(conf: &ModuleConf) -> Module {
    Module {
        name: conf.name().to_string(),
        dir: conf.path().to_string(),
    }
}

impl Venv {
    fn from_conf(project: &Project, space: &str, conf: &VenvConf) -> Self {
        match conf {
            VenvConf::Dir(dir) => Self {
                dir: project.root().join(dir),
                lock: Vec::new(),
                install_cmd: None,
            },
            VenvConf::Spec(spec) => Self {
                dir: spec
                    .dir
                    .as_ref()
                    .map(|d| project.root().join(d))
                    .unwrap_or_else(|| project.priv_work_dir().join("venv").join(space)),
                lock: spec.lock.clone(),
                install_cmd: spec.install_cmd.clone(),
            },
        }
    }

    /// Locate the venv's site-packages directory.
    pub fn site_packages_dir(&self) -> Option<PathBuf> {
        let lib = self.dir.join("lib");
        let entries = fs::read_dir(&lib).ok()?;
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with("python")
            {
                let candidate = entry.path().join("site-packages");
                if candidate.is_dir() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Installed version of a distribution, read from `*.dist-info`
    /// directory names under site-packages.
    pub fn dist_version(&self, name: &str) -> Option<String> {
        let site = self.site_packages_dir()?;
        let re = Regex::new(r"^(.+)-([^-]+)\.dist-info$").ok()?;
        let wanted = normalize_dist_name(name);

        for entry in fs::read_dir(&site).ok()?.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(caps) = re.captures(&file_name) {
                if normalize_dist_name(&caps[1]) == wanted {
                    debug!(dist = name, version = &caps[2], "resolved dist from site-packages");
                    return Some(caps[2].to_string());
                }
            }
        }
        None
    }

    /// Version of a distribution pinned in the venv's lock files
    /// (`name==version` requirement lines).
    pub fn lockfile_version(&self, root: &Path, name: &str) -> Option<String> {
        let wanted = normalize_dist_name(name);

        for lock in &self.lock {
            let contents = fs::read_to_string(root.join(lock)).ok()?;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((dist, version)) = line.split_once("==") {
                    if normalize_dist_name(dist.trim()) == wanted {
                        return Some(version.trim().to_string());
                    }
                }
            }
        }
        None
    }
}

/// Normalize a distribution name the way packaging tools do.
pub fn normalize_dist_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;
    for ch in name.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}
