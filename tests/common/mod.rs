// tests/common/mod.rs

//! Shared fixtures: in-memory hash sources and config construction.

use std::collections::BTreeMap;
use std::path::Path;

use qik::cmd::{self, RunnableTable};
use qik::config::loader::Project;
use qik::config::model::ConfigFile;
use qik::ctx::Ctx;
use qik::errors::{Error, Result};
use qik::hash::{DistVersion, HashSource};
use qik::plugin::Registry;

/// Build a project rooted at `root` from inline TOML.
pub fn project(root: &Path, toml_src: &str) -> Project {
    let cfg: ConfigFile = toml::from_str(toml_src).expect("config parses");
    Project::new(root, cfg)
}

/// Expand a project's commands with a default context.
pub fn expand(project: &Project) -> RunnableTable {
    let registry = Registry::builtin();
    let ctx = Ctx::resolve(project.config(), None).expect("ctx resolves");
    cmd::expand(project, &ctx, &registry).expect("expansion succeeds")
}

/// A deterministic in-memory hash source.
///
/// Globs match exactly, or by prefix when they end in `*`. Distribution
/// versions come from a fixed map.
#[derive(Debug, Clone, Default)]
pub struct FakeSource {
    pub files: BTreeMap<String, String>,
    pub dists: BTreeMap<String, String>,
}

impl FakeSource {
    pub fn with_files<const N: usize>(files: [(&str, &str); N]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(p, h)| (p.to_string(), h.to_string()))
                .collect(),
            dists: BTreeMap::new(),
        }
    }

    pub fn set_file(&mut self, path: &str, hash: &str) {
        self.files.insert(path.to_string(), hash.to_string());
    }

    pub fn set_dist(&mut self, name: &str, version: &str) {
        self.dists.insert(name.to_string(), version.to_string());
    }
}

impl HashSource for FakeSource {
    fn hash_files(&self, globs: &[String]) -> Result<Vec<(String, String)>> {
        let mut out = BTreeMap::new();
        for glob in globs {
            if let Some(prefix) = glob.strip_suffix('*') {
                for (path, hash) in &self.files {
                    if path.starts_with(prefix) {
                        out.insert(path.clone(), hash.clone());
                    }
                }
            } else if let Some(hash) = self.files.get(glob) {
                out.insert(glob.clone(), hash.clone());
            }
        }
        Ok(out.into_iter().collect())
    }

    fn dist_version(&self, name: &str, space: &qik::venv::Space) -> Result<DistVersion> {
        match self.dists.get(name) {
            Some(version) => Ok(DistVersion::Version(version.clone())),
            None => Err(Error::MissingDist {
                name: name.to_string(),
                space: space.name.clone(),
            }),
        }
    }
}
