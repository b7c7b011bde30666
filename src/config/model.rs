// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

/// Top-level configuration as read from `qik.toml`.
///
/// ```toml
/// [commands.lint]
/// exec = "ruff check {module.dir}"
/// deps = ["{module.dir}/**/*.py", { type = "pydist", name = "ruff" }]
/// cache = "repo"
///
/// [spaces.default]
/// modules = ["libs/a", "libs/b"]
///
/// [base]
/// deps = ["qik.toml"]
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFile {
    /// All commands from `[commands.<name>]`.
    #[serde(default)]
    pub commands: BTreeMap<String, CmdConf>,

    /// All spaces from `[spaces.<name>]`.
    #[serde(default)]
    pub spaces: BTreeMap<String, SpaceConf>,

    /// Custom cache backends from `[caches.<name>]`.
    #[serde(default)]
    pub caches: BTreeMap<String, CacheConf>,

    /// Plugin registrations from `[plugins]`, name -> dotted path.
    #[serde(default)]
    pub plugins: BTreeMap<String, String>,

    /// Typed context variables declared at project scope.
    #[serde(default)]
    pub vars: Vec<VarConf>,

    /// Context values from `[ctx.<profile>.<namespace>]`.
    #[serde(default)]
    pub ctx: BTreeMap<String, BTreeMap<String, BTreeMap<String, toml::Value>>>,

    /// Base dependencies prepended to every runnable.
    #[serde(default)]
    pub base: BaseConf,

    /// Project-wide defaults for command fields.
    #[serde(default)]
    pub defaults: DefaultsConf,

    /// Python distribution resolution settings.
    #[serde(default)]
    pub pydist: PydistConf,

    /// Watch loop behaviour from `[watch]`.
    #[serde(default)]
    pub watch: WatchConf,
}

/// `[commands.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct CmdConf {
    /// The shell string to execute. May contain `{module...}`, `{space}`,
    /// and `{ctx...}` placeholders.
    #[serde(default)]
    pub exec: String,

    /// Ordered dependency list.
    #[serde(default)]
    pub deps: Vec<DepConf>,

    /// Artifact glob patterns produced by the command.
    #[serde(default)]
    pub artifacts: Vec<String>,

    /// Cache name. Falls back to `[defaults].cache`, then "none".
    #[serde(default)]
    pub cache: Option<String>,

    /// When to store a finished run. Falls back to `[defaults].cache-when`.
    #[serde(default)]
    pub cache_when: Option<CachePolicy>,

    /// Space this command runs in. `None` means the default space.
    #[serde(default)]
    pub space: Option<String>,

    /// Default `isolated` flag for edges into this command.
    #[serde(default)]
    pub isolated: Option<bool>,
}

/// A dependency as written in config: either a bare glob string or a
/// tagged table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DepConf {
    Glob(String),
    Spec(DepSpec),
    /// A table whose `type` tag is not built in; resolved through the
    /// plugin registry.
    Other(BTreeMap<String, toml::Value>),
}

/// Tagged dependency variants.
///
/// `lock` is the plugin-emitted variant: its lockfile is hashed like a glob
/// and the declared lock command becomes a strict upstream edge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DepSpec {
    Glob {
        pattern: String,
    },
    Const {
        val: String,
    },
    Pydist {
        name: String,
    },
    Command {
        name: String,
        #[serde(default)]
        strict: bool,
        #[serde(default)]
        isolated: Option<bool>,
    },
    Lock {
        path: String,
        cmd: String,
        #[serde(default)]
        default: Vec<String>,
    },
}

/// Cache write policy (`cache-when`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Store only runs that exited 0.
    #[default]
    Success,
    /// Store any run that reached a terminal exit.
    Finished,
    /// Store even runs terminated by an external signal.
    Always,
    /// Never store.
    Never,
}

/// `[spaces.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct SpaceConf {
    /// Virtual environment for this space.
    #[serde(default)]
    pub venv: Option<VenvConf>,

    /// Dotenv file(s) loaded into the environment of runnables in this space.
    #[serde(default)]
    pub dotenv: Vec<String>,

    /// Modules belonging to this space.
    #[serde(default)]
    pub modules: Vec<ModuleConf>,

    /// Import fence globs. Opaque to the runner; consumed by plugins.
    #[serde(default)]
    pub fence: Vec<String>,

    /// Directory prefix that roots this space within the repository.
    #[serde(default)]
    pub root: Option<String>,
}

/// Virtual environment configuration: either a bare directory path or a
/// table with lock / install settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VenvConf {
    Dir(String),
    Spec(VenvSpec),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct VenvSpec {
    /// Venv directory. Defaults to the managed `._qik/venv/<space>` dir.
    #[serde(default)]
    pub dir: Option<String>,

    /// Lock file(s) pinning the venv contents.
    #[serde(default)]
    pub lock: Vec<String>,

    /// Name of the command that installs this venv. When set, the expander
    /// injects it as a strict upstream of every runnable in the space.
    #[serde(default)]
    pub install_cmd: Option<String>,
}

/// A module: either a bare path (name derived from it) or `{name, path}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModuleConf {
    Path(String),
    Named { name: String, path: String },
}

impl ModuleConf {
    pub fn name(&self) -> &str {
        match self {
            ModuleConf::Path(path) => path.rsplit('/').next().unwrap_or(path),
            ModuleConf::Named { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ModuleConf::Path(path) => path,
            ModuleConf::Named { path, .. } => path,
        }
    }
}

/// `[caches.<name>]` section. The `type` tag is looked up in the plugin
/// registry; remaining keys are backend-specific.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConf {
    pub r#type: String,

    #[serde(flatten)]
    pub options: BTreeMap<String, toml::Value>,
}

/// A typed context variable: either a bare name (string, required) or a
/// full declaration.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VarConf {
    Name(String),
    Spec(VarSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VarSpec {
    pub name: String,

    #[serde(default)]
    pub r#type: VarType,

    #[serde(default)]
    pub default: Option<toml::Value>,

    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    #[default]
    Str,
    Int,
    Bool,
}

/// `[base]` section: dependencies shared by every runnable.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BaseConf {
    #[serde(default)]
    pub deps: Vec<DepConf>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct DefaultsConf {
    #[serde(default)]
    pub cache: Option<String>,

    #[serde(default)]
    pub cache_when: Option<CachePolicy>,
}

/// `[pydist]` section.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct PydistConf {
    /// Version overrides consulted before any site-packages lookup.
    #[serde(default)]
    pub versions: BTreeMap<String, String>,

    /// Treat missing distributions as a fingerprint sentinel instead of an
    /// error.
    #[serde(default)]
    pub ignore_missing: bool,
}

/// `[watch]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchConf {
    /// `"queue"` (default): wait for the active run, then coalesce all
    /// accumulated changes into one re-run.
    /// `"cancel"`: cancel the active run before starting the new one.
    #[serde(default = "default_while_running")]
    pub while_running: String,

    /// Debounce window for filesystem event bursts.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_while_running() -> String {
    "queue".to_string()
}

fn default_debounce_ms() -> u64 {
    200
}

impl Default for WatchConf {
    fn default() -> Self {
        Self {
            while_running: default_while_running(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl CmdConf {
    /// Effective cache name after applying `[defaults]`.
    pub fn effective_cache(&self, defaults: &DefaultsConf) -> String {
        self.cache
            .clone()
            .or_else(|| defaults.cache.clone())
            .unwrap_or_else(|| "none".to_string())
    }

    /// Effective cache policy after applying `[defaults]`.
    pub fn effective_cache_when(&self, defaults: &DefaultsConf) -> CachePolicy {
        self.cache_when
            .or(defaults.cache_when)
            .unwrap_or_default()
    }
}
