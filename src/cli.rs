// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

use crate::config::model::CachePolicy;
use crate::dag::select::CacheStatus;

/// Command-line arguments for `qik`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "qik",
    version,
    about = "Cached command runner for modular monorepos.",
    long_about = None
)]
pub struct CliArgs {
    /// Command name(s) to select, exact or glob.
    pub commands: Vec<String>,

    /// Select commands by module. Repeatable.
    #[arg(short = 'm', long = "module", value_name = "MODULE")]
    pub modules: Vec<String>,

    /// Select commands by space. Repeatable.
    #[arg(short = 's', long = "space", value_name = "SPACE")]
    pub spaces: Vec<String>,

    /// Number of worker slots. Defaults to the logical CPU count.
    #[arg(short = 'n', long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Don't read caches.
    #[arg(short = 'f', long = "force")]
    pub force: bool,

    /// Don't run dependent commands.
    #[arg(long)]
    pub isolated: bool,

    /// Watch for changes and re-run.
    #[arg(long)]
    pub watch: bool,

    /// Select commands whose files changed since this git ref.
    #[arg(long, value_name = "REF")]
    pub since: Option<String>,

    /// List selected commands instead of running them.
    #[arg(long)]
    pub ls: bool,

    /// Exit non-zero if any commands are selected.
    #[arg(long)]
    pub fail: bool,

    /// Route lookups and stores through this cache backend.
    #[arg(long, value_name = "NAME")]
    pub cache: Option<String>,

    /// Override every runnable's cache policy.
    #[arg(long = "cache-when", value_enum, value_name = "POLICY")]
    pub cache_when: Option<CacheWhenArg>,

    /// Select by cache status (probes without executing).
    #[arg(long = "cache-status", value_enum, value_name = "STATUS")]
    pub cache_status: Option<CacheStatusArg>,

    /// Select by cache backend type. Repeatable.
    #[arg(long = "cache-type", value_name = "TYPE")]
    pub cache_types: Vec<String>,

    /// Context profile.
    #[arg(short = 'p', long = "profile", value_name = "NAME")]
    pub profile: Option<String>,

    /// Verbosity (0 = quiet, 1 = progress, 2 = debug).
    #[arg(short = 'v', long = "verbosity", value_name = "LEVEL")]
    pub verbosity: Option<u8>,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum CacheWhenArg {
    Success,
    Finished,
    Always,
    Never,
}

impl From<CacheWhenArg> for CachePolicy {
    fn from(arg: CacheWhenArg) -> Self {
        match arg {
            CacheWhenArg::Success => CachePolicy::Success,
            CacheWhenArg::Finished => CachePolicy::Finished,
            CacheWhenArg::Always => CachePolicy::Always,
            CacheWhenArg::Never => CachePolicy::Never,
        }
    }
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum CacheStatusArg {
    Warm,
    Cold,
}

impl From<CacheStatusArg> for CacheStatus {
    fn from(arg: CacheStatusArg) -> Self {
        match arg {
            CacheStatusArg::Warm => CacheStatus::Warm,
            CacheStatusArg::Cold => CacheStatus::Cold,
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
