// src/errors.rs

//! Crate-wide error taxonomy.
//!
//! Every variant carries a stable short identifier used in diagnostics so
//! errors can be looked up in the docs (`https://qik.build/errors/#<id>`).
//! The identifier never changes once released, even if the message does.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("could not locate a qik.toml configuration file")]
    ConfigNotFound,

    #[error("error parsing qik.toml: {0}")]
    ConfigParse(String),

    #[error("module '{0}' is not configured")]
    UnknownModule(String),

    #[error("plugin '{0}' is not registered")]
    UnknownPlugin(String),

    #[error("command '{0}' is not configured")]
    UnknownCommand(String),

    #[error("cache '{0}' is not configured")]
    UnknownCache(String),

    #[error("context profile '{0}' is not configured")]
    UnknownProfile(String),

    #[error("no value supplied for ctx variable '{0}'")]
    CtxMissing(String),

    #[error("unable to cast ctx '{key}' value '{val}' as {ty}")]
    CtxTypeCast { key: String, val: String, ty: String },

    #[error("invalid ctx namespace '{0}'")]
    CtxNamespace(String),

    #[error("cycle detected in command graph: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("could not load plugin '{0}'")]
    PluginImport(String),

    #[error("distribution '{name}' not found in space '{space}'")]
    MissingDist { name: String, space: String },

    #[error("no distribution found for module '{0}'")]
    MissingModuleDist(String),

    #[error("a venv lock file must be configured for space '{0}' to use this selector")]
    LockFileRequired(String),

    #[error("space '{0}' has no venv configured")]
    VenvNotConfigured(String),

    #[error("failed to run subprocess for '{runnable}': {reason}")]
    SubprocessFailed { runnable: String, reason: String },

    #[error("cache I/O error: {0}")]
    CacheIo(String),

    #[error("remote cache unavailable: {0}")]
    RemoteCacheUnavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Stable identifier for docs lookup.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigNotFound => "conf0",
            Error::ConfigParse(_) => "conf1",
            Error::UnknownModule(_) => "conf2",
            Error::UnknownPlugin(_) => "conf3",
            Error::UnknownCommand(_) => "conf4",
            Error::UnknownCache(_) => "conf5",
            Error::UnknownProfile(_) => "conf6",
            Error::CtxMissing(_) => "ctx0",
            Error::CtxTypeCast { .. } => "ctx1",
            Error::CtxNamespace(_) => "ctx2",
            Error::CycleDetected(_) => "graph0",
            Error::PluginImport(_) => "plugin0",
            Error::MissingDist { .. } => "venv0",
            Error::MissingModuleDist(_) => "venv1",
            Error::LockFileRequired(_) => "venv2",
            Error::VenvNotConfigured(_) => "venv3",
            Error::SubprocessFailed { .. } => "exec0",
            Error::CacheIo(_) => "cache0",
            Error::RemoteCacheUnavailable(_) => "cache1",
            Error::Cancelled => "run0",
            Error::Internal(_) => "internal",
        }
    }

    /// Coarse process exit code for this error category.
    ///
    /// Configuration and selection errors exit 2; internal errors exit 3.
    /// Runnable failures are not errors at this level (the scheduler exits 1
    /// on its own).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Internal(_) | Error::CacheIo(_) => 3,
            Error::Cancelled => 1,
            _ => 2,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
