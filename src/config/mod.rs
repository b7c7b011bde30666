// src/config/mod.rs

//! Configuration loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Discover and load `qik.toml` from disk (`loader.rs`).
//! - Validate references and invariants (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{find_config_path, load_and_validate, load_from_path, Project};
pub use model::{
    BaseConf, CacheConf, CachePolicy, CmdConf, ConfigFile, DepConf, DepSpec, DefaultsConf,
    ModuleConf, PydistConf, SpaceConf, VarConf, VarSpec, VarType, VenvConf, VenvSpec, WatchConf,
};
pub use validate::validate_config;
