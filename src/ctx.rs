// src/ctx.rs

//! Context variables and runtime options.
//!
//! The resolved context is an immutable value built once at startup and
//! threaded explicitly through the components that need it. Lookup order
//! for a variable `NAMESPACE.NAME`:
//!
//! 1. environment variable `NAMESPACE__NAME` (uppercased)
//! 2. the active profile's `[ctx.<profile>.<namespace>]` value
//! 3. the variable's declared default
//! 4. error (`CtxMissing`) if the variable is required
//!
//! The `qik` namespace carries built-in runtime options (`workers`,
//! `force`, `isolated`, ...); the `project` namespace carries variables
//! declared in `vars = [...]`.

use std::collections::BTreeMap;

use crate::config::model::{ConfigFile, VarConf, VarSpec, VarType};
use crate::errors::{Error, Result};

/// A resolved, typed context value.
#[derive(Debug, Clone, PartialEq)]
pub enum CtxValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl CtxValue {
    /// String form used in template substitution.
    pub fn render(&self) -> String {
        match self {
            CtxValue::Str(s) => s.clone(),
            CtxValue::Int(i) => i.to_string(),
            CtxValue::Bool(b) => b.to_string(),
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, CtxValue::Bool(true))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CtxValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// The immutable resolved context.
#[derive(Debug, Clone)]
pub struct Ctx {
    profile: String,
    values: BTreeMap<(String, String), CtxValue>,
}

impl Ctx {
    /// Resolve the full context from configuration.
    ///
    /// `profile` comes from the CLI; falls back to `QIK__PROFILE`, then
    /// `"default"`. The `default` and `ci` profiles always exist even when
    /// not spelled out in `[ctx]`.
    pub fn resolve(cfg: &ConfigFile, profile: Option<String>) -> Result<Self> {
        let profile = profile
            .or_else(|| std::env::var("QIK__PROFILE").ok())
            .unwrap_or_else(|| "default".to_string());

        if profile != "default" && profile != "ci" && !cfg.ctx.contains_key(&profile) {
            return Err(Error::UnknownProfile(profile));
        }

        let mut ctx = Self {
            profile: profile.clone(),
            values: BTreeMap::new(),
        };

        for var in builtin_qik_vars() {
            let value = resolve_var(cfg, &profile, "qik", &var)?;
            ctx.values.insert(("qik".into(), var.name.clone()), value);
        }

        for var in cfg.vars.iter() {
            let spec = normalize_var(var);
            let value = resolve_var(cfg, &profile, "project", &spec)?;
            ctx.values
                .insert(("project".into(), spec.name.clone()), value);
        }

        Ok(ctx)
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&CtxValue> {
        self.values
            .get(&(namespace.to_string(), name.to_string()))
    }

    /// Lookup that fails with the taxonomy error used by templates.
    pub fn lookup(&self, namespace: &str, name: &str) -> Result<&CtxValue> {
        if namespace != "qik" && namespace != "project" {
            return Err(Error::CtxNamespace(namespace.to_string()));
        }
        self.get(namespace, name)
            .ok_or_else(|| Error::CtxMissing(format!("{namespace}.{name}")))
    }

    /// Overlay a value (used by the CLI layer, which wins over everything).
    pub fn set(&mut self, namespace: &str, name: &str, value: CtxValue) {
        self.values
            .insert((namespace.to_string(), name.to_string()), value);
    }

    /// Worker slot count for the scheduler.
    pub fn workers(&self) -> usize {
        self.get("qik", "workers")
            .and_then(|v| v.as_int())
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or_else(default_workers)
    }

    pub fn force(&self) -> bool {
        self.get("qik", "force").map(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn isolated(&self) -> bool {
        self.get("qik", "isolated")
            .map(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn verbosity(&self) -> i64 {
        self.get("qik", "verbosity")
            .and_then(|v| v.as_int())
            .unwrap_or(1)
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn builtin_qik_vars() -> Vec<VarSpec> {
    fn var(name: &str, ty: VarType, default: toml::Value) -> VarSpec {
        VarSpec {
            name: name.to_string(),
            r#type: ty,
            default: Some(default),
            required: false,
        }
    }

    vec![
        var(
            "workers",
            VarType::Int,
            toml::Value::Integer(default_workers() as i64),
        ),
        var("force", VarType::Bool, toml::Value::Boolean(false)),
        var("isolated", VarType::Bool, toml::Value::Boolean(false)),
        var("watch", VarType::Bool, toml::Value::Boolean(false)),
        var("verbosity", VarType::Int, toml::Value::Integer(1)),
        var(
            "arch",
            VarType::Str,
            toml::Value::String(std::env::consts::ARCH.to_string()),
        ),
    ]
}

fn normalize_var(var: &VarConf) -> VarSpec {
    match var {
        VarConf::Name(name) => VarSpec {
            name: name.clone(),
            r#type: VarType::Str,
            default: None,
            required: true,
        },
        VarConf::Spec(spec) => spec.clone(),
    }
}

fn resolve_var(
    cfg: &ConfigFile,
    profile: &str,
    namespace: &str,
    var: &VarSpec,
) -> Result<CtxValue> {
    let key = format!("{namespace}.{}", var.name);
    let env_key = format!("{namespace}__{}", var.name).to_uppercase().replace('-', "_");

    if let Ok(raw) = std::env::var(&env_key) {
        return cast_str(&key, &raw, var.r#type);
    }

    let profile_val = cfg
        .ctx
        .get(profile)
        .and_then(|namespaces| namespaces.get(namespace))
        .and_then(|values| values.get(&var.name));

    if let Some(val) = profile_val {
        return cast_toml(&key, val, var.r#type);
    }

    if let Some(default) = &var.default {
        return cast_toml(&key, default, var.r#type);
    }

    if var.required {
        Err(Error::CtxMissing(key))
    } else {
        // Optional without a default resolves to the type's empty value.
        Ok(match var.r#type {
            VarType::Str => CtxValue::Str(String::new()),
            VarType::Int => CtxValue::Int(0),
            VarType::Bool => CtxValue::Bool(false),
        })
    }
}

/// Cast an environment string into the declared type.
///
/// Accepted boolean literals are `{yes, true, 1, no, false, 0}`,
/// case-insensitive.
fn cast_str(key: &str, raw: &str, ty: VarType) -> Result<CtxValue> {
    match ty {
        VarType::Str => Ok(CtxValue::Str(raw.to_string())),
        VarType::Int => raw.trim().parse::<i64>().map(CtxValue::Int).map_err(|_| {
            Error::CtxTypeCast {
                key: key.to_string(),
                val: raw.to_string(),
                ty: "int".to_string(),
            }
        }),
        VarType::Bool => match raw.trim().to_lowercase().as_str() {
            "yes" | "true" | "1" => Ok(CtxValue::Bool(true)),
            "no" | "false" | "0" => Ok(CtxValue::Bool(false)),
            _ => Err(Error::CtxTypeCast {
                key: key.to_string(),
                val: raw.to_string(),
                ty: "bool".to_string(),
            }),
        },
    }
}

fn cast_toml(key: &str, val: &toml::Value, ty: VarType) -> Result<CtxValue> {
    match (ty, val) {
        (VarType::Str, toml::Value::String(s)) => Ok(CtxValue::Str(s.clone())),
        (VarType::Int, toml::Value::Integer(i)) => Ok(CtxValue::Int(*i)),
        (VarType::Bool, toml::Value::Boolean(b)) => Ok(CtxValue::Bool(*b)),
        // TOML scalars of the wrong shape go through the string cast so the
        // error message matches the env-var path.
        (_, other) => {
            let raw = match other {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cast_str(key, &raw, ty)
        }
    }
}
