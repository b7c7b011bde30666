// src/cmd/template.rs

//! Placeholder substitution for command templates.
//!
//! Recognized placeholders:
//! - `{module.dir}`, `{module.name}`, `{module.pyimport}`
//! - `{space}`
//! - `{ctx.NAMESPACE.NAME}`
//!
//! Anything else inside braces is a configuration error; literal braces
//! are not escaped because shell strings in this position never need them.

use regex::Regex;

use crate::ctx::Ctx;
use crate::errors::{Error, Result};
use crate::venv::Module;

/// Everything a template substitution can refer to.
pub struct TemplateEnv<'a> {
    pub ctx: &'a Ctx,
    pub space: Option<&'a str>,
    pub module: Option<&'a Module>,
}

/// True if any field of the command references a `{module...}` placeholder,
/// making the command parametric over modules.
pub fn is_module_parametric(text: &str) -> bool {
    text.contains("{module")
}

/// True if the command references `{space}`.
pub fn is_space_parametric(text: &str) -> bool {
    text.contains("{space}")
}

fn placeholder_re() -> Regex {
    // Non-greedy body; individual tokens are validated in `substitute`.
    Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").expect("static regex")
}

/// Substitute all placeholders in `input`.
pub fn format(input: &str, env: &TemplateEnv<'_>) -> Result<String> {
    let re = placeholder_re();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in re.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0");
        out.push_str(&input[last..whole.start()]);
        out.push_str(&substitute(&caps[1], env)?);
        last = whole.end();
    }

    out.push_str(&input[last..]);
    Ok(out)
}

fn substitute(token: &str, env: &TemplateEnv<'_>) -> Result<String> {
    match token {
        "space" => Ok(env.space.unwrap_or("default").to_string()),
        "module.dir" | "module.name" | "module.pyimport" => {
            let module = env.module.ok_or_else(|| {
                Error::ConfigParse(format!(
                    "placeholder '{{{token}}}' used outside a module-parametric command"
                ))
            })?;
            Ok(match token {
                "module.dir" => module.dir.clone(),
                "module.name" => module.name.clone(),
                _ => module.pyimport(),
            })
        }
        other if other.starts_with("ctx.") => {
            let rest = &other["ctx.".len()..];
            let (namespace, name) = rest.split_once('.').ok_or_else(|| {
                Error::ConfigParse(format!("malformed ctx placeholder '{{{other}}}'"))
            })?;
            Ok(env.ctx.lookup(namespace, name)?.render())
        }
        other => Err(Error::ConfigParse(format!(
            "unknown placeholder '{{{other}}}'"
        ))),
    }
}
