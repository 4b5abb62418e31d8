//! Loading recipes.
//!
//! A recipe is a YAML document naming the target architecture and the list
//! of actions to run:
//!
//! ```yaml
//! architecture: arm64
//! actions:
//!   - action: image-partition
//!     imagename: {{ $image }}
//!     ...
//! ```
//!
//! Before parsing, the text goes through a minimal template expansion
//! supporting `{{ $var }}`, `{{ or $var "default" }}` and `{{ sector N }}`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{Context as _, Result};
use camino::Utf8Path;
use fn_error_context::context;
use regex::{Captures, Regex};
use serde::Deserialize;

use crate::action::ActionKind;

/// Size of a disk sector, as used by `{{ sector N }}`.
pub(crate) const SECTOR_SIZE: u64 = 512;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TemplateError {
    #[error("Unknown template variable ${0}")]
    UnknownVariable(String),
    #[error("Unsupported template expression `{0}`")]
    Unsupported(String),
    #[error("Invalid sector count `{0}`")]
    InvalidSector(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Recipe {
    /// Debian name of the architecture; the host's if unset.
    #[serde(default)]
    pub(crate) architecture: Option<String>,
    pub(crate) actions: Vec<ActionKind>,
}

fn template_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("valid regex"))
}

fn lookup<'a>(
    vars: &'a BTreeMap<String, String>,
    token: &str,
) -> Option<Result<&'a str, TemplateError>> {
    let name = token.strip_prefix('$')?;
    Some(
        vars.get(name)
            .map(|v| v.as_str())
            .ok_or_else(|| TemplateError::UnknownVariable(name.to_owned())),
    )
}

fn eval(expr: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let unsupported = || TemplateError::Unsupported(expr.to_owned());
    let tokens = shlex::split(expr).ok_or_else(unsupported)?;
    let tokens: Vec<&str> = tokens.iter().map(|s| s.as_str()).collect();
    match tokens.as_slice() {
        [var] => lookup(vars, var).ok_or_else(unsupported)?.map(ToOwned::to_owned),
        ["or", var, default] => {
            let name = var.strip_prefix('$').ok_or_else(unsupported)?;
            Ok(vars
                .get(name)
                .filter(|v| !v.is_empty())
                .map(|v| v.as_str())
                .unwrap_or(*default)
                .to_owned())
        }
        ["sector", n] => {
            let n = match lookup(vars, n) {
                Some(v) => v?,
                None => *n,
            };
            n.parse::<u64>()
                .ok()
                .and_then(|n| n.checked_mul(SECTOR_SIZE))
                .map(|b| b.to_string())
                .ok_or_else(|| TemplateError::InvalidSector(n.to_owned()))
        }
        _ => Err(unsupported()),
    }
}

/// Expand all template expressions in `text`.
pub(crate) fn expand_template(
    text: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    let mut err = None;
    let r = template_re().replace_all(text, |c: &Captures| {
        eval(&c[1], vars).unwrap_or_else(|e| {
            err.get_or_insert(e);
            String::new()
        })
    });
    match err {
        Some(e) => Err(e),
        None => Ok(r.into_owned()),
    }
}

impl Recipe {
    pub(crate) fn parse(text: &str, vars: &BTreeMap<String, String>) -> Result<Self> {
        let text = expand_template(text, vars)?;
        let recipe: Recipe = serde_yaml::from_str(&text)?;
        if recipe.actions.is_empty() {
            anyhow::bail!("Recipe has no actions");
        }
        Ok(recipe)
    }

    #[context("Loading recipe {path}")]
    pub(crate) fn load(path: &Utf8Path, vars: &BTreeMap<String, String>) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        Self::parse(&text, vars)
    }
}
