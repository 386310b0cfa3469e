//! Expression resolution for file-sourced pipelines.
//!
//! Tokens of the form `${{ <ns>.<name> }}` may appear anywhere in a
//! YAML-sourced pipeline string. Namespaces:
//! - `parameters.N` — rewritten to the `PARAM_<N>` environment variable the
//!   executor exports for each trigger parameter
//! - `secrets.N` — runtime secret lookup
//! - `env.N` — rewritten to a shell env reference, resolved at run time
//!
//! Unknown namespaces leave the token intact. Resolution runs after file
//! load, before execution. Parameter and env tokens never splice the value
//! into the string itself, so a hostile parameter cannot smuggle shell
//! syntax into a command.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crucible_core::pipeline::{Pipeline, Step};
use crucible_core::{Error, Result};

static EXPR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\.([a-zA-Z_][a-zA-Z0-9_-]*)\s*\}\}").unwrap()
});

/// Values available to expression resolution.
#[derive(Debug, Clone, Default)]
pub struct ExprContext {
    pub parameters: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
}

/// Resolve one string. Errors with `secret-missing` when `secrets.N` names
/// an unknown secret, and `expression-resolution` when a parameter is
/// unknown.
pub fn resolve_str(input: &str, ctx: &ExprContext) -> Result<String> {
    let mut failure: Option<Error> = None;
    let resolved = EXPR_REGEX.replace_all(input, |caps: &regex::Captures<'_>| {
        let namespace = &caps[1];
        let name = &caps[2];
        match namespace {
            // Pass-through reference to the PARAM_<N> env var the executor
            // injects; the parameter only needs to exist.
            "parameters" => match ctx.parameters.get(name) {
                Some(_) => format!("${{PARAM_{}}}", name.to_uppercase()),
                None => {
                    failure.get_or_insert(Error::ExpressionResolution(format!(
                        "unknown parameter: {name}"
                    )));
                    String::new()
                }
            },
            "secrets" => match ctx.secrets.get(name) {
                Some(value) => value.clone(),
                None => {
                    failure.get_or_insert(Error::SecretMissing(name.to_string()));
                    String::new()
                }
            },
            // Pass-through env ref, resolved by the shell at run time.
            "env" => format!("${{{name}}}"),
            _ => caps[0].to_string(),
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(resolved.into_owned()),
    }
}

/// Resolve every expression in a pipeline tree in place.
pub fn resolve_pipeline(pipeline: &mut Pipeline, ctx: &ExprContext) -> Result<()> {
    for value in pipeline.env.values_mut() {
        *value = resolve_str(value, ctx)?;
    }
    for stage in &mut pipeline.stages {
        for step in &mut stage.steps {
            resolve_step(step, ctx)?;
        }
        for cache in &mut stage.cache {
            cache.key = resolve_str(&cache.key, ctx)?;
        }
    }
    for cache in &mut pipeline.cache {
        cache.key = resolve_str(&cache.key, ctx)?;
    }
    if let Some(post) = &mut pipeline.post {
        for step in post
            .always
            .iter_mut()
            .chain(post.on_success.iter_mut())
            .chain(post.on_failure.iter_mut())
        {
            resolve_step(step, ctx)?;
        }
    }
    Ok(())
}

fn resolve_step(step: &mut Step, ctx: &ExprContext) -> Result<()> {
    step.command = resolve_str(&step.command, ctx)?;
    if let Some(image) = &step.image {
        step.image = Some(resolve_str(image, ctx)?);
    }
    if let Some(dir) = &step.dir {
        step.dir = Some(resolve_str(dir, ctx)?);
    }
    for value in step.env.values_mut() {
        *value = resolve_str(value, ctx)?;
    }
    Ok(())
}
