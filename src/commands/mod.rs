//! CLI command implementations.
//!
//! The CLI has no compiled-in types, so functions are bound with open
//! schemas and the shim does the real validation.

pub mod call;
pub mod key;
pub mod warm_up;

use anyhow::{Context, Result};
use std::path::Path;

use remotefn::{BindOptions, Config, FunctionBinding, Schema};

/// Identifier used when a command targets the project default backend.
const DEFAULT_FUNCTION: &str = "default";

/// Binds `function` with the backend and timeout from `remotefn.toml`.
pub fn bind(project: &Path, function: Option<&str>, timeout_override: Option<u64>) -> Result<FunctionBinding> {
    let config = Config::load(project)?;
    let name = function.unwrap_or(DEFAULT_FUNCTION);
    let (backend, timeout_millis) = config.for_function(name);

    let binding = FunctionBinding::bind(
        name,
        Schema::open("Input"),
        Schema::open("Output"),
        BindOptions::new(project)
            .backend(backend)
            .timeout_millis(timeout_override.unwrap_or(timeout_millis)),
    )
    .with_context(|| format!("Failed to bind '{name}'"))?;
    Ok(binding)
}
