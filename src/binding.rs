//! Function bindings: a function identifier tied to its schemas and backend.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{BackendConfig, DEFAULT_TIMEOUT_MILLIS};
use crate::error::{RemoteError, Result};
use crate::schema::{Model, Schema};

/// Options for [`FunctionBinding::bind`].
#[derive(Debug, Clone)]
pub struct BindOptions {
    /// Project root used for version metadata and the build context.
    pub project_root: PathBuf,
    /// Execution backend.
    pub backend: BackendConfig,
    /// Call timeout in milliseconds.
    pub timeout_millis: u64,
}

impl BindOptions {
    /// Default backend and timeout for a project.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            backend: BackendConfig::default(),
            timeout_millis: DEFAULT_TIMEOUT_MILLIS,
        }
    }

    /// Uses `backend` instead of the default subprocess backend.
    #[must_use]
    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the call timeout.
    #[must_use]
    pub fn timeout_millis(mut self, timeout_millis: u64) -> Self {
        self.timeout_millis = timeout_millis;
        self
    }
}

/// A function registered for remote execution.
///
/// Immutable once created. Binding performs no I/O; provisioning is a
/// separate, explicit step.
#[derive(Debug, Clone)]
pub struct FunctionBinding {
    name: String,
    input: Schema,
    output: Schema,
    source: &'static Location<'static>,
    timeout: Duration,
    backend: BackendConfig,
    project_root: PathBuf,
}

impl FunctionBinding {
    /// Binds `name` to explicit input and output schemas.
    ///
    /// Records the caller's source location for diagnostics.
    #[track_caller]
    pub fn bind(name: impl Into<String>, input: Schema, output: Schema, options: BindOptions) -> Result<Self> {
        let source = Location::caller();
        let name = name.into();

        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RemoteError::configuration(format!(
                "function identifier '{name}' must be non-empty and contain no whitespace"
            )));
        }
        for (role, schema) in [("input", &input), ("output", &output)] {
            if schema.name().is_empty() {
                return Err(RemoteError::configuration(format!(
                    "{role} schema of '{name}' must be a named object schema"
                )));
            }
        }
        if options.timeout_millis == 0 {
            return Err(RemoteError::configuration(format!(
                "timeout of '{name}' must be greater than zero"
            )));
        }

        Ok(Self {
            name,
            input,
            output,
            source,
            timeout: Duration::from_millis(options.timeout_millis),
            backend: options.backend,
            project_root: options.project_root,
        })
    }

    /// Binds `name` to the schemas of two [`Model`] types.
    #[track_caller]
    pub fn bind_models<I: Model, O: Model>(name: impl Into<String>, options: BindOptions) -> Result<Self> {
        Self::bind(name, I::schema(), O::schema(), options)
    }

    /// Stable function identifier, looked up in the shim's registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input schema.
    pub fn input_schema(&self) -> &Schema {
        &self.input
    }

    /// Output schema.
    pub fn output_schema(&self) -> &Schema {
        &self.output
    }

    /// Where the binding was created.
    pub fn source(&self) -> &'static Location<'static> {
        self.source
    }

    /// Call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Backend configuration.
    pub fn backend(&self) -> &BackendConfig {
        &self.backend
    }

    /// Project root.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Validates an already-encoded input value.
    pub fn check_input(&self, value: &Value) -> Result<()> {
        self.input.validate(value)
    }

    /// Encodes and validates a typed input.
    pub fn encode<I: Serialize>(&self, input: &I) -> Result<Value> {
        let value = serde_json::to_value(input).map_err(|e| {
            RemoteError::validation("$", format!("input cannot be serialized: {e}"))
        })?;
        self.check_input(&value)?;
        Ok(value)
    }

    /// Validates an output value received from the shim.
    pub fn check_output(&self, value: &Value) -> Result<()> {
        self.output.validate(value)
    }

    /// Parses and validates raw output bytes.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RemoteError::decode(format!("malformed output payload: {e}")))?;
        self.check_output(&value)?;
        Ok(value)
    }

    /// Validates an output value and converts it to the output type.
    pub fn decode<O: DeserializeOwned>(&self, value: Value) -> Result<O> {
        self.check_output(&value)?;
        serde_json::from_value(value).map_err(|e| {
            RemoteError::validation("$", format!("output does not match {}: {e}", self.output.name()))
        })
    }
}
