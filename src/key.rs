//! Environment key resolution.
//!
//! An environment key names a template or snapshot as `{prefix}-v{version}`.
//! The string is the provisioning cache identity and the remote lookup key,
//! so it must come out the same on every run of the same project version.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::debug;

use crate::config::BackendConfig;
use crate::error::{RemoteError, Result};

/// Identity of a provisioned image, template or snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentKey {
    name: String,
    version: String,
}

impl EnvironmentKey {
    /// Builds a key, rejecting empty or whitespace-containing parts.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        check_part("prefix", &name)?;
        check_part("version", &version)?;
        Ok(Self { name, version })
    }

    /// Synthetic key for the local subprocess variant.
    pub fn local() -> Self {
        Self {
            name: "local".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Base name (prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version string.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.name, self.version)
    }
}

fn check_part(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RemoteError::configuration(format!(
            "environment {what} must not be empty"
        )));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(RemoteError::configuration(format!(
            "environment {what} '{value}' must not contain whitespace"
        )));
    }
    Ok(())
}

/// Resolves the environment key for a backend configuration.
///
/// Precedence: the explicit version override in the config, then the
/// project version from metadata in `project_root`. An empty override
/// counts as unset.
pub fn resolve(config: &BackendConfig, project_root: &Path) -> Result<EnvironmentKey> {
    let (prefix, version) = match config {
        BackendConfig::Subprocess(_) => return Ok(EnvironmentKey::local()),
        BackendConfig::E2b(c) => (&c.template_prefix, c.template_version.as_deref()),
        BackendConfig::Daytona(c) => (&c.snapshot_name, c.snapshot_version.as_deref()),
    };

    let version = match version.filter(|v| !v.is_empty()) {
        Some(v) => v.to_string(),
        None => project_version(project_root)?,
    };

    EnvironmentKey::new(prefix.clone(), version)
}

fn version_cache() -> &'static Mutex<HashMap<PathBuf, String>> {
    static VERSIONS: OnceLock<Mutex<HashMap<PathBuf, String>>> = OnceLock::new();
    VERSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Project version, read once per process per project root.
pub fn project_version(project_root: &Path) -> Result<String> {
    let root = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());

    if let Some(version) = version_cache()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&root)
    {
        return Ok(version.clone());
    }

    let version = read_project_version(&root)?;
    version_cache()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(root, version.clone());
    Ok(version)
}

/// Reads the version from `Cargo.toml` or `pyproject.toml`, uncached.
pub fn read_project_version(project_root: &Path) -> Result<String> {
    let cargo = project_root.join("Cargo.toml");
    if cargo.is_file() {
        let manifest = load_toml(&cargo)?;
        let version = manifest
            .get("package")
            .and_then(|p| p.get("version"))
            .and_then(toml::Value::as_str)
            .or_else(|| {
                manifest
                    .get("workspace")
                    .and_then(|w| w.get("package"))
                    .and_then(|p| p.get("version"))
                    .and_then(toml::Value::as_str)
            });
        if let Some(version) = version {
            debug!("Project version {} from {}", version, cargo.display());
            return Ok(version.to_string());
        }
    }

    let pyproject = project_root.join("pyproject.toml");
    if pyproject.is_file() {
        let manifest = load_toml(&pyproject)?;
        if let Some(version) = manifest
            .get("project")
            .and_then(|p| p.get("version"))
            .and_then(toml::Value::as_str)
        {
            debug!("Project version {} from {}", version, pyproject.display());
            return Ok(version.to_string());
        }
    }

    Err(RemoteError::configuration(format!(
        "No project version found in {}. Set a version override in the backend config \
         or add a version to Cargo.toml or pyproject.toml.",
        project_root.display()
    )))
}

fn load_toml(path: &Path) -> Result<toml::Value> {
    let content = fs::read_to_string(path).map_err(|e| {
        RemoteError::configuration(format!("Failed to read {}: {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        RemoteError::configuration(format!("Failed to parse {}: {e}", path.display()))
    })
}
