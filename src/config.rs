//! Backend selection and the `remotefn.toml` project configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{RemoteError, Result};

const CONFIG_FILE: &str = "remotefn.toml";

/// Default call timeout: five minutes.
pub const DEFAULT_TIMEOUT_MILLIS: u64 = 300_000;

/// Project configuration loaded from `remotefn.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Backend used by every function without its own override.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Default call timeout in milliseconds.
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,

    /// Per-function overrides, keyed by function identifier.
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            timeout_millis: default_timeout_millis(),
            functions: BTreeMap::new(),
        }
    }
}

/// Overrides for a single function.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionConfig {
    /// Call timeout in milliseconds.
    #[serde(default)]
    pub timeout_millis: Option<u64>,

    /// Backend for this function only.
    #[serde(default)]
    pub backend: Option<BackendConfig>,
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).map_err(|e| {
            RemoteError::configuration(format!(
                "Failed to read config file {}: {e}",
                config_path.display()
            ))
        })?;

        toml::from_str(&content).map_err(|e| {
            RemoteError::configuration(format!(
                "Failed to parse config file {}: {e}",
                config_path.display()
            ))
        })
    }

    /// Backend and timeout that apply to `function`.
    pub fn for_function(&self, function: &str) -> (BackendConfig, u64) {
        let overrides = self.functions.get(function);
        let backend = overrides
            .and_then(|f| f.backend.clone())
            .unwrap_or_else(|| self.backend.clone());
        let timeout = overrides
            .and_then(|f| f.timeout_millis)
            .unwrap_or(self.timeout_millis);
        (backend, timeout)
    }
}

/// Declarative choice of execution target. Exactly one variant is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Run the shim as a local child process.
    Subprocess(SubprocessConfig),
    /// Run the shim in an E2B sandbox built from a template.
    E2b(E2bConfig),
    /// Run the shim in a Daytona sandbox built from a snapshot.
    Daytona(DaytonaConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Subprocess(SubprocessConfig::default())
    }
}

impl BackendConfig {
    /// The variant tag.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Subprocess(_) => BackendKind::Subprocess,
            Self::E2b(_) => BackendKind::E2b,
            Self::Daytona(_) => BackendKind::Daytona,
        }
    }

    /// Resource limits requested when building the environment.
    pub fn resources(&self) -> Resources {
        match self {
            Self::Subprocess(_) => Resources::default(),
            Self::E2b(c) => Resources {
                cpu: c.cpu_count,
                memory_mb: c.memory_mb,
                disk_gb: None,
            },
            Self::Daytona(c) => Resources {
                cpu: c.cpu_count,
                memory_mb: u64::from(c.memory_gb) * 1024,
                disk_gb: Some(c.disk_gb),
            },
        }
    }

    /// Build file override, if the variant builds an image.
    pub fn dockerfile_path(&self) -> Option<&str> {
        match self {
            Self::Subprocess(_) => None,
            Self::E2b(c) => c.dockerfile_path.as_deref(),
            Self::Daytona(c) => c.dockerfile_path.as_deref(),
        }
    }
}

/// Supported backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Local child process.
    Subprocess,
    /// E2B cloud sandbox.
    E2b,
    /// Daytona cloud sandbox.
    Daytona,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subprocess => write!(f, "subprocess"),
            Self::E2b => write!(f, "e2b"),
            Self::Daytona => write!(f, "daytona"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "subprocess" => Ok(Self::Subprocess),
            "e2b" => Ok(Self::E2b),
            "daytona" => Ok(Self::Daytona),
            _ => Err(RemoteError::configuration(format!(
                "Unknown backend: '{s}'. Supported: subprocess, e2b, daytona"
            ))),
        }
    }
}

/// Resource limits for a built environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Virtual CPUs.
    pub cpu: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Disk in GiB, for services that size disks.
    pub disk_gb: Option<u32>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu: 1,
            memory_mb: 1024,
            disk_gb: None,
        }
    }
}

/// Local subprocess backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubprocessConfig {
    /// Shim executable: a path, or a bare name looked up on `PATH`.
    #[serde(default = "default_shim_program")]
    pub program: String,

    /// Extra arguments passed to the shim.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the shim.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory; defaults to the project root.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            program: default_shim_program(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }
}

impl SubprocessConfig {
    /// Configuration running `program` with no extra arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }
}

/// E2B sandbox backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct E2bConfig {
    /// Template alias prefix; the alias is `{prefix}-v{version}`.
    pub template_prefix: String,

    /// Template version; read from project metadata when absent.
    #[serde(default)]
    pub template_version: Option<String>,

    /// Virtual CPUs for the template.
    #[serde(default = "default_e2b_cpu")]
    pub cpu_count: u32,

    /// Memory in MiB for the template.
    #[serde(default = "default_e2b_memory_mb")]
    pub memory_mb: u64,

    /// API key; falls back to `E2B_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Build file, relative to the project root; defaults to `Dockerfile`.
    #[serde(default)]
    pub dockerfile_path: Option<String>,

    /// Shim command inside the sandbox.
    #[serde(default = "default_remote_shim")]
    pub shim_command: String,

    /// API endpoint.
    #[serde(default = "default_e2b_url")]
    pub base_url: String,
}

impl E2bConfig {
    /// Configuration with defaults for everything but the template prefix.
    pub fn new(template_prefix: impl Into<String>) -> Self {
        Self {
            template_prefix: template_prefix.into(),
            template_version: None,
            cpu_count: default_e2b_cpu(),
            memory_mb: default_e2b_memory_mb(),
            api_key: None,
            dockerfile_path: None,
            shim_command: default_remote_shim(),
            base_url: default_e2b_url(),
        }
    }

    /// Resolves the API key from the config or `E2B_API_KEY`.
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_api_key(self.api_key.as_deref(), "E2B_API_KEY", "E2B")
    }
}

/// Daytona sandbox backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaytonaConfig {
    /// Snapshot name prefix; the snapshot is `{name}-v{version}`.
    pub snapshot_name: String,

    /// Snapshot version; read from project metadata when absent.
    #[serde(default)]
    pub snapshot_version: Option<String>,

    /// Virtual CPUs for the snapshot.
    #[serde(default = "default_daytona_cpu")]
    pub cpu_count: u32,

    /// Memory in GiB.
    #[serde(default = "default_daytona_memory_gb")]
    pub memory_gb: u32,

    /// Disk in GiB.
    #[serde(default = "default_daytona_disk_gb")]
    pub disk_gb: u32,

    /// API key; falls back to `DAYTONA_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Build file, relative to the project root; defaults to `Dockerfile`.
    #[serde(default)]
    pub dockerfile_path: Option<String>,

    /// Shim command inside the sandbox.
    #[serde(default = "default_remote_shim")]
    pub shim_command: String,

    /// API endpoint.
    #[serde(default = "default_daytona_url")]
    pub base_url: String,
}

impl DaytonaConfig {
    /// Configuration with defaults for everything but the snapshot name.
    pub fn new(snapshot_name: impl Into<String>) -> Self {
        Self {
            snapshot_name: snapshot_name.into(),
            snapshot_version: None,
            cpu_count: default_daytona_cpu(),
            memory_gb: default_daytona_memory_gb(),
            disk_gb: default_daytona_disk_gb(),
            api_key: None,
            dockerfile_path: None,
            shim_command: default_remote_shim(),
            base_url: default_daytona_url(),
        }
    }

    /// Resolves the API key from the config or `DAYTONA_API_KEY`.
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_api_key(self.api_key.as_deref(), "DAYTONA_API_KEY", "Daytona")
    }
}

/// Explicit key first, then the named environment variable.
fn resolve_api_key(explicit: Option<&str>, env_var: &str, service: &str) -> Result<String> {
    if let Some(key) = explicit.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => Err(RemoteError::configuration(format!(
            "{service} API key is required. Provide it in the config or set the {env_var} environment variable."
        ))),
    }
}

// Default value functions
fn default_timeout_millis() -> u64 {
    DEFAULT_TIMEOUT_MILLIS
}

fn default_shim_program() -> String {
    "remotefn-shim".to_string()
}

fn default_remote_shim() -> String {
    "/app/remotefn-shim".to_string()
}

fn default_e2b_cpu() -> u32 {
    2
}

fn default_e2b_memory_mb() -> u64 {
    2048
}

fn default_e2b_url() -> String {
    "https://api.e2b.dev".to_string()
}

fn default_daytona_cpu() -> u32 {
    1
}

fn default_daytona_memory_gb() -> u32 {
    1
}

fn default_daytona_disk_gb() -> u32 {
    3
}

fn default_daytona_url() -> String {
    "https://app.daytona.io/api".to_string()
}
