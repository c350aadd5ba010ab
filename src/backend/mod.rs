//! Execution backends.
//!
//! Every backend offers the same two capabilities:
//! - `provision`: make sure an environment for a key exists, building it if needed
//! - `execute`: run one call session inside a provisioned environment
//!
//! The variant is selected by the `type` tag of [`BackendConfig`]:
//! - `subprocess`: the shim runs as a local child process
//! - `e2b`: the shim runs in an E2B sandbox created from a template
//! - `daytona`: the shim runs in a Daytona sandbox created from a snapshot

mod cloud;
mod daytona;
mod e2b;
#[cfg(test)]
pub(crate) mod mock;
mod subprocess;

pub use cloud::{CloudBackend, CommandOutput, SandboxApi};
pub use daytona::DaytonaApi;
pub use e2b::E2bApi;
pub use subprocess::SubprocessBackend;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{RemoteError, Result};
use crate::key::EnvironmentKey;
use crate::protocol::RemoteResult;
use crate::provision::EnvironmentHandle;
use crate::session::CallSession;

/// How a backend execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The shim reported a terminal result.
    Finished(RemoteResult),
    /// The deadline passed; the process or sandbox has been torn down.
    TimedOut,
}

/// Trait for execution backends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The variant this backend implements.
    fn kind(&self) -> BackendKind;

    /// Returns a ready environment for `key`, building it if absent.
    ///
    /// Callers go through [`ProvisioningCache`](crate::provision::ProvisioningCache),
    /// which guarantees at most one call per key and process.
    async fn provision(&self, key: &EnvironmentKey) -> Result<EnvironmentHandle>;

    /// Runs one session against a provisioned environment.
    ///
    /// Must return [`Execution::TimedOut`] once `session.deadline()` passes,
    /// after terminating whatever it started.
    async fn execute(&self, session: &CallSession, handle: &EnvironmentHandle) -> Result<Execution>;
}

/// Creates the backend selected by `config`.
///
/// Performs no I/O; credentials and build contexts are resolved on first
/// provisioning.
pub fn from_config(config: &BackendConfig, project_root: &Path) -> Arc<dyn Backend> {
    match config {
        BackendConfig::Subprocess(c) => Arc::new(SubprocessBackend::new(c.clone(), project_root)),
        BackendConfig::E2b(c) => Arc::new(CloudBackend::new(
            BackendKind::E2b,
            E2bApi::new(c.clone()),
            project_root,
            config.dockerfile_path().map(str::to_string),
            config.resources(),
            c.shim_command.clone(),
        )),
        BackendConfig::Daytona(c) => Arc::new(CloudBackend::new(
            BackendKind::Daytona,
            DaytonaApi::new(c.clone()),
            project_root,
            config.dockerfile_path().map(str::to_string),
            config.resources(),
            c.shim_command.clone(),
        )),
    }
}

/// Turns raw shim output into an execution outcome.
///
/// A result line wins regardless of exit status. Without one, a failed exit
/// means the process broke (transport) and a clean exit means the shim
/// broke protocol (decode).
pub(crate) fn interpret_output(
    success: bool,
    exit_description: &str,
    stdout: &str,
    stderr: &str,
) -> Result<Execution> {
    for line in stdout.lines() {
        if !line.starts_with(crate::protocol::RESULT_MARKER) {
            debug!("shim stdout: {}", line);
        }
    }
    if !stderr.trim().is_empty() {
        debug!("shim stderr: {}", stderr.trim());
    }

    if let Some(result) = RemoteResult::from_stdout(stdout)? {
        return Ok(Execution::Finished(result));
    }

    if success {
        Err(RemoteError::decode(
            "shim exited without writing a result line",
        ))
    } else {
        Err(RemoteError::transport(format!(
            "shim {exit_description} before reporting a result: {}",
            tail(stderr, 500)
        )))
    }
}

/// Last `max` bytes of `text`, on a char boundary.
fn tail(text: &str, max: usize) -> &str {
    let text = text.trim();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{E2bConfig, SubprocessConfig};
    use crate::protocol::ErrorDescriptor;

    #[test]
    fn test_from_config_selects_variant() {
        let root = Path::new(".");
        let sub = from_config(&BackendConfig::Subprocess(SubprocessConfig::default()), root);
        assert_eq!(sub.kind(), BackendKind::Subprocess);

        let e2b = from_config(&BackendConfig::E2b(E2bConfig::new("proj")), root);
        assert_eq!(e2b.kind(), BackendKind::E2b);
    }

    #[test]
    fn test_interpret_result_line() {
        let result = RemoteResult::Error {
            error: ErrorDescriptor::function("Boom", "exploded"),
        };
        let stdout = format!("noise\n{}\n", result.to_line().unwrap());
        let execution = interpret_output(true, "exited with 0", &stdout, "").unwrap();
        assert_eq!(execution, Execution::Finished(result));
    }

    #[test]
    fn test_interpret_crash_is_transport() {
        let err = interpret_output(false, "was killed by signal 9", "", "segfault").unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("segfault"));
    }

    #[test]
    fn test_interpret_clean_exit_without_result_is_decode() {
        let err = interpret_output(true, "exited with 0", "hello\n", "").unwrap_err();
        assert!(matches!(err, RemoteError::Decode { .. }));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("short", 10), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ééé", 3), "é");
    }
}
