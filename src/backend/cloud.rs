//! Cloud sandbox backends.
//!
//! E2B and Daytona differ only in their REST APIs; the provisioning and
//! execution flow around them is shared and lives in [`CloudBackend`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use super::{interpret_output, Backend, Execution};
use crate::config::{BackendKind, Resources};
use crate::context::BuildContext;
use crate::error::{RemoteError, Result};
use crate::key::EnvironmentKey;
use crate::protocol::EXECUTION_MODE_ENV;
use crate::provision::EnvironmentHandle;
use crate::session::CallSession;

/// Interval between build status polls.
pub(crate) const BUILD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Longest time a template or snapshot build may take.
pub(crate) const BUILD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr, when the service reports it separately.
    pub stderr: String,
}

/// The operations a sandbox service must offer.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Service name for logs and errors.
    fn service(&self) -> &'static str;

    /// Whether a ready template or snapshot named `key` exists.
    async fn environment_exists(&self, key: &EnvironmentKey) -> Result<bool>;

    /// Builds the environment and blocks until it is ready. Returns its id.
    async fn build_environment(
        &self,
        key: &EnvironmentKey,
        context: &BuildContext,
        resources: &Resources,
    ) -> Result<String>;

    /// Starts a sandbox from a provisioned environment. The service deletes
    /// it on its own after `lifetime`.
    async fn create_sandbox(&self, handle: &EnvironmentHandle, lifetime: Duration) -> Result<String>;

    /// Runs a shell command inside the sandbox.
    async fn run_command(&self, sandbox_id: &str, command: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Deletes the sandbox.
    async fn kill_sandbox(&self, sandbox_id: &str) -> Result<()>;
}

/// A backend running the shim in sandboxes of a cloud service.
pub struct CloudBackend<A> {
    kind: BackendKind,
    api: A,
    project_root: PathBuf,
    dockerfile: Option<String>,
    resources: Resources,
    shim_command: String,
}

impl<A: SandboxApi> CloudBackend<A> {
    /// Creates a backend for `api`.
    pub fn new(
        kind: BackendKind,
        api: A,
        project_root: &Path,
        dockerfile: Option<String>,
        resources: Resources,
        shim_command: String,
    ) -> Self {
        Self {
            kind,
            api,
            project_root: project_root.to_path_buf(),
            dockerfile,
            resources,
            shim_command,
        }
    }

    /// The service client.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Shell command feeding `payload` to the shim.
    ///
    /// The payload travels base64-encoded, and the base64 alphabet never
    /// needs escaping inside single quotes.
    fn shim_invocation(&self, payload: &[u8]) -> String {
        let encoded = STANDARD.encode(payload);
        format!(
            "printf '%s' '{encoded}' | base64 -d | {EXECUTION_MODE_ENV}=1 {}",
            self.shim_command
        )
    }

    fn provisioning_error(&self, key: &EnvironmentKey, err: RemoteError) -> RemoteError {
        match err {
            RemoteError::Configuration { .. } | RemoteError::Provisioning { .. } => err,
            other => RemoteError::provisioning(
                key.to_string(),
                format!("{}: {other}", self.api.service()),
            ),
        }
    }
}

#[async_trait]
impl<A: SandboxApi> Backend for CloudBackend<A> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn provision(&self, key: &EnvironmentKey) -> Result<EnvironmentHandle> {
        let service = self.api.service();
        let context = BuildContext::resolve(&self.project_root, self.dockerfile.as_deref())?;

        let exists = self
            .api
            .environment_exists(key)
            .await
            .map_err(|e| self.provisioning_error(key, e))?;
        if exists {
            info!("{} environment '{}' already exists.", service, key);
            return Ok(EnvironmentHandle::new(self.kind, key.clone(), key.to_string(), true));
        }

        info!("{} environment '{}' does not exist. Creating and building...", service, key);
        let remote_id = self
            .api
            .build_environment(key, &context, &self.resources)
            .await
            .map_err(|e| self.provisioning_error(key, e))?;
        info!("{} environment '{}' successfully built.", service, key);

        Ok(EnvironmentHandle::new(self.kind, key.clone(), remote_id, false))
    }

    async fn execute(&self, session: &CallSession, handle: &EnvironmentHandle) -> Result<Execution> {
        let service = self.api.service();
        let deadline = session.deadline();
        let command = self.shim_invocation(session.payload());

        // The sandbox lifetime is capped at the remaining time, so a sandbox
        // whose creation is cut short here is reaped by the service.
        let Ok(created) = timeout_at(deadline, self.api.create_sandbox(handle, session.remaining())).await
        else {
            warn!("{} sandbox creation for session {} hit the deadline", service, session.id());
            return Ok(Execution::TimedOut);
        };
        let sandbox_id = created?;
        debug!("Created {} sandbox {} for session {}", service, sandbox_id, session.id());

        let outcome = timeout_at(
            deadline,
            self.api.run_command(&sandbox_id, &command, session.remaining()),
        )
        .await;

        if let Err(e) = self.api.kill_sandbox(&sandbox_id).await {
            warn!("Failed to delete {} sandbox {}: {}", service, sandbox_id, e);
        }

        match outcome {
            Err(_) => {
                warn!("Session {} timed out; {} sandbox {} deleted", session.id(), service, sandbox_id);
                Ok(Execution::TimedOut)
            }
            Ok(result) => {
                let output = result?;
                interpret_output(
                    output.exit_code == 0,
                    &format!("exited with code {}", output.exit_code),
                    &output.stdout,
                    &output.stderr,
                )
            }
        }
    }
}

/// Maps a reqwest failure to a transport error.
pub(crate) fn http_error(service: &str, err: &reqwest::Error) -> RemoteError {
    RemoteError::transport(format!("{service} request failed: {err}"))
}

/// Passes successful responses through and turns the rest into errors.
pub(crate) async fn ensure_success(
    service: &str,
    what: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::transport(format!(
        "{service} {what} failed with HTTP {status}: {}",
        body.trim()
    )))
}

/// Decodes a JSON response body.
pub(crate) async fn read_json<T: DeserializeOwned>(
    service: &str,
    what: &str,
    response: reqwest::Response,
) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| RemoteError::decode(format!("{service} {what} returned an unexpected body: {e}")))
}

/// Whole seconds covering `duration`, at least one.
pub(crate) fn whole_secs(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockCommand, MockSandboxApi};
    use crate::binding::{BindOptions, FunctionBinding};
    use crate::protocol::{Invocation, RemoteResult};
    use crate::provision::ProvisioningCache;
    use crate::schema::Schema;
    use crate::session::{self, SessionStatus};
    use serde_json::json;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn project() -> TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM debian:stable-slim\n").unwrap();
        dir
    }

    fn backend(dir: &TempDir, api: MockSandboxApi) -> CloudBackend<MockSandboxApi> {
        CloudBackend::new(
            BackendKind::E2b,
            api,
            dir.path(),
            None,
            Resources::default(),
            "/app/remotefn-shim".to_string(),
        )
    }

    fn key() -> EnvironmentKey {
        EnvironmentKey::new("proj", "1.0.0").unwrap()
    }

    fn binding(dir: &TempDir, timeout_millis: u64) -> FunctionBinding {
        let mut config = crate::config::E2bConfig::new("proj");
        config.template_version = Some("1.0.0".to_string());
        FunctionBinding::bind(
            "echo",
            Schema::open("EchoInput"),
            Schema::open("EchoOutput"),
            BindOptions::new(dir.path())
                .backend(crate::config::BackendConfig::E2b(config))
                .timeout_millis(timeout_millis),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_provision_builds_missing_environment() {
        let dir = project();
        let backend = backend(&dir, MockSandboxApi::new(false));

        let handle = backend.provision(&key()).await.unwrap();
        assert!(!handle.is_reused());
        assert_eq!(handle.key().to_string(), "proj-v1.0.0");
        assert_eq!(backend.api().build_count(), 1);
    }

    #[tokio::test]
    async fn test_provision_reuses_existing_environment() {
        let dir = project();
        let backend = backend(&dir, MockSandboxApi::new(true));

        let handle = backend.provision(&key()).await.unwrap();
        assert!(handle.is_reused());
        assert_eq!(handle.remote_id(), "proj-v1.0.0");
        assert_eq!(backend.api().build_count(), 0);
    }

    #[tokio::test]
    async fn test_provision_requires_dockerfile() {
        let dir = tempdir().unwrap();
        let backend = backend(&dir, MockSandboxApi::new(false));

        let err = backend.provision(&key()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Configuration { .. }));
        assert_eq!(backend.api().build_count(), 0);
    }

    #[tokio::test]
    async fn test_build_failure_is_provisioning_error() {
        let dir = project();
        let backend = backend(&dir, MockSandboxApi::new(false).failing_build("layer 3 failed"));

        let err = backend.provision(&key()).await.unwrap_err();
        assert!(err.is_provisioning());
        assert!(err.to_string().contains("layer 3 failed"));
    }

    #[tokio::test]
    async fn test_shared_key_second_binding_does_not_build() {
        let dir = project();
        let backend = backend(&dir, MockSandboxApi::new(false));
        let cache = ProvisioningCache::new();

        let first = session::warm_up(&binding(&dir, 1000), &backend, &cache).await.unwrap();
        let second = session::warm_up(&binding(&dir, 5000), &backend, &cache).await.unwrap();

        assert_eq!(first.key(), second.key());
        assert!(second.is_reused());
        assert_eq!(backend.api().build_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_runs_shim_and_deletes_sandbox() {
        let dir = project();
        let result = RemoteResult::Output {
            output: json!({"echo": "hi"}),
        };
        let stdout = format!("booting\n{}\n", result.to_line().unwrap());
        let api = MockSandboxApi::new(true).with_command(MockCommand::Output(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        }));
        let backend = backend(&dir, api);
        let cache = ProvisioningCache::new();

        let report =
            session::call_with_report(&binding(&dir, 5000), json!({"echo": "hi"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::Succeeded);
        assert_eq!(report.result.unwrap(), json!({"echo": "hi"}));
        assert_eq!(backend.api().create_count(), 1);
        assert_eq!(backend.api().kill_count(), 1);

        let command = backend.api().last_command().unwrap();
        assert!(command.contains("REMOTEFN_EXECUTION_MODE=1 /app/remotefn-shim"));
        let encoded = command.split('\'').nth(3).unwrap();
        let invocation = Invocation::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(invocation.function, "echo");
        assert_eq!(invocation.session, report.id);
    }

    #[tokio::test]
    async fn test_execute_timeout_deletes_sandbox() {
        let dir = project();
        let backend = backend(&dir, MockSandboxApi::new(true).with_command(MockCommand::Hang));
        let cache = ProvisioningCache::new();

        let report =
            session::call_with_report(&binding(&dir, 100), json!({}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::TimedOut);
        assert!(report.result.unwrap_err().is_timeout());
        assert_eq!(backend.api().kill_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_transport_error_deletes_sandbox() {
        let dir = project();
        let api = MockSandboxApi::new(true).with_command(MockCommand::Transport("reset by peer".to_string()));
        let backend = backend(&dir, api);
        let cache = ProvisioningCache::new();

        let err = session::call(&binding(&dir, 1000), json!({}), &backend, &cache)
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(backend.api().kill_count(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_result_is_transport() {
        let dir = project();
        let api = MockSandboxApi::new(true).with_command(MockCommand::Output(CommandOutput {
            exit_code: 137,
            stdout: String::new(),
            stderr: "Killed".to_string(),
        }));
        let backend = backend(&dir, api);
        let cache = ProvisioningCache::new();

        let err = session::call(&binding(&dir, 1000), json!({}), &backend, &cache)
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("exited with code 137"));
    }

    #[test]
    fn test_whole_secs() {
        assert_eq!(whole_secs(Duration::from_millis(1)), 1);
        assert_eq!(whole_secs(Duration::from_millis(1000)), 1);
        assert_eq!(whole_secs(Duration::from_millis(1001)), 2);
        assert_eq!(whole_secs(Duration::ZERO), 1);
    }
}
