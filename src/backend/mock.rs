//! Mock backends for testing.
//!
//! Provides configurable stand-ins for a backend and a sandbox service so
//! sessions and provisioning can be exercised without processes or network.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Backend, CommandOutput, Execution, SandboxApi};
use crate::config::{BackendKind, Resources};
use crate::context::BuildContext;
use crate::error::{RemoteError, Result};
use crate::key::EnvironmentKey;
use crate::protocol::RemoteResult;
use crate::provision::EnvironmentHandle;
use crate::session::CallSession;

/// How the mock backend provisions.
#[derive(Debug, Clone)]
pub(crate) enum MockProvision {
    /// Build a fresh environment.
    Build,
    /// Report the environment as already present.
    Exists,
    /// Fail with the given message.
    Fail(String),
}

/// How the mock backend executes.
#[derive(Debug, Clone)]
pub(crate) enum MockExecution {
    /// Return the given shim result.
    Respond(RemoteResult),
    /// Fail with a transport error.
    Transport(String),
    /// Block until the session deadline, then report a timeout.
    Hang,
    /// Block forever, ignoring the deadline.
    IgnoreDeadline,
}

/// A mock backend tracking its invocations.
#[derive(Debug, Clone)]
pub(crate) struct MockBackend {
    provision: MockProvision,
    execution: MockExecution,
    delay: Duration,
    provision_count: Arc<AtomicUsize>,
    execute_count: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
    last_payload: Arc<Mutex<Option<Vec<u8>>>>,
}

/// Flags cancellation when an execution future is dropped mid-flight.
struct CancelGuard(Arc<AtomicBool>);

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl MockBackend {
    /// Create a mock that provisions as given and answers every call with `{}`.
    pub fn new(provision: MockProvision) -> Self {
        Self {
            provision,
            execution: MockExecution::Respond(RemoteResult::Output { output: json!({}) }),
            delay: Duration::ZERO,
            provision_count: Arc::new(AtomicUsize::new(0)),
            execute_count: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
            last_payload: Arc::new(Mutex::new(None)),
        }
    }

    /// Delay every provisioning by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the execution behavior.
    pub fn with_execution(mut self, execution: MockExecution) -> Self {
        self.execution = execution;
        self
    }

    /// Number of times `provision` was called.
    pub fn provision_count(&self) -> usize {
        self.provision_count.load(Ordering::SeqCst)
    }

    /// Number of times `execute` was called.
    pub fn execute_count(&self) -> usize {
        self.execute_count.load(Ordering::SeqCst)
    }

    /// Whether an execution was torn down before finishing.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Payload of the most recent execution.
    pub fn last_payload(&self) -> Option<Vec<u8>> {
        self.last_payload.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn provision(&self, key: &EnvironmentKey) -> Result<EnvironmentHandle> {
        let count = self.provision_count.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match &self.provision {
            MockProvision::Build => Ok(EnvironmentHandle::new(
                self.kind(),
                key.clone(),
                format!("mock-{key}-{count}"),
                false,
            )),
            MockProvision::Exists => Ok(EnvironmentHandle::new(
                self.kind(),
                key.clone(),
                format!("mock-{key}"),
                true,
            )),
            MockProvision::Fail(msg) => Err(RemoteError::provisioning(key.to_string(), msg.clone())),
        }
    }

    async fn execute(&self, session: &CallSession, _handle: &EnvironmentHandle) -> Result<Execution> {
        self.execute_count.fetch_add(1, Ordering::SeqCst);
        *self.last_payload.lock().unwrap() = Some(session.payload().to_vec());

        match &self.execution {
            MockExecution::Respond(result) => Ok(Execution::Finished(result.clone())),
            MockExecution::Transport(msg) => Err(RemoteError::transport(msg.clone())),
            MockExecution::Hang => {
                tokio::time::sleep_until(session.deadline()).await;
                self.cancelled.store(true, Ordering::SeqCst);
                Ok(Execution::TimedOut)
            }
            MockExecution::IgnoreDeadline => {
                let _guard = CancelGuard(Arc::clone(&self.cancelled));
                Ok(std::future::pending::<Execution>().await)
            }
        }
    }
}

/// What a mock sandbox command does.
#[derive(Debug, Clone)]
pub(crate) enum MockCommand {
    /// Finish with the given output.
    Output(CommandOutput),
    /// Never finish.
    Hang,
    /// Fail with a transport error.
    Transport(String),
}

/// A mock sandbox service tracking its invocations.
#[derive(Debug, Clone)]
pub(crate) struct MockSandboxApi {
    exists: bool,
    build_failure: Option<String>,
    command: MockCommand,
    build_count: Arc<AtomicUsize>,
    create_count: Arc<AtomicUsize>,
    kill_count: Arc<AtomicUsize>,
    last_command: Arc<Mutex<Option<String>>>,
}

impl MockSandboxApi {
    /// Create a service where the environment `exists` or not, and every
    /// command exits cleanly without output.
    pub fn new(exists: bool) -> Self {
        Self {
            exists,
            build_failure: None,
            command: MockCommand::Output(CommandOutput::default()),
            build_count: Arc::new(AtomicUsize::new(0)),
            create_count: Arc::new(AtomicUsize::new(0)),
            kill_count: Arc::new(AtomicUsize::new(0)),
            last_command: Arc::new(Mutex::new(None)),
        }
    }

    /// Make every build fail with `message`.
    pub fn failing_build(mut self, message: &str) -> Self {
        self.build_failure = Some(message.to_string());
        self
    }

    /// Set the command behavior.
    pub fn with_command(mut self, command: MockCommand) -> Self {
        self.command = command;
        self
    }

    /// Number of builds.
    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }

    /// Number of sandboxes created.
    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    /// Number of sandboxes deleted.
    pub fn kill_count(&self) -> usize {
        self.kill_count.load(Ordering::SeqCst)
    }

    /// The most recent command.
    pub fn last_command(&self) -> Option<String> {
        self.last_command.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxApi for MockSandboxApi {
    fn service(&self) -> &'static str {
        "Mock"
    }

    async fn environment_exists(&self, _key: &EnvironmentKey) -> Result<bool> {
        Ok(self.exists)
    }

    async fn build_environment(
        &self,
        key: &EnvironmentKey,
        context: &BuildContext,
        _resources: &Resources,
    ) -> Result<String> {
        self.build_count.fetch_add(1, Ordering::SeqCst);
        context.dockerfile_contents()?;
        match &self.build_failure {
            Some(msg) => Err(RemoteError::transport(msg.clone())),
            None => Ok(format!("tpl-{key}")),
        }
    }

    async fn create_sandbox(&self, handle: &EnvironmentHandle, _lifetime: Duration) -> Result<String> {
        let count = self.create_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sbx-{}-{count}", handle.remote_id()))
    }

    async fn run_command(&self, _sandbox_id: &str, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        *self.last_command.lock().unwrap() = Some(command.to_string());
        match &self.command {
            MockCommand::Output(output) => Ok(output.clone()),
            MockCommand::Transport(msg) => Err(RemoteError::transport(msg.clone())),
            MockCommand::Hang => Ok(std::future::pending::<CommandOutput>().await),
        }
    }

    async fn kill_sandbox(&self, _sandbox_id: &str) -> Result<()> {
        self.kill_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_backend_tracks_provisions() {
        let backend = MockBackend::new(MockProvision::Exists);
        let key = EnvironmentKey::new("proj", "1.0.0").unwrap();
        assert_eq!(backend.provision_count(), 0);

        let handle = backend.provision(&key).await.unwrap();
        assert!(handle.is_reused());
        assert_eq!(backend.provision_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_backend_failure() {
        let backend = MockBackend::new(MockProvision::Fail("boom".to_string()));
        let key = EnvironmentKey::new("proj", "1.0.0").unwrap();
        let err = backend.provision(&key).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
