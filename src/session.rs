//! Call sessions: the lifecycle of one remote invocation.
//!
//! ```text
//! Pending ──► Running ──┬──► Succeeded
//!                       ├──► Failed
//!                       └──► TimedOut
//! ```
//!
//! A session is consumed by [`CallSession::run`], so it cannot be reused.
//! The deadline is fixed when the session is created, which [`call`] does
//! only once the environment is ready.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, Execution};
use crate::binding::FunctionBinding;
use crate::error::{RemoteError, Result};
use crate::key;
use crate::protocol::{Invocation, RemoteResult};
use crate::provision::{EnvironmentHandle, ProvisioningCache};

/// Extra time granted to a backend past the deadline before its execution
/// future is dropped.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

/// Status of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, input not yet handed to the backend.
    Pending,
    /// The backend is executing.
    Running,
    /// A validated output was received.
    Succeeded,
    /// The function, the shim or the transport failed.
    Failed,
    /// The deadline passed.
    TimedOut,
}

impl SessionStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded | Self::Failed | Self::TimedOut)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed-out"),
        }
    }
}

/// One invocation of a bound function.
#[derive(Debug)]
pub struct CallSession {
    id: Uuid,
    function: String,
    input: Value,
    payload: Vec<u8>,
    started_at: DateTime<Utc>,
    deadline: Instant,
    timeout: Duration,
    status: SessionStatus,
}

/// Final state of a session.
#[derive(Debug)]
pub struct SessionReport {
    /// Session id.
    pub id: Uuid,
    /// Terminal status, or `Pending` if the call never reached the backend.
    pub status: SessionStatus,
    /// Validated output or exactly one error.
    pub result: Result<Value>,
    /// When the session was created.
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    /// Starts a session for `binding`; the deadline is now + the binding's timeout.
    pub fn new(binding: &FunctionBinding, input: Value) -> Self {
        let timeout = binding.timeout();
        Self {
            id: Uuid::new_v4(),
            function: binding.name().to_string(),
            input,
            payload: Vec::new(),
            started_at: Utc::now(),
            deadline: Instant::now() + timeout,
            timeout,
            status: SessionStatus::Pending,
        }
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Function identifier.
    pub fn function(&self) -> &str {
        &self.function
    }

    /// Serialized invocation; empty until the session is running.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Absolute deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Wall-clock start time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Ends the session before it ever ran.
    fn rejected(self, error: RemoteError) -> SessionReport {
        warn!("Session {} for '{}' rejected: {}", self.id, self.function, error);
        SessionReport {
            id: self.id,
            status: self.status,
            result: Err(error),
            started_at: self.started_at,
        }
    }

    fn advance(&mut self, next: SessionStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal session transition {} -> {}",
            self.status,
            next
        );
        debug!("Session {} {} -> {}", self.id, self.status, next);
        self.status = next;
    }

    /// Drives the session to a terminal state.
    pub async fn run(
        mut self,
        binding: &FunctionBinding,
        backend: &dyn Backend,
        handle: &EnvironmentHandle,
    ) -> SessionReport {
        let result = self.drive(binding, backend, handle).await;
        match &result {
            Ok(_) => info!("Session {} for '{}' succeeded", self.id, self.function),
            Err(e) => warn!("Session {} for '{}' {}: {}", self.id, self.function, self.status, e),
        }
        SessionReport {
            id: self.id,
            status: self.status,
            result,
            started_at: self.started_at,
        }
    }

    async fn drive(
        &mut self,
        binding: &FunctionBinding,
        backend: &dyn Backend,
        handle: &EnvironmentHandle,
    ) -> Result<Value> {
        binding.check_input(&self.input)?;
        self.payload = Invocation {
            session: self.id,
            function: self.function.clone(),
            input: self.input.clone(),
        }
        .to_bytes()?;

        self.advance(SessionStatus::Running);
        info!(
            "Dispatching '{}' to {} environment '{}' (session {})",
            self.function,
            backend.kind(),
            handle.key(),
            self.id
        );

        let execution =
            tokio::time::timeout_at(self.deadline + DEADLINE_GRACE, backend.execute(self, handle)).await;

        let execution = match execution {
            Err(_) => {
                warn!("Backend ignored the deadline of session {}; cancelled", self.id);
                Execution::TimedOut
            }
            Ok(Err(e)) => {
                self.advance(SessionStatus::Failed);
                return Err(e);
            }
            Ok(Ok(execution)) => execution,
        };

        match execution {
            Execution::TimedOut => {
                self.advance(SessionStatus::TimedOut);
                Err(RemoteError::timed_out(self.timeout))
            }
            Execution::Finished(RemoteResult::Error { error }) => {
                self.advance(SessionStatus::Failed);
                Err(error.into_error())
            }
            Execution::Finished(RemoteResult::Output { output }) => {
                if let Err(e) = binding.check_output(&output) {
                    self.advance(SessionStatus::Failed);
                    return Err(e);
                }
                self.advance(SessionStatus::Succeeded);
                Ok(output)
            }
        }
    }
}

/// Calls a bound function with an encoded input.
///
/// The input is validated before anything touches the backend. The
/// environment comes from `cache`, so it is only built on the first call
/// if [`warm_up`] was not run.
pub async fn call(
    binding: &FunctionBinding,
    input: Value,
    backend: &dyn Backend,
    cache: &ProvisioningCache,
) -> Result<Value> {
    call_with_report(binding, input, backend, cache).await.result
}

/// Like [`call`], returning the full session report.
///
/// The session, and with it the deadline, starts once the environment is
/// ready. Provisioning is shared by every caller of the key and bounded by
/// the backend's own build timeout, not by the call's timeout.
pub async fn call_with_report(
    binding: &FunctionBinding,
    input: Value,
    backend: &dyn Backend,
    cache: &ProvisioningCache,
) -> SessionReport {
    if let Err(e) = binding.check_input(&input) {
        return CallSession::new(binding, input).rejected(e);
    }

    let handle = match warm_up(binding, backend, cache).await {
        Ok(handle) => handle,
        Err(e) => return CallSession::new(binding, input).rejected(e),
    };

    CallSession::new(binding, input).run(binding, backend, &handle).await
}

/// Resolves the binding's environment key and provisions it through `cache`.
pub async fn warm_up(
    binding: &FunctionBinding,
    backend: &dyn Backend,
    cache: &ProvisioningCache,
) -> Result<EnvironmentHandle> {
    let key = key::resolve(binding.backend(), binding.project_root())?;
    cache.provision(backend, &key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockExecution, MockProvision};
    use crate::binding::BindOptions;
    use crate::protocol::ErrorDescriptor;
    use crate::schema::{FieldType, Schema};
    use serde_json::json;

    fn binding(timeout_millis: u64) -> FunctionBinding {
        FunctionBinding::bind(
            "greet",
            Schema::object("Greet").required("name", FieldType::String),
            Schema::object("Greeting").required("greeting", FieldType::String),
            BindOptions::new(".").timeout_millis(timeout_millis),
        )
        .unwrap()
    }

    #[test]
    fn test_transitions() {
        use SessionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(TimedOut));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!TimedOut.can_transition_to(Succeeded));
        assert!(!Failed.can_transition_to(Running));
        assert!(Succeeded.is_terminal() && Failed.is_terminal() && TimedOut.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_deadline_fixed_at_creation() {
        let session = CallSession::new(&binding(1000), json!({"name": "x"}));
        assert_eq!(session.status(), SessionStatus::Pending);
        assert!(session.remaining() <= Duration::from_millis(1000));
        assert!(session.deadline() <= Instant::now() + Duration::from_millis(1000));
        assert!(session.payload().is_empty());
    }

    #[tokio::test]
    async fn test_success() {
        let backend = MockBackend::new(MockProvision::Build).with_execution(MockExecution::Respond(
            RemoteResult::Output {
                output: json!({"greeting": "Hello World!"}),
            },
        ));
        let cache = ProvisioningCache::new();

        let report = call_with_report(&binding(300_000), json!({"name": "World"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::Succeeded);
        assert_eq!(report.result.unwrap(), json!({"greeting": "Hello World!"}));

        let payload = backend.last_payload().unwrap();
        let invocation = Invocation::from_slice(&payload).unwrap();
        assert_eq!(invocation.function, "greet");
        assert_eq!(invocation.session, report.id);
    }

    #[tokio::test]
    async fn test_invalid_input_makes_no_backend_calls() {
        let backend = MockBackend::new(MockProvision::Build);
        let cache = ProvisioningCache::new();

        let report = call_with_report(&binding(1000), json!({"name": 5}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::Pending);
        assert!(report.result.unwrap_err().is_validation());

        let report = call_with_report(&binding(1000), json!({}), &backend, &cache).await;
        assert!(report.result.unwrap_err().is_validation());

        assert_eq!(backend.provision_count(), 0);
        assert_eq!(backend.execute_count(), 0);
    }

    #[tokio::test]
    async fn test_function_error_fails_session() {
        let backend = MockBackend::new(MockProvision::Build).with_execution(MockExecution::Respond(
            RemoteResult::Error {
                error: ErrorDescriptor::function("NameError", "unknown person"),
            },
        ));
        let cache = ProvisioningCache::new();

        let report = call_with_report(&binding(1000), json!({"name": "x"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::Failed);
        let err = report.result.unwrap_err();
        assert!(err.is_function());
        assert!(!err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_output_schema_mismatch_fails_session() {
        let backend = MockBackend::new(MockProvision::Build).with_execution(MockExecution::Respond(
            RemoteResult::Output {
                output: json!({"greeting": 42}),
            },
        ));
        let cache = ProvisioningCache::new();

        let report = call_with_report(&binding(1000), json!({"name": "x"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::Failed);
        assert!(report.result.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_transport_error_fails_session() {
        let backend = MockBackend::new(MockProvision::Build)
            .with_execution(MockExecution::Transport("connection reset".to_string()));
        let cache = ProvisioningCache::new();

        let report = call_with_report(&binding(1000), json!({"name": "x"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::Failed);
        assert!(report.result.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_timeout() {
        let backend = MockBackend::new(MockProvision::Build).with_execution(MockExecution::Hang);
        let cache = ProvisioningCache::new();

        let report = call_with_report(&binding(50), json!({"name": "x"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::TimedOut);
        let err = report.result.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err, RemoteError::TimedOut { timeout_millis: 50 });
        assert!(backend.was_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_ignoring_deadline_is_cancelled() {
        let backend = MockBackend::new(MockProvision::Build).with_execution(MockExecution::IgnoreDeadline);
        let cache = ProvisioningCache::new();

        let report = call_with_report(&binding(50), json!({"name": "x"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::TimedOut);
        assert!(backend.was_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_starts_after_provisioning() {
        let backend = MockBackend::new(MockProvision::Build)
            .with_delay(Duration::from_millis(1000))
            .with_execution(MockExecution::Hang);
        let cache = ProvisioningCache::new();

        let start = Instant::now();
        let report = call_with_report(&binding(50), json!({"name": "x"}), &backend, &cache).await;
        assert_eq!(report.status, SessionStatus::TimedOut);
        assert_eq!(backend.execute_count(), 1);
        // The shim got its whole 50ms after the 1s build.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1050), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1050) + DEADLINE_GRACE, "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_provisioning_failure_surfaces() {
        let backend = MockBackend::new(MockProvision::Fail("no capacity".to_string()));
        let cache = ProvisioningCache::new();

        let err = call(&binding(1000), json!({"name": "x"}), &backend, &cache)
            .await
            .unwrap_err();
        assert!(err.is_provisioning());
        assert_eq!(backend.execute_count(), 0);
    }

    #[tokio::test]
    async fn test_calls_share_one_environment() {
        let backend = MockBackend::new(MockProvision::Build).with_execution(MockExecution::Respond(
            RemoteResult::Output {
                output: json!({"greeting": "hi"}),
            },
        ));
        let cache = ProvisioningCache::new();
        let b = binding(1000);

        warm_up(&b, &backend, &cache).await.unwrap();
        for _ in 0..3 {
            call(&b, json!({"name": "x"}), &backend, &cache).await.unwrap();
        }
        assert_eq!(backend.provision_count(), 1);
        assert_eq!(backend.execute_count(), 3);
    }
}
