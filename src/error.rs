//! Domain-specific error types for remote execution.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Infrastructure failures
//! (configuration, provisioning, transport, timeout) are kept apart from
//! errors raised by the remote function body itself.

use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

/// Errors that can occur while binding, provisioning or calling a remote function.
///
/// Every variant carries owned strings only, so the type is `Clone` and a
/// single provisioning failure can be handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Unresolvable key or version, or a missing required backend field.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The backend failed to build or create the environment.
    #[error("Provisioning of '{key}' failed: {message}")]
    Provisioning { key: String, message: String },

    /// A value does not conform to its declared schema.
    #[error("Validation failed at {path}: {message}")]
    Validation { path: String, message: String },

    /// A payload could not be parsed.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Network or process I/O failed.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The remote invocation did not finish before its deadline.
    #[error("Remote execution exceeded timeout of {timeout_millis}ms")]
    TimedOut { timeout_millis: u64 },

    /// The remote function body itself returned an error.
    #[error("Remote function raised {kind}: {message}")]
    Function { kind: String, message: String },
}

impl RemoteError {
    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a `Provisioning` error for the given environment key.
    pub fn provisioning(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Creates a `Validation` error at a JSON path such as `$.user.name`.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a `Decode` error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a `TimedOut` error from a `Duration`.
    pub fn timed_out(duration: Duration) -> Self {
        Self::TimedOut {
            timeout_millis: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a `Function` error carrying the remote error's kind and message.
    pub fn function(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Function {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Returns true if this is a transport failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns true if this is a schema validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns true if this is a provisioning failure.
    pub fn is_provisioning(&self) -> bool {
        matches!(self, Self::Provisioning { .. })
    }

    /// Returns true if this error was raised by the user's function body.
    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function { .. })
    }

    /// Returns true if the error originates from infrastructure rather than
    /// from the user's function.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Provisioning { .. } | Self::Transport { .. } | Self::TimedOut { .. }
        )
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}
