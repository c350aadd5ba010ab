//! Wire format shared by the caller and the remote entry shim.
//!
//! The caller writes one [`Invocation`] as JSON to the shim's standard
//! input. The shim writes exactly one [`RemoteResult`] to standard output,
//! on a line starting with [`RESULT_MARKER`]. Any other stdout lines are
//! passthrough output from the function body and are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RemoteError, Result};

/// Prefix of the terminal result line on the shim's stdout.
pub const RESULT_MARKER: &str = "__REMOTEFN_RESULT__ ";

/// Set to `1` inside the shim process.
pub const EXECUTION_MODE_ENV: &str = "REMOTEFN_EXECUTION_MODE";

/// Returns true when running inside a remote entry shim.
pub fn in_execution_mode() -> bool {
    std::env::var(EXECUTION_MODE_ENV).is_ok_and(|v| v == "1")
}

/// The serialized input sent to the shim for one call session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Session this invocation belongs to, for log correlation.
    pub session: Uuid,
    /// Stable function identifier looked up in the shim's registry.
    pub function: String,
    /// Encoded function input.
    pub input: Value,
}

impl Invocation {
    /// Serializes the invocation to the bytes written to the shim's stdin.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| RemoteError::decode(format!("failed to encode invocation: {e}")))
    }

    /// Parses an invocation read by the shim.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RemoteError::decode(format!("malformed invocation: {e}")))
    }
}

/// Where an error descriptor was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorOrigin {
    /// The user's function returned an error.
    Function,
    /// The shim could not run the function at all.
    Shim,
}

/// Error kinds reported by the shim itself.
pub mod shim_kind {
    /// Stdin did not hold a valid invocation.
    pub const INVALID_INVOCATION: &str = "InvalidInvocation";
    /// No function is registered under the requested identifier.
    pub const UNKNOWN_FUNCTION: &str = "UnknownFunction";
    /// The input did not match the function's input schema.
    pub const INVALID_INPUT: &str = "InvalidInput";
    /// The function's return value did not match its output schema.
    pub const INVALID_OUTPUT: &str = "InvalidOutput";
}

/// A serialized error raised on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Error type name.
    pub kind: String,
    /// Rendered error message.
    pub message: String,
    /// Whether the error came from the function body or the shim.
    pub origin: ErrorOrigin,
}

impl ErrorDescriptor {
    /// Describes an error returned by the user's function.
    pub fn function(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            origin: ErrorOrigin::Function,
        }
    }

    /// Describes a failure of the shim itself.
    pub fn shim(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            origin: ErrorOrigin::Shim,
        }
    }

    /// Maps the descriptor onto the caller-side error taxonomy.
    pub fn into_error(self) -> RemoteError {
        match self.origin {
            ErrorOrigin::Function => RemoteError::function(self.kind, self.message),
            ErrorOrigin::Shim => match self.kind.as_str() {
                shim_kind::UNKNOWN_FUNCTION => RemoteError::configuration(self.message),
                shim_kind::INVALID_INPUT | shim_kind::INVALID_OUTPUT => {
                    RemoteError::validation("$", self.message)
                }
                _ => RemoteError::decode(self.message),
            },
        }
    }
}

/// Outcome reported by the shim: exactly one of an output or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RemoteResult {
    /// The function returned a value.
    #[serde(rename = "ok")]
    Output {
        /// Encoded function output.
        output: Value,
    },
    /// The function or the shim failed.
    #[serde(rename = "error")]
    Error {
        /// What went wrong.
        error: ErrorDescriptor,
    },
}

impl RemoteResult {
    /// Renders the terminal result line, marker included, without a newline.
    pub fn to_line(&self) -> Result<String> {
        let json = serde_json::to_string(self)
            .map_err(|e| RemoteError::decode(format!("failed to encode result: {e}")))?;
        Ok(format!("{RESULT_MARKER}{json}"))
    }

    /// Extracts the last result line from shim stdout.
    ///
    /// Returns `Ok(None)` when no line carries the marker, which means the
    /// shim died before reporting.
    pub fn from_stdout(stdout: &str) -> Result<Option<Self>> {
        let Some(line) = stdout
            .lines()
            .rev()
            .find_map(|line| line.trim_end_matches('\r').strip_prefix(RESULT_MARKER))
        else {
            return Ok(None);
        };

        serde_json::from_str(line)
            .map(Some)
            .map_err(|e| RemoteError::decode(format!("malformed result line: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_line_ignores_passthrough_output() {
        let ok = RemoteResult::Output {
            output: json!({"greeting": "Hello World!"}),
        };
        let stdout = format!(
            "starting up\n{{\"looks\": \"like json\"}}\n{}\n",
            ok.to_line().unwrap()
        );

        let parsed = RemoteResult::from_stdout(&stdout).unwrap();
        assert_eq!(parsed, Some(ok));
    }

    #[test]
    fn test_last_marker_line_wins() {
        let first = RemoteResult::Output { output: json!({"n": 1}) };
        let last = RemoteResult::Output { output: json!({"n": 2}) };
        let stdout = format!("{}\n{}\n", first.to_line().unwrap(), last.to_line().unwrap());
        assert_eq!(RemoteResult::from_stdout(&stdout).unwrap(), Some(last));
    }

    #[test]
    fn test_missing_result_line() {
        assert_eq!(RemoteResult::from_stdout("just logs\n").unwrap(), None);
    }

    #[test]
    fn test_malformed_result_line() {
        let stdout = format!("{RESULT_MARKER}{{not json");
        let err = RemoteResult::from_stdout(&stdout).unwrap_err();
        assert!(matches!(err, RemoteError::Decode { .. }));
    }

    #[test]
    fn test_result_wire_shape() {
        let err = RemoteResult::Error {
            error: ErrorDescriptor::function("ValueError", "boom"),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value,
            json!({
                "status": "error",
                "error": {"kind": "ValueError", "message": "boom", "origin": "function"}
            })
        );
    }

    #[test]
    fn test_descriptor_mapping() {
        let function = ErrorDescriptor::function("Overflow", "too big").into_error();
        assert!(function.is_function());

        let unknown = ErrorDescriptor::shim(shim_kind::UNKNOWN_FUNCTION, "nope").into_error();
        assert!(matches!(unknown, RemoteError::Configuration { .. }));

        let input = ErrorDescriptor::shim(shim_kind::INVALID_INPUT, "bad").into_error();
        assert!(input.is_validation());
    }

    #[test]
    fn test_invocation_rejects_garbage() {
        let err = Invocation::from_slice(b"{\"function\": 3}").unwrap_err();
        assert!(matches!(err, RemoteError::Decode { .. }));
    }
}
