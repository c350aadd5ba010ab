//! Typed remote function execution.
//!
//! A function is bound once to an input schema, an output schema and an
//! execution backend. Calls encode and validate the input, make sure the
//! backend's environment for the project version exists, run the function
//! through the remote entry shim and validate what comes back:
//!
//! ```text
//! bind ──► warm_up (optional) ──► call ──► validate input
//!                                          provision (cached per key)
//!                                          execute via shim
//!                                          validate output
//! ```
//!
//! Backends:
//! - `subprocess`: the shim runs as a local child process
//! - `e2b`: the shim runs in an E2B sandbox built from a template
//! - `daytona`: the shim runs in a Daytona sandbox built from a snapshot

pub mod backend;
pub mod binding;
pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod protocol;
pub mod provision;
pub mod remote;
pub mod schema;
pub mod session;
pub mod shim;

pub use binding::{BindOptions, FunctionBinding};
pub use config::{BackendConfig, BackendKind, Config};
pub use error::{RemoteError, Result};
pub use key::EnvironmentKey;
pub use provision::{EnvironmentHandle, ProvisioningCache};
pub use remote::RemoteFunction;
pub use schema::{FieldType, Model, Schema};
pub use session::{CallSession, SessionReport, SessionStatus};
