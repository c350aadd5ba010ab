//! Remote entry shim.
//!
//! The shim is the program the backends start inside the execution
//! environment. It reads one [`Invocation`] from stdin, looks the function
//! up in a [`Registry`], runs it and writes exactly one result line to
//! stdout. Anything the function itself prints passes through untouched.
//!
//! ```ignore
//! use remotefn::shim::Registry;
//!
//! async fn greet(input: Greet) -> Result<Greeting, std::convert::Infallible> {
//!     Ok(Greeting { greeting: format!("Hello {}!", input.name) })
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     remotefn::shim::serve(&Registry::new().register("greet", greet)).await
//! }
//! ```

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::protocol::{shim_kind, ErrorDescriptor, ErrorOrigin, Invocation, RemoteResult};
use crate::schema::{Model, Schema};

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ErrorDescriptor>> + Send + Sync>;

struct Entry {
    input: Schema,
    output: Schema,
    handler: Handler,
}

/// Functions the shim can dispatch to, keyed by identifier.
#[derive(Default)]
pub struct Registry {
    functions: BTreeMap<String, Entry>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `function` under `name`. A later registration with the
    /// same name replaces the earlier one.
    ///
    /// The error kind reported to the caller is the short type name of `E`.
    #[must_use]
    pub fn register<I, O, E, F, Fut>(mut self, name: &str, function: F) -> Self
    where
        I: Model,
        O: Model,
        E: Display + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<O, E>> + Send + 'static,
    {
        let function = Arc::new(function);
        let handler: Handler = Arc::new(move |value: Value| {
            let function = Arc::clone(&function);
            async move {
                let input: I = serde_json::from_value(value)
                    .map_err(|e| ErrorDescriptor::shim(shim_kind::INVALID_INPUT, e.to_string()))?;
                let output = function(input)
                    .await
                    .map_err(|e| ErrorDescriptor::function(short_type_name::<E>(), e.to_string()))?;
                serde_json::to_value(output)
                    .map_err(|e| ErrorDescriptor::shim(shim_kind::INVALID_OUTPUT, e.to_string()))
            }
            .boxed()
        });

        let entry = Entry {
            input: I::schema(),
            output: O::schema(),
            handler,
        };
        if self.functions.insert(name.to_string(), entry).is_some() {
            warn!("Function '{}' registered twice; keeping the last registration", name);
        }
        self
    }

    /// Registered function identifiers.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Runs the invocation in `payload` and returns its result.
    ///
    /// Never fails: every problem becomes an error result.
    pub async fn dispatch(&self, payload: &[u8]) -> RemoteResult {
        match self.try_dispatch(payload).await {
            Ok(output) => RemoteResult::Output { output },
            Err(error) => RemoteResult::Error { error },
        }
    }

    async fn try_dispatch(&self, payload: &[u8]) -> Result<Value, ErrorDescriptor> {
        let invocation = Invocation::from_slice(payload)
            .map_err(|e| ErrorDescriptor::shim(shim_kind::INVALID_INVOCATION, e.to_string()))?;
        info!("Running '{}' for session {}", invocation.function, invocation.session);

        let entry = self.functions.get(&invocation.function).ok_or_else(|| {
            ErrorDescriptor::shim(
                shim_kind::UNKNOWN_FUNCTION,
                format!(
                    "no function registered as '{}' (available: {})",
                    invocation.function,
                    self.names().collect::<Vec<_>>().join(", ")
                ),
            )
        })?;

        entry
            .input
            .validate(&invocation.input)
            .map_err(|e| ErrorDescriptor::shim(shim_kind::INVALID_INPUT, e.to_string()))?;

        let output = AssertUnwindSafe((entry.handler)(invocation.input))
            .catch_unwind()
            .await
            .map_err(|panic| ErrorDescriptor::function("Panic", panic_message(panic.as_ref())))??;

        entry
            .output
            .validate(&output)
            .map_err(|e| ErrorDescriptor::shim(shim_kind::INVALID_OUTPUT, e.to_string()))?;
        Ok(output)
    }
}

/// Reads an invocation from `reader`, dispatches it and writes the result
/// line to `writer`.
pub async fn serve_io<R, W>(registry: &Registry, mut reader: R, mut writer: W) -> Result<RemoteResult>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload).await?;
    debug!("Read {} byte invocation", payload.len());

    let result = registry.dispatch(&payload).await;
    let line = result.to_line()?;

    // Passthrough output written through std's buffered stdout must land
    // before the result line.
    if let Err(e) = std::io::stdout().flush() {
        debug!("Flushing passthrough output failed: {}", e);
    }

    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(result)
}

/// Serves one invocation on stdin/stdout.
///
/// Exits with 0 on success, 1 when the function failed and 2 when the shim
/// could not run the function at all.
pub async fn serve(registry: &Registry) -> ExitCode {
    match serve_io(registry, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(result) => exit_code(&result),
        Err(e) => {
            error!("Shim failed to report a result: {}", e);
            ExitCode::from(2)
        }
    }
}

fn exit_code(result: &RemoteResult) -> ExitCode {
    match result {
        RemoteResult::Output { .. } => ExitCode::SUCCESS,
        RemoteResult::Error { error } if error.origin == ErrorOrigin::Function => ExitCode::from(1),
        RemoteResult::Error { .. } => ExitCode::from(2),
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}
