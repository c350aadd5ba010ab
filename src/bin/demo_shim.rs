//! Demo entry shim with a handful of functions for trying out the backends.
//!
//! Point a subprocess backend at it:
//! ```toml
//! [backend]
//! type = "subprocess"
//! program = "target/debug/remotefn-demo-shim"
//! ```

use remotefn::schema::{FieldType, Model, Schema};
use remotefn::shim::{self, Registry};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::process::ExitCode;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
}

impl Model for Greet {
    fn schema() -> Schema {
        Schema::object("Greet").required("name", FieldType::String)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    greeting: String,
}

impl Model for Greeting {
    fn schema() -> Schema {
        Schema::object("Greeting").required("greeting", FieldType::String)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Nap {
    millis: u64,
    #[serde(default)]
    pid_file: Option<String>,
}

impl Model for Nap {
    fn schema() -> Schema {
        Schema::object("Nap")
            .required("millis", FieldType::Integer)
            .optional("pid_file", FieldType::String)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Woke {
    slept_millis: u64,
}

impl Model for Woke {
    fn schema() -> Schema {
        Schema::object("Woke").required("slept_millis", FieldType::Integer)
    }
}

#[derive(Debug, Error)]
enum DemoError {
    #[error("refusing to greet {0}")]
    Refused(String),
    #[error("failed to write pid file: {0}")]
    PidFile(#[from] std::io::Error),
}

async fn greet(input: Greet) -> Result<Greeting, Infallible> {
    Ok(Greeting {
        greeting: format!("Hello {}!", input.name),
    })
}

async fn chatty(input: Greet) -> Result<Greeting, Infallible> {
    println!("preparing a greeting for {}", input.name);
    println!("{{\"not\": \"the result\"}}");
    Ok(Greeting {
        greeting: format!("Hello {}!", input.name),
    })
}

async fn refuse(input: Greet) -> Result<Greeting, DemoError> {
    Err(DemoError::Refused(input.name))
}

async fn crash(_input: Greet) -> Result<Greeting, Infallible> {
    std::process::abort()
}

async fn slow(input: Nap) -> Result<Woke, DemoError> {
    if let Some(path) = &input.pid_file {
        std::fs::write(path, std::process::id().to_string())?;
    }
    tokio::time::sleep(Duration::from_millis(input.millis)).await;
    Ok(Woke {
        slept_millis: input.millis,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remotefn=info")))
        .init();

    let registry = Registry::new()
        .register("greet", greet)
        .register("chatty", chatty)
        .register("refuse", refuse)
        .register("crash", crash)
        .register("slow", slow);

    shim::serve(&registry).await
}
