use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "remotefn")]
#[command(
    author,
    version,
    about = "Run typed functions in cloud sandboxes or local subprocesses"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project root holding remotefn.toml and the version metadata
    #[arg(long, global = true, env = "REMOTEFN_PROJECT", default_value = ".")]
    project: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the environment key a function resolves to
    Key {
        /// Function identifier (uses the project default backend if omitted)
        function: Option<String>,
    },

    /// Provision the environment ahead of the first call
    WarmUp {
        /// Function identifier (uses the project default backend if omitted)
        function: Option<String>,
    },

    /// Call a function with a JSON input and print its JSON output
    Call {
        /// Function identifier
        function: String,

        /// Input object as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,

        /// Timeout in milliseconds (overrides remotefn.toml)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "remotefn=debug" } else { "remotefn=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // Logs go to stderr so stdout carries only command output.
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Key { function } => {
            commands::key::run(&cli.project, function.as_deref())?;
        }
        Commands::WarmUp { function } => {
            commands::warm_up::run(&cli.project, function.as_deref()).await?;
        }
        Commands::Call {
            function,
            input,
            timeout,
        } => {
            return commands::call::run(&cli.project, &function, &input, timeout).await;
        }
    }

    Ok(ExitCode::SUCCESS)
}
