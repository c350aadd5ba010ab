use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use std::path::Path;
use std::process::ExitCode;

use remotefn::{backend, session, ProvisioningCache, RemoteError, SessionStatus};

/// Calls `function` once and prints its output.
///
/// Exits with 1 when the function itself failed and 2 for every
/// infrastructure failure.
pub async fn run(project: &Path, function: &str, input: &str, timeout: Option<u64>) -> Result<ExitCode> {
    let input: Value = serde_json::from_str(input).context("--input is not valid JSON")?;
    let binding = super::bind(project, Some(function), timeout)?;
    let backend = backend::from_config(binding.backend(), binding.project_root());

    let report =
        session::call_with_report(&binding, input, backend.as_ref(), &ProvisioningCache::global()).await;

    match report.result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!(
                "{} Session {} {}: {}",
                "✗".red(),
                report.id,
                describe(report.status).red().bold(),
                e
            );
            Ok(exit_code(&e))
        }
    }
}

fn describe(status: SessionStatus) -> String {
    match status {
        SessionStatus::Pending => "rejected".to_string(),
        other => other.to_string(),
    }
}

fn exit_code(error: &RemoteError) -> ExitCode {
    if error.is_function() {
        ExitCode::from(1)
    } else {
        ExitCode::from(2)
    }
}
