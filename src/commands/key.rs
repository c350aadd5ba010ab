use anyhow::Result;
use std::path::Path;
use tracing::debug;

/// Prints the environment key without provisioning anything.
pub fn run(project: &Path, function: Option<&str>) -> Result<()> {
    let binding = super::bind(project, function, None)?;
    let key = remotefn::key::resolve(binding.backend(), binding.project_root())?;
    debug!("{} backend resolves '{}' to {}", binding.backend().kind(), binding.name(), key);

    println!("{key}");
    Ok(())
}
