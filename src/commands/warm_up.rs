use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use remotefn::{backend, session, ProvisioningCache};

pub async fn run(project: &Path, function: Option<&str>) -> Result<()> {
    let binding = super::bind(project, function, None)?;
    let backend = backend::from_config(binding.backend(), binding.project_root());

    let handle = session::warm_up(&binding, backend.as_ref(), &ProvisioningCache::global()).await?;

    let state = if handle.is_reused() {
        "already present".dimmed()
    } else {
        "built".green().bold()
    };
    eprintln!(
        "{} {} environment {} {}",
        "✓".green(),
        handle.kind(),
        handle.key().to_string().cyan(),
        state
    );
    println!("{}", handle.remote_id());
    Ok(())
}
