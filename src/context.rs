//! Build contexts for environment images.
//!
//! A build context is a Dockerfile plus the directory it is built from.
//! Cloud backends upload it as a tar archive when a template or snapshot
//! has to be built.

use bytes::Bytes;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Builder;

use crate::error::{RemoteError, Result};

const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// A Dockerfile and its context directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    dockerfile: PathBuf,
    root: PathBuf,
}

impl BuildContext {
    /// Locates the Dockerfile for a project.
    ///
    /// `dockerfile` is the config override: absolute, `~/`-prefixed, or
    /// relative to `project_root`. Without it `<project_root>/Dockerfile`
    /// is used.
    pub fn resolve(project_root: &Path, dockerfile: Option<&str>) -> Result<Self> {
        let dockerfile = match dockerfile {
            Some(path) => {
                let path = PathBuf::from(expand_path(path)?);
                if path.is_absolute() {
                    path
                } else {
                    project_root.join(path)
                }
            }
            None => project_root.join(DEFAULT_DOCKERFILE),
        };

        if !dockerfile.exists() {
            return Err(RemoteError::configuration(format!(
                "Dockerfile not found at path: {}. Specify dockerfile_path in config \
                 or ensure a Dockerfile exists in the project root.",
                dockerfile.display()
            )));
        }
        if !dockerfile.is_file() {
            return Err(RemoteError::configuration(format!(
                "Dockerfile path is not a file: {}",
                dockerfile.display()
            )));
        }

        Ok(Self {
            dockerfile,
            root: project_root.to_path_buf(),
        })
    }

    /// Path of the Dockerfile.
    pub fn dockerfile(&self) -> &Path {
        &self.dockerfile
    }

    /// Context directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the Dockerfile.
    pub fn dockerfile_contents(&self) -> Result<String> {
        fs::read_to_string(&self.dockerfile).map_err(|e| {
            RemoteError::configuration(format!(
                "Failed to read Dockerfile {}: {e}",
                self.dockerfile.display()
            ))
        })
    }

    /// Packs the context directory into a tar archive.
    pub fn archive(&self) -> Result<Bytes> {
        let mut tar_buf = Vec::new();
        {
            let mut tar = Builder::new(&mut tar_buf);
            tar.append_dir_all(".", &self.root).map_err(|e| {
                RemoteError::configuration(format!(
                    "Failed to create tarball from {}: {e}",
                    self.root.display()
                ))
            })?;
            tar.finish().map_err(|e| {
                RemoteError::configuration(format!("Failed to finalize tarball: {e}"))
            })?;
        }
        Ok(Bytes::from(tar_buf))
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| RemoteError::configuration("Could not determine home directory"))?;
        Ok(home.join(rest).to_string_lossy().into_owned())
    } else {
        Ok(path.to_string())
    }
}
