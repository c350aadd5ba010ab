//! Local subprocess backend
//!
//! Runs the shim as a child process of the caller:
//! ```bash
//! REMOTEFN_EXECUTION_MODE=1 remotefn-shim [args...] < invocation.json
//! ```
//!
//! The invocation is piped via stdin and the result is read from stdout.
//! There is nothing to build, so provisioning only checks that the shim
//! executable exists. The shim leads its own process group, and a session
//! that times out or is dropped kills the whole group, so processes the
//! shim started do not outlive it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use super::{interpret_output, Backend, Execution};
use crate::config::{BackendKind, SubprocessConfig};
use crate::error::{RemoteError, Result};
use crate::key::EnvironmentKey;
use crate::protocol::EXECUTION_MODE_ENV;
use crate::provision::EnvironmentHandle;
use crate::session::CallSession;

/// Backend running the shim as a local child process.
pub struct SubprocessBackend {
    config: SubprocessConfig,
    project_root: PathBuf,
}

impl SubprocessBackend {
    /// Creates a backend for `config`, resolving relative paths against `project_root`.
    pub fn new(config: SubprocessConfig, project_root: &Path) -> Self {
        Self {
            config,
            project_root: project_root.to_path_buf(),
        }
    }

    /// Finds the shim executable.
    ///
    /// A program containing a path separator is taken relative to the
    /// project root; a bare name is looked up on `PATH`.
    fn locate_program(&self) -> Option<PathBuf> {
        let program = Path::new(&self.config.program);
        if program.components().count() > 1 || program.is_absolute() {
            let path = if program.is_absolute() {
                program.to_path_buf()
            } else {
                self.project_root.join(program)
            };
            return path.is_file().then_some(path);
        }

        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }

    fn working_dir(&self) -> PathBuf {
        match &self.config.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_root.join(dir),
            None => self.project_root.clone(),
        }
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn provision(&self, key: &EnvironmentKey) -> Result<EnvironmentHandle> {
        let program = self.locate_program().ok_or_else(|| {
            RemoteError::provisioning(
                key.to_string(),
                format!(
                    "shim executable '{}' not found.\n\
                     \n\
                     Configure the path in remotefn.toml:\n\
                     [backend]\n\
                     type = \"subprocess\"\n\
                     program = \"/full/path/to/shim\"",
                    self.config.program
                ),
            )
        })?;

        info!("Using local shim {}", program.display());
        Ok(EnvironmentHandle::new(
            self.kind(),
            key.clone(),
            program.to_string_lossy(),
            false,
        ))
    }

    async fn execute(&self, session: &CallSession, handle: &EnvironmentHandle) -> Result<Execution> {
        let program = handle.remote_id();
        debug!(
            "Spawning {} for session {}",
            shell_words::join(std::iter::once(program).chain(self.config.args.iter().map(String::as_str))),
            session.id()
        );

        let mut command = tokio::process::Command::new(program);
        command
            .args(&self.config.args)
            .envs(&self.config.env)
            .env(EXECUTION_MODE_ENV, "1")
            .current_dir(self.working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| RemoteError::transport(format!("Failed to start shim '{program}': {e}")))?;
        let mut group = ProcessGroup(child.id());

        let outcome = tokio::select! {
            result = communicate(&mut child, session.payload()) => Some(result),
            () = sleep_until(session.deadline()) => None,
        };

        let Some(result) = outcome else {
            warn!("Session {} timed out; killing shim process group", session.id());
            group.kill();
            if let Err(e) = child.kill().await {
                warn!("Failed to kill shim process: {}", e);
            }
            return Ok(Execution::TimedOut);
        };

        // Once the shim is reaped its pid may be reused.
        if result.is_ok() {
            group.disarm();
        }
        let (status, stdout, stderr) = result?;
        debug!("Shim {} ({} bytes of stdout)", status, stdout.len());
        interpret_output(
            status.success(),
            &describe_exit(status),
            &String::from_utf8_lossy(&stdout),
            &String::from_utf8_lossy(&stderr),
        )
    }
}

/// Feeds `payload` to the child and collects its output until it exits.
async fn communicate(child: &mut Child, payload: &[u8]) -> Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let write = async move {
        if let Some(mut stdin) = stdin {
            // A shim that exits without reading its input closes the pipe;
            // its exit status tells the real story.
            if let Err(e) = stdin.write_all(payload).await {
                debug!("Writing invocation to shim failed: {}", e);
            }
        }
    };
    let read_stdout = async move {
        let mut buf = Vec::new();
        if let Some(mut stdout) = stdout {
            stdout.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let read_stderr = async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            stderr.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let ((), stdout, stderr) = tokio::join!(write, read_stdout, read_stderr);
    let status = child.wait().await?;
    Ok((status, stdout?, stderr?))
}

/// Process group led by a shim; killed on drop unless disarmed.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    /// Sends SIGKILL to every process in the group.
    fn kill(&mut self) {
        let Some(pgid) = self.0.take() else {
            return;
        };
        if cfg!(unix) {
            let status = std::process::Command::new("kill")
                .args(["-KILL", "--", &format!("-{pgid}")])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match status {
                Ok(status) if status.success() => debug!("Killed process group {}", pgid),
                Ok(status) => debug!("kill for process group {} {}", pgid, describe_exit(status)),
                Err(e) => warn!("Failed to run kill for process group {}: {}", pgid, e),
            }
        }
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => format!("was terminated ({status})"),
    }
}
