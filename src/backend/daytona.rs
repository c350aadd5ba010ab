//! Daytona sandbox service client.
//!
//! Snapshots are addressed by name (`{name}-v{version}`). The build
//! context is uploaded to object storage first, then a snapshot is
//! created from the Dockerfile and polled until it becomes active.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

use super::cloud::{
    ensure_success, http_error, read_json, whole_secs, CommandOutput, SandboxApi, BUILD_POLL_INTERVAL,
    BUILD_TIMEOUT,
};
use crate::config::{DaytonaConfig, Resources};
use crate::context::BuildContext;
use crate::error::{RemoteError, Result};
use crate::key::EnvironmentKey;
use crate::provision::EnvironmentHandle;

const SERVICE: &str = "Daytona";

/// Client for the Daytona REST API.
pub struct DaytonaApi {
    config: DaytonaConfig,
    client: Client,
    api_key: OnceLock<Result<String>>,
}

#[derive(Debug, Deserialize)]
struct ContextUpload {
    hash: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildInfo {
    dockerfile_content: String,
    context_hashes: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRequest<'a> {
    name: &'a str,
    build_info: BuildInfo,
    cpu: u32,
    memory: u64,
    disk: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    id: String,
    state: String,
    #[serde(default)]
    error_reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxRequest<'a> {
    snapshot: &'a str,
    auto_delete_interval: u64,
}

#[derive(Debug, Deserialize)]
struct Sandbox {
    id: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    command: &'a str,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    exit_code: i32,
    #[serde(default)]
    result: String,
}

impl DaytonaApi {
    /// Creates a client. The API key is resolved on first use.
    pub fn new(config: DaytonaConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            api_key: OnceLock::new(),
        }
    }

    fn api_key(&self) -> Result<String> {
        self.api_key
            .get_or_init(|| self.config.resolve_api_key())
            .clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        Ok(self.client.request(method, self.url(path)).bearer_auth(self.api_key()?))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| http_error(SERVICE, &e))
    }

    async fn get_snapshot(&self, name: &str) -> Result<Option<Snapshot>> {
        let response = self
            .send(self.request(Method::GET, &format!("/snapshots/{name}"))?)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(SERVICE, "snapshot lookup", response).await?;
        read_json(SERVICE, "snapshot lookup", response).await.map(Some)
    }

    async fn upload_context(&self, context: &BuildContext) -> Result<String> {
        let response = self
            .send(
                self.request(Method::POST, "/object-storage/contexts")?
                    .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
                    .body(context.archive()?),
            )
            .await?;
        let response = ensure_success(SERVICE, "build context upload", response).await?;
        let upload: ContextUpload = read_json(SERVICE, "build context upload", response).await?;
        Ok(upload.hash)
    }

    async fn wait_for_snapshot(&self, name: &str) -> Result<Snapshot> {
        let mut last_state = String::new();
        loop {
            tokio::time::sleep(BUILD_POLL_INTERVAL).await;

            let snapshot = self.get_snapshot(name).await?.ok_or_else(|| {
                RemoteError::transport(format!("snapshot '{name}' disappeared during the build"))
            })?;

            if snapshot.state != last_state {
                info!("[Daytona snapshot build] {}", snapshot.state);
                last_state.clone_from(&snapshot.state);
            }

            match snapshot.state.as_str() {
                "active" => return Ok(snapshot),
                "error" | "build_failed" => {
                    return Err(RemoteError::transport(format!(
                        "snapshot build failed: {}",
                        snapshot.error_reason.as_deref().unwrap_or("no reason given")
                    )));
                }
                _ => {}
            }
        }
    }

    async fn wait_until_active(&self, name: &str) -> Result<Snapshot> {
        tokio::time::timeout(BUILD_TIMEOUT, self.wait_for_snapshot(name))
            .await
            .map_err(|_| {
                RemoteError::transport(format!(
                    "snapshot build did not finish within {} minutes",
                    BUILD_TIMEOUT.as_secs() / 60
                ))
            })?
    }

    async fn wait_for_sandbox(&self, mut sandbox: Sandbox) -> Result<String> {
        while sandbox.state != "started" {
            if matches!(sandbox.state.as_str(), "error" | "build_failed" | "destroyed") {
                return Err(RemoteError::transport(format!(
                    "sandbox {} entered state '{}'",
                    sandbox.id, sandbox.state
                )));
            }
            debug!("Daytona sandbox {} is {}", sandbox.id, sandbox.state);
            tokio::time::sleep(Duration::from_millis(500)).await;

            let response = self
                .send(self.request(Method::GET, &format!("/sandbox/{}", sandbox.id))?)
                .await?;
            let response = ensure_success(SERVICE, "sandbox lookup", response).await?;
            sandbox = read_json(SERVICE, "sandbox lookup", response).await?;
        }
        Ok(sandbox.id)
    }
}

#[async_trait]
impl SandboxApi for DaytonaApi {
    fn service(&self) -> &'static str {
        SERVICE
    }

    /// A snapshot counts only once it is active. One that is still
    /// building is waited for; a failed one is a provisioning error.
    async fn environment_exists(&self, key: &EnvironmentKey) -> Result<bool> {
        let name = key.to_string();
        let Some(snapshot) = self.get_snapshot(&name).await? else {
            return Ok(false);
        };

        match snapshot.state.as_str() {
            "active" => Ok(true),
            "error" | "build_failed" => Err(RemoteError::provisioning(
                name,
                format!(
                    "snapshot is in state '{}': {}",
                    snapshot.state,
                    snapshot.error_reason.as_deref().unwrap_or("no reason given")
                ),
            )),
            state => {
                info!("Snapshot '{}' is {}; waiting for it to become active", name, state);
                self.wait_until_active(&name).await?;
                Ok(true)
            }
        }
    }

    async fn build_environment(
        &self,
        key: &EnvironmentKey,
        context: &BuildContext,
        resources: &Resources,
    ) -> Result<String> {
        let name = key.to_string();
        let hash = self.upload_context(context).await?;

        let body = SnapshotRequest {
            name: &name,
            build_info: BuildInfo {
                dockerfile_content: context.dockerfile_contents()?,
                context_hashes: vec![hash],
            },
            cpu: resources.cpu,
            memory: resources.memory_mb.div_ceil(1024),
            disk: resources.disk_gb.unwrap_or(3),
        };
        let response = self
            .send(self.request(Method::POST, "/snapshots")?.json(&body))
            .await?;
        ensure_success(SERVICE, "snapshot creation", response).await?;

        let snapshot = self.wait_until_active(&name).await?;
        Ok(snapshot.id)
    }

    async fn create_sandbox(&self, handle: &EnvironmentHandle, lifetime: Duration) -> Result<String> {
        let name = handle.key().to_string();
        let body = SandboxRequest {
            snapshot: &name,
            auto_delete_interval: whole_secs(lifetime).div_ceil(60),
        };
        let response = self
            .send(self.request(Method::POST, "/sandbox")?.json(&body))
            .await?;
        let response = ensure_success(SERVICE, "sandbox creation", response).await?;
        let sandbox: Sandbox = read_json(SERVICE, "sandbox creation", response).await?;
        self.wait_for_sandbox(sandbox).await
    }

    async fn run_command(&self, sandbox_id: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let body = ExecuteRequest {
            command,
            timeout: whole_secs(timeout),
        };
        let path = format!("/toolbox/{sandbox_id}/toolbox/process/execute");
        let response = self.send(self.request(Method::POST, &path)?.json(&body)).await?;
        let response = ensure_success(SERVICE, "command", response).await?;
        let output: ExecuteResponse = read_json(SERVICE, "command", response).await?;

        // Daytona reports stdout and stderr as one stream.
        Ok(CommandOutput {
            exit_code: output.exit_code,
            stdout: output.result,
            stderr: String::new(),
        })
    }

    async fn kill_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .send(
                self.request(Method::DELETE, &format!("/sandbox/{sandbox_id}"))?
                    .query(&[("force", "true")]),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(SERVICE, "sandbox deletion", response).await?;
        Ok(())
    }
}
