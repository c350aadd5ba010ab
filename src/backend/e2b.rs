//! E2B sandbox service client.
//!
//! Templates are addressed by alias (`{prefix}-v{version}`). A missing
//! template is built from the project's Dockerfile and build context; a
//! sandbox is then started from the alias for every call session.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

use super::cloud::{
    ensure_success, http_error, read_json, whole_secs, CommandOutput, SandboxApi, BUILD_POLL_INTERVAL,
    BUILD_TIMEOUT,
};
use crate::config::{E2bConfig, Resources};
use crate::context::BuildContext;
use crate::error::{RemoteError, Result};
use crate::key::EnvironmentKey;
use crate::provision::EnvironmentHandle;

const SERVICE: &str = "E2B";

/// Start command run when a template sandbox boots.
const START_COMMAND: &str = "echo ready";

/// Client for the E2B REST API.
pub struct E2bApi {
    config: E2bConfig,
    client: Client,
    api_key: OnceLock<Result<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateRequest<'a> {
    alias: &'a str,
    dockerfile: String,
    start_cmd: &'a str,
    cpu_count: u32,
    #[serde(rename = "memoryMB")]
    memory_mb: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateBuild {
    #[serde(rename = "templateID")]
    template_id: String,
    #[serde(rename = "buildID")]
    build_id: String,
}

#[derive(Debug, Deserialize)]
struct BuildStatus {
    status: String,
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SandboxRequest<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct Sandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    cmd: &'a str,
    user: &'a str,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

impl E2bApi {
    /// Creates a client. The API key is resolved on first use.
    pub fn new(config: E2bConfig) -> Self {
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

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, self.url(path))
            .header("X-API-Key", self.api_key()?))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        request.send().await.map_err(|e| http_error(SERVICE, &e))
    }

    async fn wait_for_build(&self, build: &TemplateBuild) -> Result<()> {
        let path = format!("/templates/{}/builds/{}/status", build.template_id, build.build_id);
        let mut seen_logs = 0;

        loop {
            tokio::time::sleep(BUILD_POLL_INTERVAL).await;

            let response = self.send(self.request(reqwest::Method::GET, &path)?).await?;
            let response = ensure_success(SERVICE, "build status", response).await?;
            let status: BuildStatus = read_json(SERVICE, "build status", response).await?;

            for line in status.logs.iter().skip(seen_logs) {
                info!("[E2B template build] {}", line);
            }
            seen_logs = seen_logs.max(status.logs.len());

            match status.status.as_str() {
                "ready" => return Ok(()),
                "error" => {
                    return Err(RemoteError::transport(format!(
                        "template build failed: {}",
                        status.reason.as_deref().unwrap_or("no reason given")
                    )));
                }
                other => debug!("E2B build {} is {}", build.build_id, other),
            }
        }
    }
}

#[async_trait]
impl SandboxApi for E2bApi {
    fn service(&self) -> &'static str {
        SERVICE
    }

    async fn environment_exists(&self, key: &EnvironmentKey) -> Result<bool> {
        let path = format!("/templates/aliases/{key}");
        let response = self.send(self.request(reqwest::Method::GET, &path)?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(SERVICE, "template lookup", response).await?;
        Ok(true)
    }

    async fn build_environment(
        &self,
        key: &EnvironmentKey,
        context: &BuildContext,
        resources: &Resources,
    ) -> Result<String> {
        let alias = key.to_string();
        let body = TemplateRequest {
            alias: &alias,
            dockerfile: context.dockerfile_contents()?,
            start_cmd: START_COMMAND,
            cpu_count: resources.cpu,
            memory_mb: resources.memory_mb,
        };

        let response = self
            .send(self.request(reqwest::Method::POST, "/templates")?.json(&body))
            .await?;
        let response = ensure_success(SERVICE, "template creation", response).await?;
        let build: TemplateBuild = read_json(SERVICE, "template creation", response).await?;
        debug!("E2B template {} build {}", build.template_id, build.build_id);

        let archive = context.archive()?;
        let upload = format!("/templates/{}/builds/{}/context", build.template_id, build.build_id);
        let response = self
            .send(
                self.request(reqwest::Method::PUT, &upload)?
                    .header(reqwest::header::CONTENT_TYPE, "application/x-tar")
                    .body(archive),
            )
            .await?;
        ensure_success(SERVICE, "build context upload", response).await?;

        let start = format!("/templates/{}/builds/{}", build.template_id, build.build_id);
        let response = self.send(self.request(reqwest::Method::POST, &start)?).await?;
        ensure_success(SERVICE, "build start", response).await?;

        tokio::time::timeout(BUILD_TIMEOUT, self.wait_for_build(&build))
            .await
            .map_err(|_| {
                RemoteError::transport(format!(
                    "template build did not finish within {} minutes",
                    BUILD_TIMEOUT.as_secs() / 60
                ))
            })??;

        Ok(build.template_id)
    }

    async fn create_sandbox(&self, handle: &EnvironmentHandle, lifetime: Duration) -> Result<String> {
        let alias = handle.key().to_string();
        let body = SandboxRequest {
            template_id: &alias,
            timeout: whole_secs(lifetime),
        };
        let response = self
            .send(self.request(reqwest::Method::POST, "/sandboxes")?.json(&body))
            .await?;
        let response = ensure_success(SERVICE, "sandbox creation", response).await?;
        let sandbox: Sandbox = read_json(SERVICE, "sandbox creation", response).await?;
        Ok(sandbox.sandbox_id)
    }

    async fn run_command(&self, sandbox_id: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let body = CommandRequest {
            cmd: command,
            user: "root",
            timeout: whole_secs(timeout),
        };
        let path = format!("/sandboxes/{sandbox_id}/commands");
        let response = self
            .send(self.request(reqwest::Method::POST, &path)?.json(&body))
            .await?;
        let response = ensure_success(SERVICE, "command", response).await?;
        let output: CommandResponse = read_json(SERVICE, "command", response).await?;
        Ok(CommandOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn kill_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let path = format!("/sandboxes/{sandbox_id}");
        let response = self.send(self.request(reqwest::Method::DELETE, &path)?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(SERVICE, "sandbox deletion", response).await?;
        Ok(())
    }
}
