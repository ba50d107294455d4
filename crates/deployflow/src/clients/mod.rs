//! Capability contracts for the external systems the pipelines drive, and thin
//! adapters for each.
//!
//! Pipelines only ever hold `Arc<dyn Trait>`; the worker binary wires the REST
//! and CLI adapters, tests wire fakes.

pub mod builder;
pub mod infra;
pub mod orchestrator;
pub mod source;

use std::time::Duration;
use thiserror::Error;

pub use builder::{image_tag, BuildStrategy, CliImageBuilder, HttpRegistry, ImageBuilder, Registry};
pub use infra::{
    CloudRest, InfraApi, InstanceRequest, InstanceState, RetryingInfra, SecurityPolicyRequest,
};
pub use orchestrator::{
    IngressSpec, KubeRest, NetworkServiceSpec, Orchestrator, SecretSpec, WorkloadSpec,
    WorkloadStatus,
};
pub use source::{CloneRequest, GitCli, SourceControl};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection refused, reset, DNS failure and friends.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// A local CLI (git, docker, nixpacks) exited unsuccessfully.
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ClientError {
    /// Worth retrying as-is: network trouble, throttling, server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Command { .. } | Self::NotFound(_) | Self::Invalid(_) => false,
        }
    }

    /// Retrying the job cannot help: the request itself is wrong or refused.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Invalid(_) => true,
            Self::Status { status, .. } => matches!(status, 400 | 401 | 403 | 422),
            _ => false,
        }
    }

    pub fn status(service: &'static str, status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            service,
            status,
            body: body.into(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Invalid(format!("undecodable response: {e}"))
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Shared HTTP client settings for the REST adapters.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("deployflow/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ClientError::Invalid(format!("http client: {e}")))
}

/// Turns a non-success response into `ClientError::Status`, keeping at most a
/// short prefix of the body.
pub(crate) async fn check_response(
    service: &'static str,
    resp: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let body: String = body.chars().take(512).collect();
    Err(ClientError::status(service, status.as_u16(), body))
}

/// Runs a CLI to completion and returns its trimmed stdout. `label` is what
/// ends up in errors and logs, so it must never contain credentials.
pub(crate) async fn run_command(
    label: &str,
    cmd: &mut tokio::process::Command,
) -> Result<String, ClientError> {
    tracing::debug!(command = label, "running");
    let output = cmd
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ClientError::Command {
            command: label.to_string(),
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ClientError::Command {
            command: label.to_string(),
            detail: format!("{}: {}", output.status, tail),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
