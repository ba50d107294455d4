use crate::clients::{check_response, http_client, run_command, ClientError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

/// How an image is produced from a build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStrategy {
    /// An explicit build file, relative to the context root.
    Dockerfile { path: String },
    /// Zero-config detection of the language and start command.
    Auto,
}

/// Builds an image from `context` and pushes it as `tag`.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(
        &self,
        context: &Path,
        strategy: &BuildStrategy,
        tag: &str,
    ) -> Result<(), ClientError>;
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Confirms `tag` resolves to a manifest.
    async fn verify(&self, tag: &str) -> Result<(), ClientError>;
}

/// `{registry}/{service}:{service}-{sha}`
pub fn image_tag(registry: &str, service_name: &str, commit_sha: &str) -> String {
    let name = service_name.to_ascii_lowercase();
    let sha: String = commit_sha.chars().take(40).collect();
    format!("{}/{name}:{name}-{sha}", registry.trim_end_matches('/'))
}

/// Drives `docker` and `nixpacks` on the worker host.
pub struct CliImageBuilder {
    docker_bin: String,
    nixpacks_bin: String,
}

impl Default for CliImageBuilder {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            nixpacks_bin: "nixpacks".to_string(),
        }
    }
}

impl CliImageBuilder {
    pub fn new(docker_bin: impl Into<String>, nixpacks_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            nixpacks_bin: nixpacks_bin.into(),
        }
    }

    async fn push(&self, tag: &str) -> Result<(), ClientError> {
        run_command(
            &format!("docker push {tag}"),
            Command::new(&self.docker_bin).args(["push", tag]),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for CliImageBuilder {
    async fn build(
        &self,
        context: &Path,
        strategy: &BuildStrategy,
        tag: &str,
    ) -> Result<(), ClientError> {
        let ctx = context.to_string_lossy().to_string();

        match strategy {
            BuildStrategy::Dockerfile { path } => {
                let file: PathBuf = context.join(path);
                let file = file.to_string_lossy().to_string();
                run_command(
                    &format!("docker build -f {path} -t {tag}"),
                    Command::new(&self.docker_bin).args(["build", "-f", &file, "-t", tag, &ctx]),
                )
                .await?;
            }
            BuildStrategy::Auto => {
                run_command(
                    &format!("nixpacks build --name {tag}"),
                    Command::new(&self.nixpacks_bin).args(["build", &ctx, "--name", tag]),
                )
                .await?;
            }
        }

        self.push(tag).await?;
        info!(%tag, "image pushed");
        Ok(())
    }
}

/// Split `host[:port]/repo/path:tag` into its registry parts.
pub(crate) fn parse_reference(image: &str) -> Option<(String, String, String)> {
    let (host, rest) = image.split_once('/')?;
    let (repository, tag) = rest.rsplit_once(':')?;
    if host.is_empty() || repository.is_empty() || tag.is_empty() || tag.contains('/') {
        return None;
    }
    Some((host.to_string(), repository.to_string(), tag.to_string()))
}

/// Docker Registry HTTP API v2.
pub struct HttpRegistry {
    http: reqwest::Client,
    scheme: String,
    token: Option<String>,
}

impl HttpRegistry {
    pub fn new(token: Option<String>) -> Result<Self, ClientError> {
        Ok(Self {
            http: http_client(Duration::from_secs(15))?,
            scheme: "https".to_string(),
            token,
        })
    }

    /// Plain-http registries (local development).
    pub fn insecure(mut self) -> Self {
        self.scheme = "http".to_string();
        self
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn verify(&self, tag: &str) -> Result<(), ClientError> {
        let (host, repository, reference) = parse_reference(tag)
            .ok_or_else(|| ClientError::Invalid(format!("not a registry reference: {tag}")))?;

        let mut req = self
            .http
            .head(format!(
                "{}://{host}/v2/{repository}/manifests/{reference}",
                self.scheme
            ))
            .header(
                "Accept",
                "application/vnd.oci.image.index.v1+json, \
                 application/vnd.docker.distribution.manifest.list.v2+json, \
                 application/vnd.docker.distribution.manifest.v2+json",
            );
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(tag.to_string()));
        }
        check_response("registry", resp).await?;
        Ok(())
    }
}
