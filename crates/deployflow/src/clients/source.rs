use crate::clients::{check_response, http_client, run_command, ClientError};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// What to check out.
#[derive(Clone)]
pub struct CloneRequest {
    pub repo_url: String,
    pub branch: String,
    /// `None` means the branch head.
    pub commit_sha: Option<String>,
    pub access_token: String,
}

impl std::fmt::Debug for CloneRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloneRequest")
            .field("repo_url", &self.repo_url)
            .field("branch", &self.branch)
            .field("commit_sha", &self.commit_sha)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Checks out `req` into `dest` (which must be empty) and returns the
    /// resolved commit sha.
    async fn clone_repo(&self, req: &CloneRequest, dest: &Path) -> Result<String, ClientError>;

    /// Removes an inbound push webhook. Already-deleted hooks are not an error.
    async fn delete_webhook(
        &self,
        access_token: &str,
        repo_url: &str,
        webhook_id: &str,
    ) -> Result<(), ClientError>;
}

/// `git` on the PATH for checkouts, the GitHub REST API for webhooks.
pub struct GitCli {
    git_bin: String,
    api_base: String,
    http: reqwest::Client,
}

impl GitCli {
    pub fn new(api_base: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            git_bin: "git".to_string(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: http_client(Duration::from_secs(30))?,
        })
    }

    pub fn with_git_bin(mut self, git_bin: impl Into<String>) -> Self {
        self.git_bin = git_bin.into();
        self
    }

    fn git(&self, cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.git_bin);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Embeds the token for https remotes; other schemes are left alone.
pub(crate) fn authenticated_url(repo_url: &str, token: &str) -> String {
    match repo_url.strip_prefix("https://") {
        Some(rest) if !token.is_empty() => format!("https://x-access-token:{token}@{rest}"),
        _ => repo_url.to_string(),
    }
}

/// `https://github.com/acme/api.git` → `("acme", "api")`.
pub(crate) fn owner_and_repo(repo_url: &str) -> Option<(String, String)> {
    let trimmed = repo_url.trim_end_matches('/').trim_end_matches(".git");
    let path = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    // scp-like `git@github.com:acme/api`
    let path = path.split_once(':').map(|(_, p)| p).unwrap_or(path);

    let mut parts = path.rsplit('/');
    let repo = parts.next()?.to_string();
    let owner = parts.next()?.to_string();
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

#[async_trait]
impl SourceControl for GitCli {
    async fn clone_repo(&self, req: &CloneRequest, dest: &Path) -> Result<String, ClientError> {
        let url = authenticated_url(&req.repo_url, &req.access_token);
        let dest_str = dest.to_string_lossy().to_string();

        match req.commit_sha.as_deref() {
            None => {
                run_command(
                    &format!("git clone --depth 1 --branch {} {}", req.branch, req.repo_url),
                    self.git(None).args([
                        "clone",
                        "--depth",
                        "1",
                        "--branch",
                        &req.branch,
                        "--single-branch",
                        &url,
                        &dest_str,
                    ]),
                )
                .await?;
            }
            Some(sha) => {
                run_command(
                    &format!("git clone --branch {} {}", req.branch, req.repo_url),
                    self.git(None)
                        .args(["clone", "--branch", &req.branch, &url, &dest_str]),
                )
                .await?;
                run_command(
                    &format!("git checkout {sha}"),
                    self.git(Some(dest)).args(["checkout", "--detach", sha]),
                )
                .await?;
            }
        }

        let resolved = run_command("git rev-parse HEAD", self.git(Some(dest)).args(["rev-parse", "HEAD"]))
            .await?;
        debug!(repo = %req.repo_url, sha = %resolved, "checked out");
        Ok(resolved)
    }

    async fn delete_webhook(
        &self,
        access_token: &str,
        repo_url: &str,
        webhook_id: &str,
    ) -> Result<(), ClientError> {
        let (owner, repo) = owner_and_repo(repo_url)
            .ok_or_else(|| ClientError::Invalid(format!("cannot parse repo url {repo_url}")))?;

        let resp = self
            .http
            .delete(format!(
                "{}/repos/{owner}/{repo}/hooks/{webhook_id}",
                self.api_base
            ))
            .bearer_auth(access_token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(%owner, %repo, webhook_id, "webhook already gone");
            return Ok(());
        }
        check_response("source", resp).await?;
        info!(%owner, %repo, webhook_id, "webhook deleted");
        Ok(())
    }
}
