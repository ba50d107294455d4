use crate::clients::{image_tag, BuildStrategy, CloneRequest};
use crate::error::PipelineError;
use crate::events::{DeploymentLogger, LogPhase};
use crate::pipelines::{
    ensure_active, mark_service_failed, record_failure, Attempt, PipelineContext,
};
use crate::store::{DeploymentStatus, ServiceStatus};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const DEFAULT_BUILD_FILE: &str = "Dockerfile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// The build is the whole job: the deployment ends in `success`.
    Standalone,
    /// A deploy follows on the same deployment, which is left in `pushing`.
    Chained,
}

/// Clones, builds and pushes the image for a deployment. Returns the image
/// tag.
#[instrument(skip_all, fields(%deployment_id, ?mode))]
pub async fn run(
    ctx: &PipelineContext,
    deployment_id: Uuid,
    mode: BuildMode,
    attempt: Attempt,
    cancel: &CancellationToken,
) -> Result<String, PipelineError> {
    let log = ctx.logger(deployment_id);
    match build(ctx, &log, deployment_id, mode, cancel).await {
        Ok(tag) => Ok(tag),
        Err(err) => {
            if record_failure(ctx, &log, deployment_id, LogPhase::Build, &err, attempt).await {
                mark_service_failed(ctx, deployment_id).await;
            }
            Err(err)
        }
    }
}

/// `commit_sha` as stored, or `None` when the branch head is wanted.
fn pinned_sha(commit_sha: &str) -> Option<String> {
    let sha = commit_sha.trim();
    if sha.is_empty() || sha.eq_ignore_ascii_case("HEAD") {
        None
    } else {
        Some(sha.to_string())
    }
}

/// `checkout/root_dir/build_context`, refusing paths that climb out of the
/// checkout.
fn context_dir(checkout: &Path, root_dir: Option<&str>, build_context: &str) -> Result<PathBuf, PipelineError> {
    let mut dir = checkout.to_path_buf();
    for part in [root_dir.unwrap_or("."), build_context] {
        for seg in part.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    return Err(PipelineError::Validation(format!(
                        "build path `{part}` leaves the repository"
                    )))
                }
                s => dir.push(s),
            }
        }
    }
    Ok(dir)
}

fn choose_strategy(context: &Path, dockerfile_path: Option<&str>) -> BuildStrategy {
    let path = dockerfile_path.unwrap_or(DEFAULT_BUILD_FILE);
    if context.join(path).is_file() {
        BuildStrategy::Dockerfile {
            path: path.to_string(),
        }
    } else {
        BuildStrategy::Auto
    }
}

async fn build(
    ctx: &PipelineContext,
    log: &DeploymentLogger,
    deployment_id: Uuid,
    mode: BuildMode,
    cancel: &CancellationToken,
) -> Result<String, PipelineError> {
    let deployment = ensure_active(ctx, deployment_id, cancel).await?;

    // A previous attempt already built and pushed this deployment.
    if let (DeploymentStatus::Pushing | DeploymentStatus::Deploying | DeploymentStatus::Success, Some(tag)) =
        (deployment.status, deployment.image_tag.clone())
    {
        info!(%tag, status = %deployment.status, "build already done, resuming");
        if mode == BuildMode::Standalone && deployment.status == DeploymentStatus::Pushing {
            ctx.store
                .transition_deployment(deployment_id, DeploymentStatus::Success)
                .await?;
        }
        return Ok(tag);
    }

    let service = ctx
        .store
        .get_service(deployment.service_id)
        .await?
        .ok_or_else(|| {
            PipelineError::Validation(format!("service {} not found", deployment.service_id))
        })?;
    let source = ctx
        .store
        .get_git_source(service.id)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("service {} has no git source", service.name)))?;
    let connection = ctx
        .store
        .get_git_connection(source.connection_id)
        .await?
        .ok_or_else(|| {
            PipelineError::Validation(format!("git connection {} not found", source.connection_id))
        })?;

    // ----------------------------
    // Clone
    // ----------------------------
    ctx.store
        .transition_deployment(deployment_id, DeploymentStatus::Building)
        .await?;
    ctx.store
        .set_service_status(service.id, ServiceStatus::Building)
        .await?;

    let started = Instant::now();
    let workspace = tempfile::Builder::new()
        .prefix("deployflow-build-")
        .tempdir()
        .map_err(|e| PipelineError::Failed(format!("cannot create build workspace: {e}")))?;
    let checkout = workspace.path().join("src");

    log.info_with(
        LogPhase::Clone,
        &format!("cloning {} ({})", source.repo_url, source.branch),
        json!({ "repo": source.repo_url, "branch": source.branch, "commit": deployment.commit_sha }),
    )
    .await;

    let request = CloneRequest {
        repo_url: source.repo_url.clone(),
        branch: source.branch.clone(),
        commit_sha: pinned_sha(&deployment.commit_sha),
        access_token: connection.access_token.clone(),
    };
    let resolved_sha = ctx
        .source
        .clone_repo(&request, &checkout)
        .await
        .map_err(|e| PipelineError::client("clone", e))?;
    log.info_with(
        LogPhase::Clone,
        "repository cloned",
        json!({ "commit": resolved_sha }),
    )
    .await;

    ensure_active(ctx, deployment_id, cancel).await?;

    // ----------------------------
    // Build
    // ----------------------------
    let context = context_dir(&checkout, source.root_dir.as_deref(), &service.build_context)?;
    let strategy = choose_strategy(&context, service.dockerfile_path.as_deref());
    let sha = pinned_sha(&deployment.commit_sha).unwrap_or(resolved_sha);
    let tag = image_tag(&ctx.settings.registry, &service.name, &sha);

    let strategy_name = match &strategy {
        BuildStrategy::Dockerfile { path } => format!("build file {path}"),
        BuildStrategy::Auto => "zero-config builder".to_string(),
    };
    log.info_with(
        LogPhase::Build,
        &format!("building {tag} with {strategy_name}"),
        json!({ "image": tag }),
    )
    .await;

    if let Err(e) = ctx.builder.build(&context, &strategy, &tag).await {
        let elapsed = started.elapsed().as_millis() as i64;
        if let Err(store_err) = ctx.store.record_build_duration(deployment_id, elapsed).await {
            warn!(error = %store_err, "could not record build duration");
        }
        return Err(PipelineError::client("build", e));
    }

    let build_ms = started.elapsed().as_millis() as i64;
    drop(workspace);

    ensure_active(ctx, deployment_id, cancel).await?;

    // ----------------------------
    // Push
    // ----------------------------
    ctx.store.record_build(deployment_id, &tag, build_ms).await?;
    ctx.store
        .transition_deployment(deployment_id, DeploymentStatus::Pushing)
        .await?;
    log.info_with(
        LogPhase::Push,
        &format!("image pushed in {build_ms}ms"),
        json!({ "image": tag, "build_duration_ms": build_ms }),
    )
    .await;

    if let Err(e) = ctx.registry.verify(&tag).await {
        log.warn(
            LogPhase::Push,
            &format!("could not verify {tag} in the registry: {e}"),
        )
        .await;
    }

    ctx.store.set_service_image(service.id, &tag).await?;

    if mode == BuildMode::Standalone {
        ctx.store
            .transition_deployment(deployment_id, DeploymentStatus::Success)
            .await?;
        // Nothing was rolled out; the service keeps serving what it served.
        ctx.store.set_service_status(service.id, service.status).await?;
        log.info(LogPhase::Build, "build finished").await;
    }

    Ok(tag)
}
