use crate::error::PipelineError;
use crate::events::{DeploymentLogger, LogPhase};
use crate::jobs::{JobPayload, JobQueue};
use crate::pipelines::deploy::{rollout, wait_for_rollout};
use crate::pipelines::{
    ensure_active, mark_service_failed, record_failure, Attempt, PipelineContext,
};
use crate::store::{Deployment, DeploymentStatus, NewDeployment, ServiceStatus, Store, TriggeredBy};
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

/// What [`request_rollback`] created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RollbackRequest {
    pub deployment_id: Uuid,
    pub job_id: Uuid,
}

/// Only a successful deployment with a recorded image can be rolled back to.
fn validate_target(target: &Deployment) -> Result<String, PipelineError> {
    if target.status != DeploymentStatus::Success {
        return Err(PipelineError::Validation(format!(
            "deployment {} is {}, only successful deployments can be rolled back to",
            target.id, target.status
        )));
    }
    target
        .image_tag
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            PipelineError::Validation(format!("deployment {} has no image to roll back to", target.id))
        })
}

/// Validates `target_id`, creates the rollback deployment and enqueues its
/// job. Nothing outside the store is touched.
pub async fn request_rollback(
    store: &dyn Store,
    queue: &dyn JobQueue,
    target_id: Uuid,
) -> Result<RollbackRequest, PipelineError> {
    let target = store
        .get_deployment(target_id)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("deployment {target_id} not found")))?;
    let image_tag = validate_target(&target)?;

    let deployment = store
        .insert_deployment(NewDeployment {
            service_id: target.service_id,
            commit_sha: target.commit_sha.clone(),
            commit_message: target.commit_message.clone(),
            commit_author: target.commit_author.clone(),
            branch: target.branch.clone(),
            triggered_by: TriggeredBy::Rollback,
            image_tag: Some(image_tag.clone()),
            rollback_of: Some(target.id),
        })
        .await?;

    let job_id = queue
        .enqueue_payload(JobPayload::Rollback {
            deployment_id: deployment.id,
            target_image_tag: image_tag,
            rollback_to_deployment_id: target.id,
        })
        .await?;

    info!(%target_id, deployment_id = %deployment.id, %job_id, "rollback requested");
    Ok(RollbackRequest {
        deployment_id: deployment.id,
        job_id,
    })
}

/// Points the service's workload back at a previously successful image.
#[instrument(skip_all, fields(%deployment_id, %rollback_to_deployment_id))]
pub async fn run(
    ctx: &PipelineContext,
    deployment_id: Uuid,
    target_image_tag: &str,
    rollback_to_deployment_id: Uuid,
    attempt: Attempt,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let log = ctx.logger(deployment_id);
    let result = roll_back(
        ctx,
        &log,
        deployment_id,
        target_image_tag,
        rollback_to_deployment_id,
        cancel,
    )
    .await;
    if let Err(err) = &result {
        if record_failure(ctx, &log, deployment_id, LogPhase::Rollback, err, attempt).await {
            mark_service_failed(ctx, deployment_id).await;
        }
    }
    result
}

async fn roll_back(
    ctx: &PipelineContext,
    log: &DeploymentLogger,
    deployment_id: Uuid,
    target_image_tag: &str,
    rollback_to_deployment_id: Uuid,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let deployment = ensure_active(ctx, deployment_id, cancel).await?;
    if deployment.status == DeploymentStatus::Success {
        return Ok(());
    }

    // The target may have changed since the request was accepted.
    let target = ctx
        .store
        .get_deployment(rollback_to_deployment_id)
        .await?
        .ok_or_else(|| {
            PipelineError::Validation(format!(
                "rollback target {rollback_to_deployment_id} not found"
            ))
        })?;
    let image = validate_target(&target)?;
    if image != target_image_tag {
        return Err(PipelineError::Validation(format!(
            "rollback target image is {image}, job asked for {target_image_tag}"
        )));
    }
    if target.service_id != deployment.service_id {
        return Err(PipelineError::Validation(
            "rollback target belongs to another service".to_string(),
        ));
    }

    let service = ctx
        .store
        .get_service(deployment.service_id)
        .await?
        .ok_or_else(|| {
            PipelineError::Validation(format!("service {} not found", deployment.service_id))
        })?;

    ctx.store
        .transition_deployment(deployment_id, DeploymentStatus::Deploying)
        .await?;
    ctx.store
        .set_service_status(service.id, ServiceStatus::Deploying)
        .await?;
    log.info_with(
        LogPhase::Rollback,
        &format!("rolling back {} to {image}", service.name),
        json!({ "image": image, "rollback_of": rollback_to_deployment_id }),
    )
    .await;

    let started = Instant::now();
    rollout(ctx, log, LogPhase::Rollback, &service, &image).await?;
    wait_for_rollout(ctx, log, LogPhase::Rollback, &service, cancel).await?;
    let deploy_ms = started.elapsed().as_millis() as i64;

    ctx.store.set_service_image(service.id, &image).await?;
    ctx.store
        .set_service_status(service.id, ServiceStatus::Running)
        .await?;
    ctx.store
        .record_deploy_duration(deployment_id, deploy_ms)
        .await?;
    ctx.store
        .transition_deployment(deployment_id, DeploymentStatus::Success)
        .await?;

    log.info(LogPhase::Rollback, "rollback complete").await;
    Ok(())
}
