//! Job handlers.
//!
//! [`dispatch`] maps a decoded [`JobPayload`] to its pipeline. Pipelines are
//! plain async functions over a shared [`PipelineContext`]; they report
//! through [`PipelineError`] and never touch the job row themselves.

pub mod build;
pub mod cleanup;
pub mod compensation;
pub mod deploy;
pub mod provision;
pub mod rollback;

use crate::clients::{ImageBuilder, InfraApi, Orchestrator, Registry, SourceControl};
use crate::error::PipelineError;
use crate::events::{DeploymentLogger, LiveChannel, LogPhase};
use crate::jobs::{model::Job, retry::ErrorClass, JobPayload, JobQueue};
use crate::store::{Deployment, DeploymentStatus, ServiceStatus, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Deployment-wide knobs for the pipelines.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Registry prefix for built images, e.g. `registry.example.com/acme`.
    pub registry: String,
    /// Public apps are served at `https://{service}.{base_domain}`.
    pub base_domain: String,
    /// DNS zone for database hostnames.
    pub internal_domain: String,
    pub poll_interval: Duration,
    pub deploy_timeout: Duration,
    pub instance_timeout: Duration,
    pub instance_size: String,
    pub instance_image: String,
    /// Only this range may reach provisioned databases.
    pub private_cidr: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            registry: "registry.localhost".to_string(),
            base_domain: "apps.localhost".to_string(),
            internal_domain: "internal.localhost".to_string(),
            poll_interval: Duration::from_secs(5),
            deploy_timeout: Duration::from_secs(5 * 60),
            instance_timeout: Duration::from_secs(10 * 60),
            instance_size: "s-1vcpu-2gb".to_string(),
            instance_image: "ubuntu-22-04-x64".to_string(),
            private_cidr: "10.0.0.0/8".to_string(),
        }
    }
}

/// Everything a pipeline may talk to.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn JobQueue>,
    pub source: Arc<dyn SourceControl>,
    pub builder: Arc<dyn ImageBuilder>,
    pub registry: Arc<dyn Registry>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub infra: Arc<dyn InfraApi>,
    pub live: Arc<dyn LiveChannel>,
    pub settings: PipelineSettings,
}

impl PipelineContext {
    pub fn logger(&self, deployment_id: Uuid) -> DeploymentLogger {
        DeploymentLogger::new(self.store.clone(), self.live.clone(), deployment_id)
    }
}

/// Which run of its job a pipeline is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based.
    pub number: i32,
    pub max: i32,
}

impl Attempt {
    pub fn of(job: &Job) -> Self {
        Self {
            number: job.attempts + 1,
            max: job.max_attempts,
        }
    }

    /// A single-shot attempt, for direct calls outside the queue.
    pub fn only() -> Self {
        Self { number: 1, max: 1 }
    }

    pub fn is_final(&self) -> bool {
        self.number >= self.max
    }
}

pub async fn dispatch(
    ctx: &PipelineContext,
    payload: JobPayload,
    attempt: Attempt,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    match payload {
        JobPayload::Build { deployment_id } => {
            build::run(ctx, deployment_id, build::BuildMode::Standalone, attempt, cancel)
                .await
                .map(|_| ())
        }
        JobPayload::Deploy { deployment_id } => {
            deploy::run(ctx, deployment_id, attempt, cancel).await
        }
        JobPayload::BuildAndDeploy { deployment_id } => {
            build::run(ctx, deployment_id, build::BuildMode::Chained, attempt, cancel).await?;
            deploy::run(ctx, deployment_id, attempt, cancel).await
        }
        JobPayload::Rollback {
            deployment_id,
            target_image_tag,
            rollback_to_deployment_id,
        } => {
            rollback::run(
                ctx,
                deployment_id,
                &target_image_tag,
                rollback_to_deployment_id,
                attempt,
                cancel,
            )
            .await
        }
        JobPayload::CleanupService { service_id } => {
            let report = cleanup::cleanup_service(ctx, service_id).await?;
            info!(%service_id, attempted = report.attempted, failed = report.failed, "service cleanup finished");
            Ok(())
        }
        JobPayload::CleanupProject { project_id } => {
            let report = cleanup::cleanup_project(ctx, project_id).await?;
            info!(%project_id, attempted = report.attempted, failed = report.failed, "project cleanup finished");
            Ok(())
        }
        JobPayload::ProvisionDatabase { database_id } => {
            provision::provision_database(ctx, database_id, attempt).await
        }
        JobPayload::ProvisionVolume { volume_id } => {
            provision::provision_volume(ctx, volume_id, attempt).await
        }
        JobPayload::DeleteVolume { volume_id } => provision::delete_volume(ctx, volume_id).await,
    }
}

/// Loads the deployment and stops if it was cancelled, by the user (status)
/// or by the worker (token).
pub(crate) async fn ensure_active(
    ctx: &PipelineContext,
    deployment_id: Uuid,
    cancel: &CancellationToken,
) -> Result<Deployment, PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let deployment = ctx
        .store
        .get_deployment(deployment_id)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("deployment {deployment_id} not found")))?;
    if deployment.status == DeploymentStatus::Cancelled {
        return Err(PipelineError::Cancelled);
    }
    Ok(deployment)
}

/// True when this failure ends the deployment: the error cannot be retried,
/// or there are no attempts left.
pub(crate) fn is_terminal_failure(err: &PipelineError, attempt: Attempt) -> bool {
    match err.class() {
        ErrorClass::NonRetryable => true,
        ErrorClass::Retryable => attempt.is_final(),
        ErrorClass::Cancelled => false,
    }
}

/// Writes a failed attempt to the deployment. A terminal failure moves the
/// deployment to `failed`; an attempt that will be retried only records the
/// error and leaves the status alone so the retry resumes where it stopped.
/// Returns whether the deployment was failed.
pub(crate) async fn record_failure(
    ctx: &PipelineContext,
    log: &DeploymentLogger,
    deployment_id: Uuid,
    phase: LogPhase,
    err: &PipelineError,
    attempt: Attempt,
) -> bool {
    if matches!(err, PipelineError::Cancelled) {
        log.warn(phase, "deployment cancelled").await;
        return false;
    }

    let message = err.to_string();
    if is_terminal_failure(err, attempt) {
        log.error(phase, &message).await;
        if let Err(e) = ctx.store.fail_deployment(deployment_id, &message).await {
            warn!(%deployment_id, error = %e, "could not mark deployment failed");
        }
        true
    } else {
        log.warn(
            phase,
            &format!(
                "attempt {}/{} failed, will retry: {message}",
                attempt.number, attempt.max
            ),
        )
        .await;
        if let Err(e) = ctx
            .store
            .record_deployment_error(deployment_id, &message)
            .await
        {
            warn!(%deployment_id, error = %e, "could not record deployment error");
        }
        false
    }
}

pub(crate) async fn mark_service_failed(ctx: &PipelineContext, deployment_id: Uuid) {
    if let Ok(Some(d)) = ctx.store.get_deployment(deployment_id).await {
        if let Err(e) = ctx
            .store
            .set_service_status(d.service_id, ServiceStatus::Failed)
            .await
        {
            warn!(%deployment_id, error = %e, "could not mark service failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientError;

    #[test]
    fn final_attempt_makes_retryable_errors_terminal() {
        let err = PipelineError::client("build", ClientError::Transport("reset".into()));
        assert!(!is_terminal_failure(&err, Attempt { number: 1, max: 3 }));
        assert!(is_terminal_failure(&err, Attempt { number: 3, max: 3 }));
    }

    #[test]
    fn permanent_errors_are_terminal_on_first_attempt() {
        let err = PipelineError::Validation("no git source".into());
        assert!(is_terminal_failure(&err, Attempt { number: 1, max: 3 }));
        assert!(!is_terminal_failure(
            &PipelineError::Cancelled,
            Attempt::only()
        ));
    }
}
