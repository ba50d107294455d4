use crate::clients::{IngressSpec, NetworkServiceSpec, SecretSpec, WorkloadSpec};
use crate::error::PipelineError;
use crate::events::{DeploymentLogger, LogPhase};
use crate::pipelines::{
    ensure_active, mark_service_failed, record_failure, Attempt, PipelineContext,
};
use crate::store::{DeploymentStatus, Service, ServiceStatus};
use serde_json::json;
use std::collections::BTreeMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Port the network service listens on in front of the workload.
const SERVICE_PORT: i32 = 80;

pub fn env_secret_name(service_name: &str) -> String {
    format!("{service_name}-env")
}

pub fn public_host(service_name: &str, base_domain: &str) -> String {
    format!("{service_name}.{base_domain}")
}

/// Rolls the service's current image out and waits until it is available.
#[instrument(skip_all, fields(%deployment_id))]
pub async fn run(
    ctx: &PipelineContext,
    deployment_id: Uuid,
    attempt: Attempt,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let log = ctx.logger(deployment_id);
    let result = deploy(ctx, &log, deployment_id, cancel).await;
    if let Err(err) = &result {
        if record_failure(ctx, &log, deployment_id, LogPhase::Deploy, err, attempt).await {
            mark_service_failed(ctx, deployment_id).await;
        }
    }
    result
}

async fn deploy(
    ctx: &PipelineContext,
    log: &DeploymentLogger,
    deployment_id: Uuid,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let deployment = ensure_active(ctx, deployment_id, cancel).await?;
    if deployment.status == DeploymentStatus::Success {
        debug!("deployment already succeeded");
        return Ok(());
    }

    let service = ctx
        .store
        .get_service(deployment.service_id)
        .await?
        .ok_or_else(|| {
            PipelineError::Validation(format!("service {} not found", deployment.service_id))
        })?;
    let image = service
        .current_image_tag
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            PipelineError::Validation(format!("service {} has no built image", service.name))
        })?;

    ctx.store
        .transition_deployment(deployment_id, DeploymentStatus::Deploying)
        .await?;
    ctx.store
        .set_service_status(service.id, ServiceStatus::Deploying)
        .await?;

    let started = Instant::now();
    rollout(ctx, log, LogPhase::Deploy, &service, &image).await?;
    wait_for_rollout(ctx, log, LogPhase::Deploy, &service, cancel).await?;

    let deploy_ms = started.elapsed().as_millis() as i64;
    let url = format!(
        "https://{}",
        public_host(&service.name, &ctx.settings.base_domain)
    );
    ctx.store.set_service_url(service.id, &url).await?;
    ctx.store
        .set_service_status(service.id, ServiceStatus::Running)
        .await?;
    ctx.store
        .record_deploy_duration(deployment_id, deploy_ms)
        .await?;
    ctx.store
        .transition_deployment(deployment_id, DeploymentStatus::Success)
        .await?;

    log.info_with(
        LogPhase::Deploy,
        &format!("live at {url}"),
        json!({ "url": url, "deploy_duration_ms": deploy_ms }),
    )
    .await;
    Ok(())
}

/// Idempotently applies namespace, env secret, workload, network service and
/// ingress for `service` running `image`.
pub(crate) async fn rollout(
    ctx: &PipelineContext,
    log: &DeploymentLogger,
    phase: LogPhase,
    service: &Service,
    image: &str,
) -> Result<(), PipelineError> {
    let orch = &ctx.orchestrator;
    let ns = service.namespace.as_str();

    orch.ensure_namespace(ns)
        .await
        .map_err(|e| PipelineError::client("ensure_namespace", e))?;

    let env = ctx.store.list_env_vars(service.id).await?;
    let env_secret = if env.is_empty() {
        None
    } else {
        let name = env_secret_name(&service.name);
        orch.upsert_secret(&SecretSpec {
            namespace: ns.to_string(),
            name: name.clone(),
            data: env.clone(),
        })
        .await
        .map_err(|e| PipelineError::client("upsert_secret", e))?;
        log.info_with(
            phase,
            &format!("{} environment variables applied", env.len()),
            json!({ "keys": env.keys().collect::<Vec<_>>() }),
        )
        .await;
        Some(name)
    };

    let mut labels = BTreeMap::new();
    labels.insert("deployflow/service-id".to_string(), service.id.to_string());

    let workload = WorkloadSpec {
        namespace: ns.to_string(),
        name: service.name.clone(),
        image: image.to_string(),
        replicas: service.replicas.max(1),
        port: service.port,
        env_secret,
        labels,
    };

    let existing = orch
        .get_workload(ns, &service.name)
        .await
        .map_err(|e| PipelineError::client("get_workload", e))?;
    if existing.is_some() {
        orch.update_workload(&workload)
            .await
            .map_err(|e| PipelineError::client("update_workload", e))?;
        log.info(phase, &format!("workload updated to {image}")).await;
    } else {
        orch.create_workload(&workload)
            .await
            .map_err(|e| PipelineError::client("create_workload", e))?;
        log.info(phase, &format!("workload created with {image}")).await;
    }

    orch.upsert_service(&NetworkServiceSpec {
        namespace: ns.to_string(),
        name: service.name.clone(),
        port: SERVICE_PORT,
        target_port: service.port,
    })
    .await
    .map_err(|e| PipelineError::client("upsert_service", e))?;

    let mut hosts = vec![public_host(&service.name, &ctx.settings.base_domain)];
    hosts.extend(ctx.store.list_active_domains(service.id).await?);

    let ingress = IngressSpec {
        namespace: ns.to_string(),
        name: service.name.clone(),
        hosts: hosts.clone(),
        service_name: service.name.clone(),
        service_port: SERVICE_PORT,
    };
    match orch.upsert_ingress(&ingress).await {
        Ok(()) => {
            log.info_with(phase, "ingress applied", json!({ "hosts": hosts }))
                .await
        }
        Err(e) => {
            log.warn(phase, &format!("ingress not applied, continuing: {e}"))
                .await
        }
    }

    Ok(())
}

/// Polls the workload until `available >= desired`, the deploy timeout
/// passes, or the job is cancelled.
pub(crate) async fn wait_for_rollout(
    ctx: &PipelineContext,
    log: &DeploymentLogger,
    phase: LogPhase,
    service: &Service,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let poll = ctx.settings.poll_interval;
    let timeout = ctx.settings.deploy_timeout;
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let status = ctx
            .orchestrator
            .workload_status(&service.namespace, &service.name)
            .await
            .map_err(|e| PipelineError::client("workload_status", e))?;

        log.info_with(
            phase,
            &format!("{}/{} replicas ready", status.ready, status.desired),
            json!({
                "ready": status.ready,
                "available": status.available,
                "desired": status.desired
            }),
        )
        .await;

        if status.is_available() {
            return Ok(());
        }
        if Instant::now() + poll > deadline {
            return Err(PipelineError::Failed(format!(
                "rollout not available after {}s ({}/{} ready)",
                timeout.as_secs(),
                status.available,
                status.desired
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
