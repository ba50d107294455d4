//! Cascading teardown of services and projects.
//!
//! Every step is attempted even when earlier ones fail; failures are logged
//! and counted in the returned [`CleanupReport`]. Rows are never deleted,
//! only their provider ids cleared and their status updated.

use crate::error::PipelineError;
use crate::pipelines::provision::{owner_instance, retire_storage_row};
use crate::pipelines::PipelineContext;
use crate::store::{Database, ResourceStatus, Service, ServiceStatus, Volume, VolumeOwner};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Display;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub attempted: usize,
    pub failed: usize,
    /// `"<step>: <error>"` for every failed step.
    pub failures: Vec<String>,
}

impl CleanupReport {
    fn record<E: Display>(&mut self, step: &str, result: Result<(), E>) -> bool {
        self.attempted += 1;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(step, error = %e, "cleanup step failed, continuing");
                self.failed += 1;
                self.failures.push(format!("{step}: {e}"));
                false
            }
        }
    }

    fn merge(&mut self, other: CleanupReport) {
        self.attempted += other.attempted;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[instrument(skip_all, fields(%service_id))]
pub async fn cleanup_service(
    ctx: &PipelineContext,
    service_id: Uuid,
) -> Result<CleanupReport, PipelineError> {
    let Some(service) = ctx.store.get_service(service_id).await? else {
        warn!("service not found, nothing to clean up");
        return Ok(CleanupReport::default());
    };
    let report = teardown_service(ctx, &service).await;
    info!(attempted = report.attempted, failed = report.failed, "service cleaned up");
    Ok(report)
}

#[instrument(skip_all, fields(%project_id))]
pub async fn cleanup_project(
    ctx: &PipelineContext,
    project_id: Uuid,
) -> Result<CleanupReport, PipelineError> {
    let mut report = CleanupReport::default();

    let services = ctx.store.list_services(project_id).await?;
    let namespaces: BTreeSet<String> = services.iter().map(|s| s.namespace.clone()).collect();
    for service in &services {
        report.merge(teardown_service(ctx, service).await);
    }

    for db in ctx.store.list_databases(project_id).await? {
        if db.status != ResourceStatus::Deleted {
            report.merge(teardown_database(ctx, &db).await);
        }
    }

    for volume in ctx.store.list_volumes(project_id).await? {
        if volume.status != ResourceStatus::Deleted {
            teardown_volume(ctx, &volume, &mut report).await;
        }
    }

    // Last: deleting the namespace takes anything left in it along.
    for ns in &namespaces {
        report.record("delete_namespace", ctx.orchestrator.delete_namespace(ns).await);
    }

    info!(
        services = services.len(),
        attempted = report.attempted,
        failed = report.failed,
        "project cleaned up"
    );
    Ok(report)
}

async fn teardown_service(ctx: &PipelineContext, service: &Service) -> CleanupReport {
    let mut report = CleanupReport::default();
    let infra = &ctx.infra;
    let orch = &ctx.orchestrator;
    let ns = service.namespace.as_str();
    let name = service.name.as_str();

    report.record(
        "remove_telemetry_target",
        ctx.store.remove_telemetry_targets(service.id).await.map(|_| ()),
    );

    // ----------------------------
    // Provider resources
    // ----------------------------
    let mut infra_released = true;
    if let Some(instance_id) = &service.compute_instance_id {
        report.record("stop_instance", infra.stop_instance(instance_id).await);
        infra_released &= report.record("delete_instance", infra.delete_instance(instance_id).await);
    }
    if let Some(policy_id) = &service.security_policy_id {
        infra_released &= report.record(
            "delete_security_policy",
            infra.delete_security_policy(policy_id).await,
        );
    }
    if let Some(record_id) = &service.dns_record_id {
        infra_released &= report.record(
            "delete_dns_record",
            infra
                .delete_dns_record(&ctx.settings.base_domain, record_id)
                .await,
        );
    }

    // ----------------------------
    // Webhook
    // ----------------------------
    match ctx.store.get_git_source(service.id).await {
        Ok(Some(source)) => {
            if let Some(webhook_id) = &source.webhook_id {
                let result = match ctx.store.get_git_connection(source.connection_id).await {
                    Ok(Some(conn)) => ctx
                        .source
                        .delete_webhook(&conn.access_token, &source.repo_url, webhook_id)
                        .await
                        .map_err(|e| e.to_string()),
                    Ok(None) => Err(format!("git connection {} not found", source.connection_id)),
                    Err(e) => Err(e.to_string()),
                };
                report.record("delete_webhook", result);
            }
        }
        Ok(None) => {}
        Err(e) => {
            report.record("load_git_source", Err(e));
        }
    }

    // ----------------------------
    // Orchestrator objects
    // ----------------------------
    report.record("delete_ingress", orch.delete_ingress(ns, name).await);
    report.record("delete_network_service", orch.delete_service(ns, name).await);
    report.record("delete_workload", orch.delete_workload(ns, name).await);
    report.record(
        "delete_secret",
        orch.delete_secret(ns, &crate::pipelines::deploy::env_secret_name(name))
            .await,
    );

    // ----------------------------
    // Volumes
    // ----------------------------
    match ctx
        .store
        .list_attached_volumes(VolumeOwner::Service(service.id))
        .await
    {
        Ok(volumes) => {
            for volume in volumes {
                teardown_volume(ctx, &volume, &mut report).await;
            }
        }
        Err(e) => {
            report.record("list_volumes", Err(e));
        }
    }

    if infra_released {
        report.record("clear_service_infra", ctx.store.clear_service_infra(service.id).await);
    }
    report.record(
        "mark_service_stopped",
        ctx.store
            .set_service_status(service.id, ServiceStatus::Stopped)
            .await,
    );

    report
}

async fn teardown_database(ctx: &PipelineContext, db: &Database) -> CleanupReport {
    let mut report = CleanupReport::default();
    let infra = &ctx.infra;
    let mut released = true;

    report.record(
        "remove_telemetry_target",
        ctx.store.remove_telemetry_targets(db.id).await.map(|_| ()),
    );

    if let (Some(storage_id), Some(instance_id)) = (&db.storage_volume_id, &db.instance_id) {
        report.record(
            "detach_storage",
            infra.detach_volume(storage_id, instance_id, &db.region).await,
        );
    }
    if let Some(instance_id) = &db.instance_id {
        report.record("stop_instance", infra.stop_instance(instance_id).await);
        released &= report.record("delete_instance", infra.delete_instance(instance_id).await);
    }
    let mut storage_released = true;
    if let Some(storage_id) = &db.storage_volume_id {
        storage_released = report.record("delete_storage", infra.delete_volume(storage_id).await);
        released &= storage_released;
    }
    if let Some(policy_id) = &db.security_policy_id {
        released &= report.record(
            "delete_security_policy",
            infra.delete_security_policy(policy_id).await,
        );
    }
    if let Some(record_id) = &db.dns_record_id {
        released &= report.record(
            "delete_dns_record",
            infra
                .delete_dns_record(&ctx.settings.internal_domain, record_id)
                .await,
        );
    }

    // Volumes of ours attached to the database.
    match ctx
        .store
        .list_attached_volumes(VolumeOwner::Database(db.id))
        .await
    {
        Ok(volumes) => {
            for volume in volumes {
                report.record("unlink_volume", ctx.store.detach_volume(volume.id).await);
            }
        }
        Err(e) => {
            report.record("list_volumes", Err(e));
        }
    }
    // A storage row whose volume survived stays behind for the project's
    // volume sweep to retry.
    if let Some(volume_id) = db.volume_id.filter(|_| storage_released) {
        report.record("retire_storage_row", retire_storage_row(ctx, volume_id).await);
    }

    if released {
        report.record("clear_database_infra", ctx.store.clear_database_infra(db.id).await);
        report.record(
            "mark_database_deleted",
            ctx.store
                .set_database_status(db.id, ResourceStatus::Deleted, None)
                .await,
        );
    }

    report
}

/// Detaches and deletes one volume. Each step is recorded on its own, so a
/// failed detach does not keep the provider volume alive.
async fn teardown_volume(ctx: &PipelineContext, volume: &Volume, report: &mut CleanupReport) {
    let instance_id = match owner_instance(ctx, volume).await {
        Ok(instance_id) => instance_id,
        Err(e) => {
            report.record("load_volume_owner", Err(e));
            None
        }
    };
    if let (Some(provider_id), Some(instance_id)) = (&volume.provider_volume_id, &instance_id) {
        report.record(
            "detach_volume",
            ctx.infra
                .detach_volume(provider_id, instance_id, &volume.region)
                .await,
        );
    }
    if volume.owner().is_some() {
        report.record("unlink_volume", ctx.store.detach_volume(volume.id).await);
    }

    let deleted = match &volume.provider_volume_id {
        Some(provider_id) => {
            report.record("delete_volume", ctx.infra.delete_volume(provider_id).await)
                && report.record(
                    "clear_volume_provider_id",
                    ctx.store.clear_volume_provider_id(volume.id).await,
                )
        }
        None => true,
    };
    if deleted {
        report.record(
            "mark_volume_deleted",
            ctx.store
                .set_volume_status(volume.id, ResourceStatus::Deleted, None)
                .await,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_failures_and_keeps_going() {
        let mut report = CleanupReport::default();
        assert!(report.record::<String>("a", Ok(())));
        assert!(!report.record("b", Err("boom")));
        assert!(report.record::<String>("c", Ok(())));

        assert_eq!(report.attempted, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures, vec!["b: boom".to_string()]);
        assert!(!report.is_clean());
    }
}
