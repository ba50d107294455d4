// tests/rollback.rs
mod common;

use common::Harness;
use deployflow::error::PipelineError;
use deployflow::jobs::{JobQueue, Settlement};
use deployflow::pipelines::rollback::request_rollback;
use deployflow::store::{Deployment, DeploymentStatus, ServiceStatus, Store, TriggeredBy};
use uuid::Uuid;

async fn succeeded_with(h: &Harness, service_id: Uuid, image: &str) -> Deployment {
    let d = h.deployment(service_id, "c0ffee1").await;
    for status in [
        DeploymentStatus::Building,
        DeploymentStatus::Pushing,
        DeploymentStatus::Success,
    ] {
        h.store.transition_deployment(d.id, status).await.unwrap();
    }
    h.store.record_build(d.id, image, 1200).await.unwrap();
    h.get_deployment(d.id).await
}

#[tokio::test]
async fn rollback_creates_a_new_deployment_that_succeeds() {
    let h = Harness::new();
    let svc = h.service("api").await;
    let target = succeeded_with(&h, svc.id, "v1").await;
    h.store.set_service_image(svc.id, "v2").await.unwrap();

    let req = request_rollback(&*h.store, &*h.store, target.id)
        .await
        .unwrap();
    assert_ne!(req.deployment_id, target.id);

    let created = h.get_deployment(req.deployment_id).await;
    assert_eq!(created.triggered_by, TriggeredBy::Rollback);
    assert_eq!(created.rollback_of, Some(target.id));
    assert_eq!(created.commit_sha, target.commit_sha);
    assert_eq!(created.image_tag.as_deref(), Some("v1"));
    assert_eq!(created.status, DeploymentStatus::Queued);

    let job = h.store.get_job(req.job_id).await.unwrap().unwrap();
    assert_eq!(job.job_type, "rollback");

    assert_eq!(
        h.pool(1).work_one("w").await.unwrap(),
        Some(Settlement::Completed)
    );

    let done = h.get_deployment(req.deployment_id).await;
    assert_eq!(done.status, DeploymentStatus::Success);
    assert!(done.finished_at.is_some());

    let svc = h.get_service(svc.id).await;
    assert_eq!(svc.current_image_tag.as_deref(), Some("v1"));
    assert_eq!(svc.status, ServiceStatus::Running);
    assert_eq!(
        h.orchestrator.workload("proj-api", "api").unwrap().image,
        "v1"
    );

    // The original row is untouched.
    let target_after = h.get_deployment(target.id).await;
    assert_eq!(target_after.status, DeploymentStatus::Success);
    assert_eq!(target_after.image_tag.as_deref(), Some("v1"));
}

#[tokio::test]
async fn failed_target_is_rejected_before_anything_happens() {
    let h = Harness::new();
    let svc = h.service("api").await;
    let target = h.deployment(svc.id, "c0ffee1").await;
    h.store.fail_deployment(target.id, "build broke").await.unwrap();

    let err = request_rollback(&*h.store, &*h.store, target.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    assert_eq!(h.store.counts().await.unwrap().pending, 0);
    assert!(h.orchestrator.cluster.lock().unwrap().workloads.is_empty());
}

#[tokio::test]
async fn target_without_image_is_rejected() {
    let h = Harness::new();
    let svc = h.service("api").await;
    let target = h.deployment(svc.id, "c0ffee1").await;
    for status in [
        DeploymentStatus::Building,
        DeploymentStatus::Pushing,
        DeploymentStatus::Success,
    ] {
        h.store.transition_deployment(target.id, status).await.unwrap();
    }

    let err = request_rollback(&*h.store, &*h.store, target.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(m) if m.contains("no image")));
}

#[tokio::test]
async fn unknown_target_is_rejected() {
    let h = Harness::new();
    let err = request_rollback(&*h.store, &*h.store, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
}
