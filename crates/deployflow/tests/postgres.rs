// tests/postgres.rs
//
// Needs TEST_DATABASE_URL: cargo test --test postgres -- --ignored
mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::setup_db;
use deployflow::jobs::{FailOutcome, JobPayload, JobQueue, PgJobQueue};
use deployflow::store::{
    DeploymentStatus, NewDeployment, PgStore, ServiceStatus, Store, StoreError, TriggeredBy,
};
use serial_test::serial;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

async fn insert_service(pool: &PgPool, name: &str) -> Uuid {
    sqlx::query_scalar(
        r#"
        INSERT INTO services (project_id, name, namespace)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(format!("proj-{name}"))
    .fetch_one(pool)
    .await
    .expect("failed to insert service")
}

fn build_payload() -> JobPayload {
    JobPayload::Build {
        deployment_id: Uuid::new_v4(),
    }
}

#[tokio::test]
#[serial]
#[ignore = "needs TEST_DATABASE_URL"]
async fn two_workers_never_claim_the_same_job() {
    let pool = setup_db().await;
    let queue = PgJobQueue::new(pool.clone());
    queue.enqueue_payload(build_payload()).await.unwrap();

    let (a, b) = tokio::join!(
        queue.claim_next("worker-a", Duration::from_secs(30)),
        queue.claim_next("worker-b", Duration::from_secs(30)),
    );
    let got = [a.unwrap().is_some(), b.unwrap().is_some()];
    assert_eq!(got.iter().filter(|x| **x).count(), 1, "exactly one claim wins");
}

#[tokio::test]
#[serial]
#[ignore = "needs TEST_DATABASE_URL"]
async fn retry_bound_and_lease_guard() {
    let pool = setup_db().await;
    let queue = PgJobQueue::new(pool.clone());
    let id = queue.enqueue_payload(build_payload()).await.unwrap();

    for attempt in 1..=3 {
        let job = queue
            .claim_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("claimable");
        assert_eq!(job.id, id);

        assert!(matches!(
            queue.complete(id, "w2").await,
            Err(StoreError::LeaseLost { .. })
        ));

        let outcome = queue
            .fail_transient(id, "w1", "boom", Utc::now() - ChronoDuration::seconds(1))
            .await
            .unwrap();
        if attempt == 3 {
            assert_eq!(outcome, FailOutcome::Failed { attempts: 3 });
        }
    }

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, "failed");
    assert!(queue
        .claim_next("w1", Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[serial]
#[ignore = "needs TEST_DATABASE_URL"]
async fn settling_after_losing_the_lease_is_rejected() {
    let pool = setup_db().await;
    let queue = PgJobQueue::new(pool.clone());
    let id = queue.enqueue_payload(build_payload()).await.unwrap();

    queue
        .claim_next("slow", Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.reap_expired_leases().await.unwrap(), 1);
    queue
        .claim_next("fast", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        queue.complete(id, "slow").await,
        Err(StoreError::LeaseLost { job_id }) if job_id == id
    ));
    assert!(matches!(
        queue.fail_permanent(id, "slow", "late").await,
        Err(StoreError::LeaseLost { .. })
    ));

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, "processing");
    assert_eq!(job.locked_by.as_deref(), Some("fast"));
    assert_eq!(job.attempts, 0);

    queue.complete(id, "fast").await.unwrap();
    assert!(matches!(
        queue.complete(id, "fast").await,
        Err(StoreError::LeaseLost { .. })
    ));
}

#[tokio::test]
#[serial]
#[ignore = "needs TEST_DATABASE_URL"]
async fn expired_leases_are_reaped() {
    let pool = setup_db().await;
    let queue = PgJobQueue::new(pool.clone());
    let id = queue.enqueue_payload(build_payload()).await.unwrap();

    queue
        .claim_next("dead", Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(queue.reap_expired_leases().await.unwrap(), 1);
    let job = queue
        .claim_next("alive", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.locked_by.as_deref(), Some("alive"));
}

#[tokio::test]
#[serial]
#[ignore = "needs TEST_DATABASE_URL"]
async fn deployment_status_never_moves_backwards() {
    let pool = setup_db().await;
    let store = PgStore::new(pool.clone());
    let service_id = insert_service(&pool, "api").await;

    let d = store
        .insert_deployment(NewDeployment {
            service_id,
            commit_sha: "abc1234".into(),
            commit_message: None,
            commit_author: None,
            branch: Some("main".into()),
            triggered_by: TriggeredBy::Webhook,
            image_tag: None,
            rollback_of: None,
        })
        .await
        .unwrap();
    assert_eq!(d.status, DeploymentStatus::Queued);

    store
        .transition_deployment(d.id, DeploymentStatus::Building)
        .await
        .unwrap();
    // Re-entering the current status is a no-op.
    store
        .transition_deployment(d.id, DeploymentStatus::Building)
        .await
        .unwrap();
    store
        .transition_deployment(d.id, DeploymentStatus::Pushing)
        .await
        .unwrap();

    let err = store
        .transition_deployment(d.id, DeploymentStatus::Building)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    store.fail_deployment(d.id, "registry down").await.unwrap();
    // Terminal rows are left alone.
    store.fail_deployment(d.id, "second writer").await.unwrap();

    let d = store.get_deployment(d.id).await.unwrap().unwrap();
    assert_eq!(d.status, DeploymentStatus::Failed);
    assert_eq!(d.error_message.as_deref(), Some("registry down"));
    assert!(d.started_at.is_some() && d.finished_at.is_some());

    store
        .set_service_status(service_id, ServiceStatus::Failed)
        .await
        .unwrap();
    let svc = store.get_service(service_id).await.unwrap().unwrap();
    assert_eq!(svc.status, ServiceStatus::Failed);
}
