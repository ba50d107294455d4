// tests/provisioning.rs
mod common;

use common::Harness;
use deployflow::clients::InfraApi;
use deployflow::error::PipelineError;
use deployflow::jobs::{JobPayload, JobQueue, Settlement};
use deployflow::pipelines::provision::{delete_volume, provision_database, provision_volume};
use deployflow::pipelines::Attempt;
use deployflow::store::{
    Database, DatabaseEngine, DatabaseInfra, ResourceStatus, Store, StoreError, Volume,
    VolumeOwner,
};
use uuid::Uuid;

fn database(name: &str) -> Database {
    Database {
        id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        name: name.to_string(),
        engine: DatabaseEngine::Postgres,
        version: "16".into(),
        size_gb: 10,
        region: "fra1".into(),
        status: ResourceStatus::Pending,
        instance_id: None,
        security_policy_id: None,
        storage_volume_id: None,
        volume_id: None,
        hostname: None,
        dns_record_id: None,
        username: None,
        password: None,
        database_name: None,
        connection_string: None,
        error_message: None,
    }
}

fn volume(name: &str) -> Volume {
    Volume {
        id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        name: name.to_string(),
        size_gb: 5,
        region: "fra1".into(),
        status: ResourceStatus::Pending,
        provider_volume_id: None,
        service_id: None,
        database_id: None,
        mount_path: None,
        error_message: None,
    }
}

async fn load(h: &Harness, id: Uuid) -> Database {
    h.store.get_database(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn database_is_provisioned_end_to_end() {
    let h = Harness::new();
    let db = database("orders");
    h.store.insert_database(db.clone()).await;

    h.store
        .enqueue_payload(JobPayload::ProvisionDatabase {
            database_id: db.id,
        })
        .await
        .unwrap();
    assert_eq!(
        h.pool(1).work_one("w").await.unwrap(),
        Some(Settlement::Completed)
    );

    let db = load(&h, db.id).await;
    assert_eq!(db.status, ResourceStatus::Active);
    assert!(db.instance_id.is_some());
    assert!(db.security_policy_id.is_some());
    assert!(db.storage_volume_id.is_some());
    assert!(db.dns_record_id.is_some());

    let short = &db.id.simple().to_string()[..8];
    let host = format!("orders-{short}.db.test");
    assert_eq!(db.hostname.as_deref(), Some(host.as_str()));

    let user = db.username.clone().unwrap();
    let password = db.password.clone().unwrap();
    let name = db.database_name.clone().unwrap();
    assert!(user.starts_with("u_") && user.len() == 12);
    assert_eq!(password.len(), 32);
    assert!(name.starts_with("db_"));
    assert_eq!(
        db.connection_string.as_deref(),
        Some(format!("postgresql://{user}:{password}@{host}:5432/{name}").as_str())
    );

    assert_eq!(
        h.store.telemetry_targets(db.id).await,
        vec!["10.10.0.7:9100".to_string()]
    );

    let calls = h.infra.calls();
    let pos = |op: &str| calls.iter().position(|c| c.starts_with(op)).unwrap();
    assert!(pos("create_volume") < pos("create_security_policy"));
    assert!(pos("create_security_policy") < pos("create_instance"));
    assert!(pos("create_instance") < pos("attach_volume"));
    assert!(pos("attach_volume") < pos("create_dns_record"));
}

#[tokio::test]
async fn storage_row_is_attached_to_the_database() {
    let h = Harness::new();
    let db = database("orders");
    h.store.insert_database(db.clone()).await;

    provision_database(&h.ctx, db.id, Attempt::only()).await.unwrap();

    let db = load(&h, db.id).await;
    let row = h
        .store
        .get_volume(db.volume_id.expect("storage row linked"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ResourceStatus::Attached);
    assert_eq!(row.owner(), Some(VolumeOwner::Database(db.id)));
    assert_eq!(row.provider_volume_id, db.storage_volume_id);
    assert_eq!(row.mount_path.as_deref(), Some("/mnt/data"));
    assert_eq!(row.project_id, db.project_id);

    let err = h
        .store
        .attach_volume(row.id, VolumeOwner::Service(Uuid::new_v4()), "/data")
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyAttached(id) if id == row.id));
}

#[tokio::test]
async fn rerun_after_a_crash_reuses_attachment_and_dns_record() {
    let h = Harness::new();
    let db = database("orders");
    h.store.insert_database(db.clone()).await;

    provision_database(&h.ctx, db.id, Attempt { number: 1, max: 3 })
        .await
        .unwrap();
    let first = load(&h, db.id).await;

    // The worker died before settling: the row is still `provisioning` and
    // the job gets claimed again.
    h.store
        .set_database_status(db.id, ResourceStatus::Provisioning, None)
        .await
        .unwrap();
    provision_database(&h.ctx, db.id, Attempt { number: 2, max: 3 })
        .await
        .unwrap();

    let again = load(&h, db.id).await;
    assert_eq!(again.status, ResourceStatus::Active);
    assert_eq!(again.dns_record_id, first.dns_record_id);
    assert_eq!(again.hostname, first.hostname);
    assert_eq!(again.volume_id, first.volume_id);

    assert_eq!(h.infra.called("attach_volume"), 1);
    assert_eq!(h.infra.called("create_dns_record"), 1);
    let records: Vec<_> = h
        .infra
        .live()
        .into_iter()
        .filter(|id| id.starts_with("dns-"))
        .collect();
    assert_eq!(records.len(), 1, "no orphaned record: {records:?}");
}

#[tokio::test]
async fn stored_dns_record_is_reused_instead_of_recreated() {
    let h = Harness::new();
    let db = database("orders");
    h.store.insert_database(db.clone()).await;
    let record_id = h
        .infra
        .create_dns_record("db.test", "orders", "10.10.0.7")
        .await
        .unwrap();
    h.store
        .add_database_infra(
            db.id,
            &DatabaseInfra {
                dns_record_id: Some(record_id.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    provision_database(&h.ctx, db.id, Attempt::only()).await.unwrap();

    let db = load(&h, db.id).await;
    assert_eq!(db.dns_record_id.as_deref(), Some(record_id.as_str()));
    assert_eq!(h.infra.called("create_dns_record"), 1, "only the seeded record");
    let short = &db.id.simple().to_string()[..8];
    assert_eq!(
        db.hostname.as_deref(),
        Some(format!("orders-{short}.db.test").as_str())
    );
}

#[tokio::test]
async fn hard_failure_releases_everything_allocated() {
    let h = Harness::new();
    h.infra.fail("create_instance", 422);
    let db = database("orders");
    h.store.insert_database(db.clone()).await;

    let err = provision_database(&h.ctx, db.id, Attempt { number: 1, max: 3 })
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Client { step: "create_instance", .. }));

    assert_eq!(h.infra.called("delete_security_policy"), 1);
    assert_eq!(h.infra.called("delete_volume"), 1);
    assert!(h.infra.live().is_empty(), "nothing leaks: {:?}", h.infra.live());

    let calls = h.infra.calls();
    let policy_undo = calls.iter().position(|c| c.starts_with("delete_security_policy"));
    let storage_undo = calls.iter().position(|c| c.starts_with("delete_volume"));
    assert!(policy_undo < storage_undo, "undo runs in reverse");

    let db = load(&h, db.id).await;
    assert_eq!(db.status, ResourceStatus::Error);
    assert!(db.error_message.unwrap().contains("create_instance"));
    assert_eq!(db.storage_volume_id, None);
    assert_eq!(db.security_policy_id, None);
    assert_eq!(db.instance_id, None);
    assert_eq!(db.volume_id, None);

    let rows = h.store.list_volumes(db.project_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ResourceStatus::Deleted);
    assert_eq!(rows[0].provider_volume_id, None);
}

#[tokio::test]
async fn transient_failure_keeps_ids_and_retry_reuses_them() {
    let h = Harness::new();
    h.infra.fail("attach_volume", 503);
    let db = database("ledger");
    h.store.insert_database(db.clone()).await;

    provision_database(&h.ctx, db.id, Attempt { number: 1, max: 3 })
        .await
        .unwrap_err();

    let mid = load(&h, db.id).await;
    assert_eq!(mid.status, ResourceStatus::Provisioning);
    assert!(mid.instance_id.is_some() && mid.storage_volume_id.is_some());
    assert!(mid.username.is_some(), "credentials survive the retry");
    assert_eq!(h.infra.called("delete_instance"), 0);

    h.infra.heal("attach_volume");
    provision_database(&h.ctx, db.id, Attempt { number: 2, max: 3 })
        .await
        .unwrap();

    let done = load(&h, db.id).await;
    assert_eq!(done.status, ResourceStatus::Active);
    assert_eq!(done.instance_id, mid.instance_id);
    assert_eq!(done.username, mid.username);
    assert_eq!(h.infra.called("create_volume"), 1);
    assert_eq!(h.infra.called("create_security_policy"), 1);
    assert_eq!(h.infra.called("create_instance"), 1);
}

#[tokio::test]
async fn final_attempt_of_a_transient_failure_unwinds() {
    let h = Harness::new();
    h.infra.fail("attach_volume", 503);
    let db = database("ledger");
    h.store.insert_database(db.clone()).await;

    provision_database(&h.ctx, db.id, Attempt { number: 3, max: 3 })
        .await
        .unwrap_err();

    assert_eq!(h.infra.called("delete_instance"), 1);
    assert!(h.infra.live().is_empty());
    assert_eq!(load(&h, db.id).await.status, ResourceStatus::Error);
}

#[tokio::test]
async fn dns_failure_falls_back_to_the_instance_address() {
    let h = Harness::new();
    h.infra.fail("create_dns_record", 500);
    let db = database("cache");
    h.store.insert_database(db.clone()).await;

    provision_database(&h.ctx, db.id, Attempt::only()).await.unwrap();

    let db = load(&h, db.id).await;
    assert_eq!(db.status, ResourceStatus::Active);
    assert_eq!(db.hostname.as_deref(), Some("10.10.0.7"));
    assert_eq!(db.dns_record_id, None);
}

#[tokio::test]
async fn active_database_is_left_alone() {
    let h = Harness::new();
    let mut db = database("orders");
    db.status = ResourceStatus::Active;
    h.store.insert_database(db.clone()).await;

    provision_database(&h.ctx, db.id, Attempt::only()).await.unwrap();
    assert!(h.infra.calls().is_empty());
}

#[tokio::test]
async fn volume_lifecycle() {
    let h = Harness::new();
    let vol = volume("uploads");
    h.store.insert_volume(vol.clone()).await;

    provision_volume(&h.ctx, vol.id, Attempt::only()).await.unwrap();
    let provisioned = h.store.get_volume(vol.id).await.unwrap().unwrap();
    assert_eq!(provisioned.status, ResourceStatus::Available);
    let provider_id = provisioned.provider_volume_id.clone().unwrap();
    assert!(h.infra.live().contains(&provider_id));

    // Provisioning again is a no-op.
    provision_volume(&h.ctx, vol.id, Attempt::only()).await.unwrap();
    assert_eq!(h.infra.called("create_volume"), 1);

    delete_volume(&h.ctx, vol.id).await.unwrap();
    let deleted = h.store.get_volume(vol.id).await.unwrap().unwrap();
    assert_eq!(deleted.status, ResourceStatus::Deleted);
    assert_eq!(deleted.provider_volume_id, None);
    assert!(h.infra.live().is_empty());
}

#[tokio::test]
async fn attached_volume_is_detached_before_delete() {
    let h = Harness::new();
    let svc = h.service("api").await;
    h.store
        .set_service_compute(svc.id, Some("vm-42"), None, None)
        .await;

    let mut vol = volume("uploads");
    vol.status = ResourceStatus::Attached;
    vol.provider_volume_id = Some("vol-existing".into());
    vol.service_id = Some(svc.id);
    vol.mount_path = Some("/data".into());
    h.store.insert_volume(vol.clone()).await;

    delete_volume(&h.ctx, vol.id).await.unwrap();

    assert_eq!(
        h.infra.calls(),
        vec![
            "detach_volume vol-existing->vm-42".to_string(),
            "delete_volume vol-existing".to_string(),
        ]
    );
    let deleted = h.store.get_volume(vol.id).await.unwrap().unwrap();
    assert_eq!(deleted.service_id, None);
    assert_eq!(deleted.status, ResourceStatus::Deleted);
}
