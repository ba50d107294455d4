//! Database and volume provisioning on the infrastructure API.
//!
//! Every provider id is written to the row as soon as the provider returns
//! it. A retried job finds those ids and reuses them instead of allocating
//! twice. Only a hard failure (non-retryable, or the last attempt) unwinds
//! what was allocated.

use crate::clients::{InfraApi, InstanceRequest, InstanceState, SecurityPolicyRequest};
use crate::error::PipelineError;
use crate::pipelines::compensation::Compensation;
use crate::pipelines::{is_terminal_failure, Attempt, PipelineContext};
use crate::store::{
    Database, DatabaseConnection, DatabaseEngine, DatabaseInfra, NewVolume, ResourceStatus,
    Volume, VolumeOwner,
};
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// node_exporter on every provisioned instance.
const TELEMETRY_PORT: u16 = 9100;
const DATA_MOUNT: &str = "/mnt/data";

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn lower_alnum(rng: &mut impl Rng, len: usize) -> String {
    Alphanumeric.sample_string(rng, len).to_ascii_lowercase()
}

/// `(username, password, database_name)`.
pub fn generate_credentials(rng: &mut impl Rng) -> (String, String, String) {
    (
        format!("u_{}", lower_alnum(rng, 10)),
        Alphanumeric.sample_string(rng, 32),
        format!("db_{}", lower_alnum(rng, 8)),
    )
}

pub fn storage_name(database_id: Uuid) -> String {
    format!("db-{}-data", short_id(database_id))
}

/// Where the provider exposes an attached block volume on the instance.
pub fn device_path(volume_name: &str) -> String {
    format!("/dev/disk/by-id/scsi-0DO_Volume_{volume_name}")
}

pub fn database_hostname(db_name: &str, database_id: Uuid, internal_domain: &str) -> String {
    format!("{db_name}-{}.{internal_domain}", short_id(database_id))
}

pub fn engine_image(engine: DatabaseEngine, version: &str) -> String {
    let repo = match engine {
        DatabaseEngine::Postgres => "postgres",
        DatabaseEngine::Mysql => "mysql",
        DatabaseEngine::Redis => "redis",
        DatabaseEngine::Mongodb => "mongo",
    };
    format!("{repo}:{version}")
}

pub fn connection_string(
    engine: DatabaseEngine,
    host: &str,
    username: &str,
    password: &str,
    database_name: &str,
) -> String {
    let port = engine.default_port();
    let scheme = engine.url_scheme();
    match engine {
        DatabaseEngine::Redis => format!("{scheme}://default:{password}@{host}:{port}/0"),
        _ => format!("{scheme}://{username}:{password}@{host}:{port}/{database_name}"),
    }
}

/// Cloud-init script: mount the data volume, run the engine in a container
/// with its data on the volume, and expose host metrics for telemetry.
pub fn bootstrap_script(
    engine: DatabaseEngine,
    version: &str,
    device: &str,
    username: &str,
    password: &str,
    database_name: &str,
) -> String {
    let image = engine_image(engine, version);
    let port = engine.default_port();
    let run = match engine {
        DatabaseEngine::Postgres => format!(
            "-e POSTGRES_USER={username} -e POSTGRES_PASSWORD={password} \
             -e POSTGRES_DB={database_name} -v {DATA_MOUNT}:/var/lib/postgresql/data {image}"
        ),
        DatabaseEngine::Mysql => format!(
            "-e MYSQL_USER={username} -e MYSQL_PASSWORD={password} \
             -e MYSQL_RANDOM_ROOT_PASSWORD=yes -e MYSQL_DATABASE={database_name} \
             -v {DATA_MOUNT}:/var/lib/mysql {image}"
        ),
        DatabaseEngine::Redis => format!(
            "-v {DATA_MOUNT}:/data {image} redis-server --appendonly yes --requirepass {password}"
        ),
        DatabaseEngine::Mongodb => format!(
            "-e MONGO_INITDB_ROOT_USERNAME={username} -e MONGO_INITDB_ROOT_PASSWORD={password} \
             -e MONGO_INITDB_DATABASE={database_name} -v {DATA_MOUNT}:/data/db {image}"
        ),
    };

    format!(
        r#"#!/bin/bash
set -euo pipefail

while [ ! -e {device} ]; do sleep 2; done
if ! blkid {device}; then mkfs.ext4 -q {device}; fi
mkdir -p {DATA_MOUNT}
echo '{device} {DATA_MOUNT} ext4 defaults,nofail,discard 0 2' >> /etc/fstab
mount -a

curl -fsSL https://get.docker.com | sh
docker run -d --restart unless-stopped --name database -p {port}:{port} {run}
docker run -d --restart unless-stopped --name node-exporter --net host --pid host \
  -v /:/host:ro,rslave quay.io/prometheus/node-exporter:latest --path.rootfs=/host
"#
    )
}

fn client_err(step: &'static str) -> impl FnOnce(crate::clients::ClientError) -> PipelineError {
    move |e| PipelineError::client(step, e)
}

// ----------------------------
// Database
// ----------------------------

#[instrument(skip_all, fields(%database_id))]
pub async fn provision_database(
    ctx: &PipelineContext,
    database_id: Uuid,
    attempt: Attempt,
) -> Result<(), PipelineError> {
    let db = ctx
        .store
        .get_database(database_id)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("database {database_id} not found")))?;

    match db.status {
        ResourceStatus::Active => {
            info!("database already active");
            return Ok(());
        }
        ResourceStatus::Deleted => {
            return Err(PipelineError::Validation(format!(
                "database {database_id} was deleted"
            )))
        }
        _ => {}
    }

    ctx.store
        .set_database_status(database_id, ResourceStatus::Provisioning, None)
        .await?;

    let mut undo = Compensation::new();
    match provision_database_steps(ctx, &db, &mut undo).await {
        Ok(conn) => {
            info!(hostname = %conn.hostname, "database active");
            Ok(())
        }
        Err(err) if is_terminal_failure(&err, attempt) => {
            warn!(error = %err, steps = undo.len(), "database provisioning failed, releasing resources");
            let report = undo.unwind().await;
            if report.failed.is_empty() {
                let current = ctx.store.get_database(database_id).await?;
                if let Some(volume_id) = current.and_then(|d| d.volume_id) {
                    retire_storage_row(ctx, volume_id).await?;
                }
                ctx.store.clear_database_infra(database_id).await?;
            } else {
                warn!(failed = ?report.failed, "some resources could not be released; ids kept");
            }
            ctx.store
                .set_database_status(database_id, ResourceStatus::Error, Some(&err.to_string()))
                .await?;
            Err(err)
        }
        Err(err) => {
            warn!(
                error = %err,
                attempt = attempt.number,
                max_attempts = attempt.max,
                "database provisioning attempt failed, ids kept for retry"
            );
            ctx.store
                .set_database_status(
                    database_id,
                    ResourceStatus::Provisioning,
                    Some(&err.to_string()),
                )
                .await?;
            Err(err)
        }
    }
}

/// Marks the `volumes` row of a released storage volume deleted.
pub(crate) async fn retire_storage_row(
    ctx: &PipelineContext,
    volume_id: Uuid,
) -> Result<(), PipelineError> {
    ctx.store.detach_volume(volume_id).await?;
    ctx.store.clear_volume_provider_id(volume_id).await?;
    ctx.store
        .set_volume_status(volume_id, ResourceStatus::Deleted, None)
        .await?;
    Ok(())
}

async fn provision_database_steps(
    ctx: &PipelineContext,
    db: &Database,
    undo: &mut Compensation,
) -> Result<DatabaseConnection, PipelineError> {
    let infra: Arc<dyn InfraApi> = ctx.infra.clone();
    let id = db.id;
    let volume_name = storage_name(id);

    // Credentials go into the bootstrap script, so they exist before the
    // instance does and survive retries.
    let (username, password, database_name) =
        match (&db.username, &db.password, &db.database_name) {
            (Some(u), Some(p), Some(n)) => (u.clone(), p.clone(), n.clone()),
            _ => {
                let creds = generate_credentials(&mut rand::thread_rng());
                ctx.store
                    .set_database_credentials(id, &creds.0, &creds.1, &creds.2)
                    .await?;
                creds
            }
        };

    // Each allocation registers its undo before its id is persisted, so a
    // failed write still releases it.

    // ----------------------------
    // Block storage
    // ----------------------------
    let storage_id = match &db.storage_volume_id {
        Some(existing) => existing.clone(),
        None => infra
            .create_volume(&volume_name, db.size_gb, &db.region)
            .await
            .map_err(client_err("create_volume"))?,
    };
    {
        let infra = infra.clone();
        let storage_id = storage_id.clone();
        undo.push("delete_storage", move || async move {
            infra.delete_volume(&storage_id).await
        });
    }
    if db.storage_volume_id.is_none() {
        ctx.store
            .add_database_infra(
                id,
                &DatabaseInfra {
                    storage_volume_id: Some(storage_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
    }

    let volume_id = match db.volume_id {
        Some(existing) => existing,
        None => {
            let row = ctx
                .store
                .create_volume(NewVolume {
                    project_id: db.project_id,
                    name: volume_name.clone(),
                    size_gb: db.size_gb,
                    region: db.region.clone(),
                    status: ResourceStatus::Available,
                    provider_volume_id: Some(storage_id.clone()),
                })
                .await?;
            ctx.store
                .add_database_infra(
                    id,
                    &DatabaseInfra {
                        volume_id: Some(row.id),
                        ..Default::default()
                    },
                )
                .await?;
            row.id
        }
    };

    // ----------------------------
    // Security policy
    // ----------------------------
    let target_tag = format!("database:{id}");
    let policy_id = match &db.security_policy_id {
        Some(existing) => existing.clone(),
        None => infra
            .create_security_policy(&SecurityPolicyRequest {
                name: format!("db-{}-fw", short_id(id)),
                port: db.engine.default_port(),
                source_cidrs: vec![ctx.settings.private_cidr.clone()],
                target_tag: target_tag.clone(),
            })
            .await
            .map_err(client_err("create_security_policy"))?,
    };
    {
        let infra = infra.clone();
        let policy_id = policy_id.clone();
        undo.push("delete_security_policy", move || async move {
            infra.delete_security_policy(&policy_id).await
        });
    }
    if db.security_policy_id.is_none() {
        ctx.store
            .add_database_infra(
                id,
                &DatabaseInfra {
                    security_policy_id: Some(policy_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
    }

    // ----------------------------
    // Compute instance
    // ----------------------------
    let instance_id = match &db.instance_id {
        Some(existing) => existing.clone(),
        None => infra
            .create_instance(&InstanceRequest {
                name: format!("db-{}", short_id(id)),
                region: db.region.clone(),
                size: ctx.settings.instance_size.clone(),
                image: ctx.settings.instance_image.clone(),
                tags: vec![target_tag.clone(), "deployflow".to_string()],
                user_data: bootstrap_script(
                    db.engine,
                    &db.version,
                    &device_path(&volume_name),
                    &username,
                    &password,
                    &database_name,
                ),
            })
            .await
            .map_err(client_err("create_instance"))?,
    };
    {
        let infra = infra.clone();
        let instance_id = instance_id.clone();
        undo.push("delete_instance", move || async move {
            infra.delete_instance(&instance_id).await
        });
    }
    if db.instance_id.is_none() {
        ctx.store
            .add_database_infra(
                id,
                &DatabaseInfra {
                    instance_id: Some(instance_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
    }

    let state: InstanceState = infra
        .wait_for_instance(
            &instance_id,
            ctx.settings.instance_timeout,
            ctx.settings.poll_interval,
        )
        .await
        .map_err(client_err("wait_for_instance"))?;
    let ip = state
        .private_ip
        .clone()
        .or(state.public_ip.clone())
        .ok_or_else(|| PipelineError::Failed(format!("instance {instance_id} has no address")))?;

    // ----------------------------
    // Attach storage
    // ----------------------------
    let owner = VolumeOwner::Database(id);
    let attached = ctx
        .store
        .get_volume(volume_id)
        .await?
        .is_some_and(|v| v.owner() == Some(owner));
    if attached {
        info!(%volume_id, "storage already attached");
    } else {
        infra
            .attach_volume(&storage_id, &instance_id, &db.region)
            .await
            .map_err(client_err("attach_volume"))?;
    }
    {
        let infra = infra.clone();
        let (storage_id, instance_id, region) =
            (storage_id.clone(), instance_id.clone(), db.region.clone());
        undo.push("detach_storage", move || async move {
            infra.detach_volume(&storage_id, &instance_id, &region).await
        });
    }
    if !attached {
        ctx.store.attach_volume(volume_id, owner, DATA_MOUNT).await?;
    }

    // ----------------------------
    // DNS (best-effort)
    // ----------------------------
    let zone = ctx.settings.internal_domain.clone();
    let fqdn = database_hostname(&db.name, id, &zone);
    let record_name = fqdn
        .strip_suffix(&format!(".{zone}"))
        .unwrap_or(&fqdn)
        .to_string();
    let dns_record_id = match &db.dns_record_id {
        Some(existing) => Some(existing.clone()),
        None => match infra.create_dns_record(&zone, &record_name, &ip).await {
            Ok(record_id) => Some(record_id),
            Err(e) => {
                warn!(error = %e, "dns record not created, using instance address");
                None
            }
        },
    };
    let hostname = match &dns_record_id {
        Some(record_id) => {
            {
                let infra = infra.clone();
                let (zone, record_id) = (zone.clone(), record_id.clone());
                undo.push("delete_dns_record", move || async move {
                    infra.delete_dns_record(&zone, &record_id).await
                });
            }
            if db.dns_record_id.is_none() {
                ctx.store
                    .add_database_infra(
                        id,
                        &DatabaseInfra {
                            dns_record_id: Some(record_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            fqdn
        }
        None => ip.clone(),
    };

    ctx.store
        .register_telemetry_target(id, &format!("{ip}:{TELEMETRY_PORT}"))
        .await?;

    let conn = DatabaseConnection {
        connection_string: connection_string(
            db.engine,
            &hostname,
            &username,
            &password,
            &database_name,
        ),
        hostname,
        dns_record_id,
        username,
        password,
        database_name,
    };
    ctx.store.activate_database(id, &conn).await?;
    Ok(conn)
}

// ----------------------------
// Volumes
// ----------------------------

#[instrument(skip_all, fields(%volume_id))]
pub async fn provision_volume(
    ctx: &PipelineContext,
    volume_id: Uuid,
    attempt: Attempt,
) -> Result<(), PipelineError> {
    let volume = ctx
        .store
        .get_volume(volume_id)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("volume {volume_id} not found")))?;

    match volume.status {
        ResourceStatus::Available | ResourceStatus::Attached => return Ok(()),
        ResourceStatus::Deleted => {
            return Err(PipelineError::Validation(format!(
                "volume {volume_id} was deleted"
            )))
        }
        _ => {}
    }

    ctx.store
        .set_volume_status(volume_id, ResourceStatus::Provisioning, None)
        .await?;

    let result = match &volume.provider_volume_id {
        Some(_) => Ok(()),
        None => match ctx
            .infra
            .create_volume(&volume.name, volume.size_gb, &volume.region)
            .await
        {
            Ok(provider_id) => {
                ctx.store
                    .set_volume_provider_id(volume_id, &provider_id)
                    .await?;
                Ok(())
            }
            Err(e) => Err(PipelineError::client("create_volume", e)),
        },
    };

    match result {
        Ok(()) => {
            ctx.store
                .set_volume_status(volume_id, ResourceStatus::Available, None)
                .await?;
            info!("volume available");
            Ok(())
        }
        Err(err) => {
            let status = if is_terminal_failure(&err, attempt) {
                ResourceStatus::Error
            } else {
                ResourceStatus::Provisioning
            };
            ctx.store
                .set_volume_status(volume_id, status, Some(&err.to_string()))
                .await?;
            Err(err)
        }
    }
}

/// The instance a volume is attached to, if its owner has one.
pub(crate) async fn owner_instance(
    ctx: &PipelineContext,
    volume: &Volume,
) -> Result<Option<String>, PipelineError> {
    Ok(match volume.owner() {
        Some(VolumeOwner::Service(id)) => ctx
            .store
            .get_service(id)
            .await?
            .and_then(|s| s.compute_instance_id),
        Some(VolumeOwner::Database(id)) => {
            ctx.store.get_database(id).await?.and_then(|d| d.instance_id)
        }
        None => None,
    })
}

/// Detaches (if attached) and deletes a volume, then marks it `deleted`.
#[instrument(skip_all, fields(%volume_id))]
pub async fn delete_volume(ctx: &PipelineContext, volume_id: Uuid) -> Result<(), PipelineError> {
    let volume = ctx
        .store
        .get_volume(volume_id)
        .await?
        .ok_or_else(|| PipelineError::Validation(format!("volume {volume_id} not found")))?;
    if volume.status == ResourceStatus::Deleted {
        return Ok(());
    }

    release_volume(ctx, &volume).await?;
    ctx.store
        .set_volume_status(volume_id, ResourceStatus::Deleted, None)
        .await?;
    info!("volume deleted");
    Ok(())
}

/// Detach from the owner's instance, then delete on the provider. Stops at
/// the first failure so the job can be retried.
async fn release_volume(
    ctx: &PipelineContext,
    volume: &Volume,
) -> Result<(), PipelineError> {
    if let Some(provider_id) = &volume.provider_volume_id {
        if let Some(instance_id) = owner_instance(ctx, volume).await? {
            ctx.infra
                .detach_volume(provider_id, &instance_id, &volume.region)
                .await
                .map_err(client_err("detach_volume"))?;
        }
    }
    if volume.owner().is_some() {
        ctx.store.detach_volume(volume.id).await?;
    }
    if let Some(provider_id) = &volume.provider_volume_id {
        ctx.infra
            .delete_volume(provider_id)
            .await
            .map_err(client_err("delete_volume"))?;
        ctx.store.clear_volume_provider_id(volume.id).await?;
    }
    Ok(())
}
