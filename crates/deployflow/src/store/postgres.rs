// crates/deployflow/src/store/postgres.rs

use crate::events::{DeploymentLogEntry, LogLevel, LogPhase};
use crate::store::models::*;
use crate::store::{Store, StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ----------------------------
// Row mapping
// ----------------------------

fn parse_text<T>(row: &PgRow, col: &str, parse: fn(&str) -> Option<T>) -> StoreResult<T> {
    let raw: String = row.try_get(col)?;
    parse(&raw).ok_or_else(|| StoreError::Corrupt(format!("{col}={raw}")))
}

fn deployment_from_row(row: &PgRow) -> StoreResult<Deployment> {
    Ok(Deployment {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        commit_sha: row.try_get("commit_sha")?,
        commit_message: row.try_get("commit_message")?,
        commit_author: row.try_get("commit_author")?,
        branch: row.try_get("branch")?,
        status: parse_text(row, "status", DeploymentStatus::parse)?,
        image_tag: row.try_get("image_tag")?,
        build_duration_ms: row.try_get("build_duration_ms")?,
        deploy_duration_ms: row.try_get("deploy_duration_ms")?,
        error_message: row.try_get("error_message")?,
        triggered_by: parse_text(row, "triggered_by", TriggeredBy::parse)?,
        rollback_of: row.try_get("rollback_of")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn service_from_row(row: &PgRow) -> StoreResult<Service> {
    Ok(Service {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        namespace: row.try_get("namespace")?,
        port: row.try_get("port")?,
        replicas: row.try_get("replicas")?,
        build_context: row.try_get("build_context")?,
        dockerfile_path: row.try_get("dockerfile_path")?,
        current_image_tag: row.try_get("current_image_tag")?,
        generated_url: row.try_get("generated_url")?,
        status: parse_text(row, "status", ServiceStatus::parse)?,
        compute_instance_id: row.try_get("compute_instance_id")?,
        security_policy_id: row.try_get("security_policy_id")?,
        dns_record_id: row.try_get("dns_record_id")?,
    })
}

fn database_from_row(row: &PgRow) -> StoreResult<Database> {
    Ok(Database {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        engine: parse_text(row, "engine", DatabaseEngine::parse)?,
        version: row.try_get("version")?,
        size_gb: row.try_get("size_gb")?,
        region: row.try_get("region")?,
        status: parse_text(row, "status", ResourceStatus::parse)?,
        instance_id: row.try_get("instance_id")?,
        security_policy_id: row.try_get("security_policy_id")?,
        storage_volume_id: row.try_get("storage_volume_id")?,
        volume_id: row.try_get("volume_id")?,
        hostname: row.try_get("hostname")?,
        dns_record_id: row.try_get("dns_record_id")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        database_name: row.try_get("database_name")?,
        connection_string: row.try_get("connection_string")?,
        error_message: row.try_get("error_message")?,
    })
}

fn volume_from_row(row: &PgRow) -> StoreResult<Volume> {
    Ok(Volume {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        size_gb: row.try_get("size_gb")?,
        region: row.try_get("region")?,
        status: parse_text(row, "status", ResourceStatus::parse)?,
        provider_volume_id: row.try_get("provider_volume_id")?,
        service_id: row.try_get("service_id")?,
        database_id: row.try_get("database_id")?,
        mount_path: row.try_get("mount_path")?,
        error_message: row.try_get("error_message")?,
    })
}

fn log_from_row(row: &PgRow) -> StoreResult<DeploymentLogEntry> {
    Ok(DeploymentLogEntry {
        id: row.try_get("id")?,
        deployment_id: row.try_get("deployment_id")?,
        timestamp: row.try_get("ts")?,
        phase: parse_text(row, "phase", LogPhase::parse)?,
        level: parse_text(row, "level", LogLevel::parse)?,
        message: row.try_get("message")?,
        metadata: row.try_get("metadata")?,
    })
}

fn expect_one(rows_affected: u64, entity: &'static str, id: Uuid) -> StoreResult<()> {
    if rows_affected == 0 {
        Err(StoreError::not_found(entity, id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    // ----------------------------
    // Deployments
    // ----------------------------

    async fn insert_deployment(&self, new: NewDeployment) -> StoreResult<Deployment> {
        let row = sqlx::query(
            r#"
            INSERT INTO deployments (
                service_id, commit_sha, commit_message, commit_author, branch,
                status, image_tag, triggered_by, rollback_of
            )
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(new.service_id)
        .bind(&new.commit_sha)
        .bind(&new.commit_message)
        .bind(&new.commit_author)
        .bind(&new.branch)
        .bind(&new.image_tag)
        .bind(new.triggered_by.as_str())
        .bind(new.rollback_of)
        .fetch_one(&self.pool)
        .await?;

        deployment_from_row(&row)
    }

    async fn get_deployment(&self, id: Uuid) -> StoreResult<Option<Deployment>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deployment_from_row).transpose()
    }

    async fn transition_deployment(
        &self,
        id: Uuid,
        next: DeploymentStatus,
    ) -> StoreResult<Deployment> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM deployments WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found("deployment", id))?;
        let current = deployment_from_row(&row)?;

        if current.status == next {
            tx.commit().await?;
            return Ok(current);
        }
        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to: next,
            });
        }

        let row = sqlx::query(
            r#"
            UPDATE deployments
            SET status = $2,
                started_at = COALESCE(started_at, now()),
                finished_at = CASE WHEN $3 THEN now() ELSE finished_at END
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(next.as_str())
        .bind(next.is_terminal())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        deployment_from_row(&row)
    }

    async fn record_build(
        &self,
        id: Uuid,
        image_tag: &str,
        build_duration_ms: i64,
    ) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE deployments SET image_tag = $2, build_duration_ms = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(image_tag)
        .bind(build_duration_ms)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "deployment", id)
    }

    async fn record_build_duration(&self, id: Uuid, build_duration_ms: i64) -> StoreResult<()> {
        let res = sqlx::query("UPDATE deployments SET build_duration_ms = $2 WHERE id = $1")
            .bind(id)
            .bind(build_duration_ms)
            .execute(&self.pool)
            .await?;
        expect_one(res.rows_affected(), "deployment", id)
    }

    async fn record_deploy_duration(&self, id: Uuid, deploy_duration_ms: i64) -> StoreResult<()> {
        let res = sqlx::query("UPDATE deployments SET deploy_duration_ms = $2 WHERE id = $1")
            .bind(id)
            .bind(deploy_duration_ms)
            .execute(&self.pool)
            .await?;
        expect_one(res.rows_affected(), "deployment", id)
    }

    async fn record_deployment_error(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let res = sqlx::query("UPDATE deployments SET error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        expect_one(res.rows_affected(), "deployment", id)
    }

    async fn fail_deployment(&self, id: Uuid, message: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'failed',
                error_message = $2,
                started_at = COALESCE(started_at, now()),
                finished_at = now()
            WHERE id = $1
              AND status NOT IN ('success', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_log(&self, entry: &DeploymentLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_logs (id, deployment_id, ts, phase, level, message, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.deployment_id)
        .bind(entry.timestamp)
        .bind(entry.phase.as_str())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, deployment_id: Uuid) -> StoreResult<Vec<DeploymentLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM deployment_logs WHERE deployment_id = $1 ORDER BY ts ASC, id ASC",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    // ----------------------------
    // Services
    // ----------------------------

    async fn get_service(&self, id: Uuid) -> StoreResult<Option<Service>> {
        let row = sqlx::query("SELECT * FROM services WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(service_from_row).transpose()
    }

    async fn list_services(&self, project_id: Uuid) -> StoreResult<Vec<Service>> {
        let rows = sqlx::query("SELECT * FROM services WHERE project_id = $1 ORDER BY created_at")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(service_from_row).collect()
    }

    async fn get_git_source(&self, service_id: Uuid) -> StoreResult<Option<GitSource>> {
        let row = sqlx::query("SELECT * FROM git_sources WHERE service_id = $1")
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(GitSource {
            service_id: row.try_get("service_id")?,
            connection_id: row.try_get("connection_id")?,
            repo_url: row.try_get("repo_url")?,
            branch: row.try_get("branch")?,
            root_dir: row.try_get("root_dir")?,
            webhook_id: row.try_get("webhook_id")?,
        }))
    }

    async fn get_git_connection(&self, id: Uuid) -> StoreResult<Option<GitConnection>> {
        let row = sqlx::query_as::<_, (Uuid, String, String)>(
            "SELECT id, provider, access_token FROM git_connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, provider, access_token)| GitConnection {
            id,
            provider,
            access_token,
        }))
    }

    async fn list_env_vars(&self, service_id: Uuid) -> StoreResult<BTreeMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM env_vars WHERE service_id = $1",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn list_active_domains(&self, service_id: Uuid) -> StoreResult<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT domain FROM custom_domains WHERE service_id = $1 AND active ORDER BY domain",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn set_service_image(&self, id: Uuid, image_tag: &str) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE services SET current_image_tag = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(image_tag)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "service", id)
    }

    async fn set_service_status(&self, id: Uuid, status: ServiceStatus) -> StoreResult<()> {
        let res = sqlx::query("UPDATE services SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        expect_one(res.rows_affected(), "service", id)
    }

    async fn set_service_url(&self, id: Uuid, url: &str) -> StoreResult<()> {
        let res =
            sqlx::query("UPDATE services SET generated_url = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(url)
                .execute(&self.pool)
                .await?;
        expect_one(res.rows_affected(), "service", id)
    }

    async fn clear_service_infra(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE services
            SET compute_instance_id = NULL,
                security_policy_id = NULL,
                dns_record_id = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----------------------------
    // Databases
    // ----------------------------

    async fn get_database(&self, id: Uuid) -> StoreResult<Option<Database>> {
        let row = sqlx::query("SELECT * FROM databases WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(database_from_row).transpose()
    }

    async fn list_databases(&self, project_id: Uuid) -> StoreResult<Vec<Database>> {
        let rows = sqlx::query("SELECT * FROM databases WHERE project_id = $1 ORDER BY created_at")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(database_from_row).collect()
    }

    async fn set_database_status(
        &self,
        id: Uuid,
        status: ResourceStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE databases SET status = $2, error_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "database", id)
    }

    async fn add_database_infra(&self, id: Uuid, infra: &DatabaseInfra) -> StoreResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE databases
            SET instance_id = COALESCE($2, instance_id),
                security_policy_id = COALESCE($3, security_policy_id),
                storage_volume_id = COALESCE($4, storage_volume_id),
                volume_id = COALESCE($5, volume_id),
                dns_record_id = COALESCE($6, dns_record_id),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&infra.instance_id)
        .bind(&infra.security_policy_id)
        .bind(&infra.storage_volume_id)
        .bind(infra.volume_id)
        .bind(&infra.dns_record_id)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "database", id)
    }

    async fn clear_database_infra(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE databases
            SET instance_id = NULL,
                security_policy_id = NULL,
                storage_volume_id = NULL,
                volume_id = NULL,
                dns_record_id = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_database_credentials(
        &self,
        id: Uuid,
        username: &str,
        password: &str,
        database_name: &str,
    ) -> StoreResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE databases
            SET username = $2, password = $3, database_name = $4, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(username)
        .bind(password)
        .bind(database_name)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "database", id)
    }

    async fn activate_database(&self, id: Uuid, conn: &DatabaseConnection) -> StoreResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE databases
            SET hostname = $2,
                dns_record_id = COALESCE($3, dns_record_id),
                username = $4,
                password = $5,
                database_name = $6,
                connection_string = $7,
                status = 'active',
                error_message = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&conn.hostname)
        .bind(&conn.dns_record_id)
        .bind(&conn.username)
        .bind(&conn.password)
        .bind(&conn.database_name)
        .bind(&conn.connection_string)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "database", id)
    }

    // ----------------------------
    // Volumes
    // ----------------------------

    async fn get_volume(&self, id: Uuid) -> StoreResult<Option<Volume>> {
        let row = sqlx::query("SELECT * FROM volumes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(volume_from_row).transpose()
    }

    async fn list_volumes(&self, project_id: Uuid) -> StoreResult<Vec<Volume>> {
        let rows = sqlx::query("SELECT * FROM volumes WHERE project_id = $1 ORDER BY created_at")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(volume_from_row).collect()
    }

    async fn list_attached_volumes(&self, owner: VolumeOwner) -> StoreResult<Vec<Volume>> {
        let (sql, id) = match owner {
            VolumeOwner::Service(id) => ("SELECT * FROM volumes WHERE service_id = $1", id),
            VolumeOwner::Database(id) => ("SELECT * FROM volumes WHERE database_id = $1", id),
        };
        let rows = sqlx::query(sql).bind(id).fetch_all(&self.pool).await?;
        rows.iter().map(volume_from_row).collect()
    }

    async fn create_volume(&self, new: NewVolume) -> StoreResult<Volume> {
        let row = sqlx::query(
            r#"
            INSERT INTO volumes (project_id, name, size_gb, region, status, provider_volume_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(new.project_id)
        .bind(&new.name)
        .bind(new.size_gb)
        .bind(&new.region)
        .bind(new.status.as_str())
        .bind(&new.provider_volume_id)
        .fetch_one(&self.pool)
        .await?;

        volume_from_row(&row)
    }

    async fn set_volume_status(
        &self,
        id: Uuid,
        status: ResourceStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE volumes SET status = $2, error_message = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "volume", id)
    }

    async fn set_volume_provider_id(&self, id: Uuid, provider_volume_id: &str) -> StoreResult<()> {
        let res = sqlx::query(
            "UPDATE volumes SET provider_volume_id = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(provider_volume_id)
        .execute(&self.pool)
        .await?;
        expect_one(res.rows_affected(), "volume", id)
    }

    async fn clear_volume_provider_id(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE volumes SET provider_volume_id = NULL, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn attach_volume(
        &self,
        id: Uuid,
        owner: VolumeOwner,
        mount_path: &str,
    ) -> StoreResult<()> {
        let (service_id, database_id) = match owner {
            VolumeOwner::Service(sid) => (Some(sid), None),
            VolumeOwner::Database(did) => (None, Some(did)),
        };

        // Only an unattached volume (or one already attached to the same
        // owner) may be claimed.
        let res = sqlx::query(
            r#"
            UPDATE volumes
            SET service_id = $2,
                database_id = $3,
                mount_path = $4,
                status = 'attached',
                updated_at = now()
            WHERE id = $1
              AND (
                (service_id IS NULL AND database_id IS NULL)
                OR (service_id IS NOT DISTINCT FROM $2 AND database_id IS NOT DISTINCT FROM $3)
              )
            "#,
        )
        .bind(id)
        .bind(service_id)
        .bind(database_id)
        .bind(mount_path)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return match self.get_volume(id).await? {
                Some(_) => Err(StoreError::AlreadyAttached(id)),
                None => Err(StoreError::not_found("volume", id)),
            };
        }
        Ok(())
    }

    async fn detach_volume(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE volumes
            SET service_id = NULL,
                database_id = NULL,
                mount_path = NULL,
                status = CASE WHEN status = 'attached' THEN 'available' ELSE status END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----------------------------
    // Telemetry targets
    // ----------------------------

    async fn register_telemetry_target(&self, resource_id: Uuid, address: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO telemetry_targets (resource_id, address)
            VALUES ($1, $2)
            ON CONFLICT (resource_id, address) DO NOTHING
            "#,
        )
        .bind(resource_id)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_telemetry_targets(&self, resource_id: Uuid) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM telemetry_targets WHERE resource_id = $1")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
