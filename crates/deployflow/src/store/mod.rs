//! Persistence port for everything the pipelines read and write besides the
//! job queue.
//!
//! The relational schema itself belongs to the wider platform; this module
//! only names the operations the orchestration core performs on it.

pub mod memory;
pub mod models;
pub mod postgres;

use crate::events::DeploymentLogEntry;
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("deployment {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("lease on job {job_id} is no longer held by this worker")]
    LeaseLost { job_id: Uuid },

    #[error("volume {0} is already attached")]
    AlreadyAttached(Uuid),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // ----------------------------
    // Deployments
    // ----------------------------

    async fn insert_deployment(&self, new: NewDeployment) -> StoreResult<Deployment>;

    async fn get_deployment(&self, id: Uuid) -> StoreResult<Option<Deployment>>;

    /// Moves a deployment forward. Re-entering the current status is a no-op
    /// so a retried job can resume its own phase; anything else must satisfy
    /// [`DeploymentStatus::can_transition_to`]. Sets `started_at` on the first
    /// move out of `queued` and `finished_at` on reaching a terminal status.
    async fn transition_deployment(
        &self,
        id: Uuid,
        next: DeploymentStatus,
    ) -> StoreResult<Deployment>;

    async fn record_build(&self, id: Uuid, image_tag: &str, build_duration_ms: i64)
        -> StoreResult<()>;

    async fn record_build_duration(&self, id: Uuid, build_duration_ms: i64) -> StoreResult<()>;

    async fn record_deploy_duration(&self, id: Uuid, deploy_duration_ms: i64) -> StoreResult<()>;

    /// Records the error of a failed attempt without ending the deployment.
    async fn record_deployment_error(&self, id: Uuid, message: &str) -> StoreResult<()>;

    /// Moves a non-terminal deployment to `failed` with `error_message`.
    /// Terminal deployments are left untouched.
    async fn fail_deployment(&self, id: Uuid, message: &str) -> StoreResult<()>;

    async fn append_log(&self, entry: &DeploymentLogEntry) -> StoreResult<()>;

    async fn list_logs(&self, deployment_id: Uuid) -> StoreResult<Vec<DeploymentLogEntry>>;

    // ----------------------------
    // Services
    // ----------------------------

    async fn get_service(&self, id: Uuid) -> StoreResult<Option<Service>>;

    async fn list_services(&self, project_id: Uuid) -> StoreResult<Vec<Service>>;

    async fn get_git_source(&self, service_id: Uuid) -> StoreResult<Option<GitSource>>;

    async fn get_git_connection(&self, id: Uuid) -> StoreResult<Option<GitConnection>>;

    async fn list_env_vars(&self, service_id: Uuid) -> StoreResult<BTreeMap<String, String>>;

    async fn list_active_domains(&self, service_id: Uuid) -> StoreResult<Vec<String>>;

    async fn set_service_image(&self, id: Uuid, image_tag: &str) -> StoreResult<()>;

    async fn set_service_status(&self, id: Uuid, status: ServiceStatus) -> StoreResult<()>;

    async fn set_service_url(&self, id: Uuid, url: &str) -> StoreResult<()>;

    /// Forgets compute/policy/DNS identifiers after cleanup released them.
    async fn clear_service_infra(&self, id: Uuid) -> StoreResult<()>;

    // ----------------------------
    // Databases
    // ----------------------------

    async fn get_database(&self, id: Uuid) -> StoreResult<Option<Database>>;

    async fn list_databases(&self, project_id: Uuid) -> StoreResult<Vec<Database>>;

    async fn set_database_status(
        &self,
        id: Uuid,
        status: ResourceStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()>;

    /// Adds provider identifiers; never overwrites a stored one with `None`.
    async fn add_database_infra(&self, id: Uuid, infra: &DatabaseInfra) -> StoreResult<()>;

    async fn clear_database_infra(&self, id: Uuid) -> StoreResult<()>;

    /// Stores generated credentials before the instance that uses them is
    /// created, so a retried provisioning run reuses them.
    async fn set_database_credentials(
        &self,
        id: Uuid,
        username: &str,
        password: &str,
        database_name: &str,
    ) -> StoreResult<()>;

    /// Persists connection facts and marks the database `active`.
    async fn activate_database(&self, id: Uuid, conn: &DatabaseConnection) -> StoreResult<()>;

    // ----------------------------
    // Volumes
    // ----------------------------

    async fn get_volume(&self, id: Uuid) -> StoreResult<Option<Volume>>;

    async fn list_volumes(&self, project_id: Uuid) -> StoreResult<Vec<Volume>>;

    async fn list_attached_volumes(&self, owner: VolumeOwner) -> StoreResult<Vec<Volume>>;

    async fn create_volume(&self, new: NewVolume) -> StoreResult<Volume>;

    async fn set_volume_status(
        &self,
        id: Uuid,
        status: ResourceStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()>;

    async fn set_volume_provider_id(&self, id: Uuid, provider_volume_id: &str) -> StoreResult<()>;

    async fn clear_volume_provider_id(&self, id: Uuid) -> StoreResult<()>;

    /// Fails with [`StoreError::AlreadyAttached`] if the volume has an owner.
    async fn attach_volume(
        &self,
        id: Uuid,
        owner: VolumeOwner,
        mount_path: &str,
    ) -> StoreResult<()>;

    async fn detach_volume(&self, id: Uuid) -> StoreResult<()>;

    // ----------------------------
    // Telemetry targets
    // ----------------------------

    async fn register_telemetry_target(&self, resource_id: Uuid, address: &str) -> StoreResult<()>;

    async fn remove_telemetry_targets(&self, resource_id: Uuid) -> StoreResult<u64>;
}
