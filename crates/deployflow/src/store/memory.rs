//! In-memory adapter for both the job queue and the store.
//!
//! A single mutex guards all state, which makes `claim_next` trivially
//! exclusive. Backs the test-suite.

use crate::events::DeploymentLogEntry;
use crate::jobs::model::{Job, JobCounts, JobStatus, NewJob};
use crate::jobs::queue::{FailOutcome, JobQueue};
use crate::store::models::*;
use crate::store::{Store, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    jobs: BTreeMap<Uuid, Job>,
    deployments: HashMap<Uuid, Deployment>,
    logs: Vec<DeploymentLogEntry>,
    services: HashMap<Uuid, Service>,
    git_sources: HashMap<Uuid, GitSource>,
    git_connections: HashMap<Uuid, GitConnection>,
    env_vars: HashMap<Uuid, BTreeMap<String, String>>,
    domains: HashMap<Uuid, Vec<(String, bool)>>,
    databases: HashMap<Uuid, Database>,
    volumes: HashMap<Uuid, Volume>,
    telemetry: Vec<(Uuid, String)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ----------------------------
    // Seeding (stands in for the request layer)
    // ----------------------------

    pub async fn insert_service(&self, service: Service) {
        self.state.lock().await.services.insert(service.id, service);
    }

    pub async fn insert_git_connection(&self, conn: GitConnection) {
        self.state.lock().await.git_connections.insert(conn.id, conn);
    }

    pub async fn insert_git_source(&self, source: GitSource) {
        self.state
            .lock()
            .await
            .git_sources
            .insert(source.service_id, source);
    }

    pub async fn set_env_var(&self, service_id: Uuid, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .env_vars
            .entry(service_id)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub async fn add_domain(&self, service_id: Uuid, domain: &str, active: bool) {
        self.state
            .lock()
            .await
            .domains
            .entry(service_id)
            .or_default()
            .push((domain.to_string(), active));
    }

    pub async fn insert_database(&self, database: Database) {
        self.state
            .lock()
            .await
            .databases
            .insert(database.id, database);
    }

    pub async fn insert_volume(&self, volume: Volume) {
        self.state.lock().await.volumes.insert(volume.id, volume);
    }

    pub async fn set_service_compute(
        &self,
        service_id: Uuid,
        instance_id: Option<&str>,
        security_policy_id: Option<&str>,
        dns_record_id: Option<&str>,
    ) {
        if let Some(svc) = self.state.lock().await.services.get_mut(&service_id) {
            svc.compute_instance_id = instance_id.map(str::to_string);
            svc.security_policy_id = security_policy_id.map(str::to_string);
            svc.dns_record_id = dns_record_id.map(str::to_string);
        }
    }

    pub async fn set_webhook_id(&self, service_id: Uuid, webhook_id: &str) {
        if let Some(src) = self.state.lock().await.git_sources.get_mut(&service_id) {
            src.webhook_id = Some(webhook_id.to_string());
        }
    }

    pub async fn telemetry_targets(&self, resource_id: Uuid) -> Vec<String> {
        self.state
            .lock()
            .await
            .telemetry
            .iter()
            .filter(|(id, _)| *id == resource_id)
            .map(|(_, addr)| addr.clone())
            .collect()
    }

    /// Marks a deployment cancelled, as the request layer would.
    pub async fn cancel_deployment(&self, id: Uuid) -> StoreResult<()> {
        self.transition_deployment(id, DeploymentStatus::Cancelled)
            .await
            .map(|_| ())
    }
}

fn deployment_mut<'a>(state: &'a mut State, id: Uuid) -> StoreResult<&'a mut Deployment> {
    state
        .deployments
        .get_mut(&id)
        .ok_or_else(|| StoreError::not_found("deployment", id))
}

fn service_mut<'a>(state: &'a mut State, id: Uuid) -> StoreResult<&'a mut Service> {
    state
        .services
        .get_mut(&id)
        .ok_or_else(|| StoreError::not_found("service", id))
}

fn database_mut<'a>(state: &'a mut State, id: Uuid) -> StoreResult<&'a mut Database> {
    state
        .databases
        .get_mut(&id)
        .ok_or_else(|| StoreError::not_found("database", id))
}

fn volume_mut<'a>(state: &'a mut State, id: Uuid) -> StoreResult<&'a mut Volume> {
    state
        .volumes
        .get_mut(&id)
        .ok_or_else(|| StoreError::not_found("volume", id))
}

fn leased_job<'a>(state: &'a mut State, id: Uuid, worker_id: &str) -> StoreResult<&'a mut Job> {
    match state.jobs.get_mut(&id) {
        Some(job) if job.locked_by.as_deref() == Some(worker_id) => Ok(job),
        Some(_) => Err(StoreError::LeaseLost { job_id: id }),
        None => Err(StoreError::not_found("job", id)),
    }
}

fn release(job: &mut Job) {
    job.locked_by = None;
    job.locked_until = None;
    job.updated_at = Utc::now();
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.state.lock().await.jobs.insert(
            id,
            Job {
                id,
                job_type: job.job_type,
                payload_json: job.payload_json,
                status: JobStatus::Pending.as_str().to_string(),
                attempts: 0,
                max_attempts: job.max_attempts.max(1),
                run_at: job.run_at,
                locked_by: None,
                locked_until: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let candidate = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending.as_str() && j.run_at <= now)
            .min_by_key(|j| (j.run_at, j.created_at))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("job", id))?;
        job.status = JobStatus::Processing.as_str().to_string();
        job.locked_by = Some(worker_id.to_string());
        job.locked_until = Some(now + lease);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = leased_job(&mut state, job_id, worker_id)?;
        job.status = JobStatus::Completed.as_str().to_string();
        release(job);
        Ok(())
    }

    async fn fail_transient(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let job = leased_job(&mut state, job_id, worker_id)?;
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        release(job);

        if job.attempts < job.max_attempts {
            job.status = JobStatus::Pending.as_str().to_string();
            job.run_at = retry_at;
            Ok(FailOutcome::Requeued {
                attempts: job.attempts,
                run_at: retry_at,
            })
        } else {
            job.status = JobStatus::Failed.as_str().to_string();
            Ok(FailOutcome::Failed {
                attempts: job.attempts,
            })
        }
    }

    async fn fail_permanent(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = leased_job(&mut state, job_id, worker_id)?;
        job.attempts += 1;
        job.status = JobStatus::Failed.as_str().to_string();
        job.last_error = Some(error.to_string());
        release(job);
        Ok(())
    }

    async fn reap_expired_leases(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut reaped = 0;
        for job in state.jobs.values_mut() {
            let expired = job.locked_until.map(|t| t < now).unwrap_or(false);
            if job.status == JobStatus::Processing.as_str() && expired {
                job.status = JobStatus::Pending.as_str().to_string();
                release(job);
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.map(|s| j.status == s.as_str()).unwrap_or(true))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.clamp(1, 500) as usize);
        Ok(jobs)
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match JobStatus::parse(&job.status) {
                Some(JobStatus::Pending) => counts.pending += 1,
                Some(JobStatus::Processing) => counts.processing += 1,
                Some(JobStatus::Completed) => counts.completed += 1,
                Some(JobStatus::Failed) => counts.failed += 1,
                None => {}
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_deployment(&self, new: NewDeployment) -> StoreResult<Deployment> {
        let deployment = Deployment {
            id: Uuid::new_v4(),
            service_id: new.service_id,
            commit_sha: new.commit_sha,
            commit_message: new.commit_message,
            commit_author: new.commit_author,
            branch: new.branch,
            status: DeploymentStatus::Queued,
            image_tag: new.image_tag,
            build_duration_ms: None,
            deploy_duration_ms: None,
            error_message: None,
            triggered_by: new.triggered_by,
            rollback_of: new.rollback_of,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        };
        self.state
            .lock()
            .await
            .deployments
            .insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    async fn get_deployment(&self, id: Uuid) -> StoreResult<Option<Deployment>> {
        Ok(self.state.lock().await.deployments.get(&id).cloned())
    }

    async fn transition_deployment(
        &self,
        id: Uuid,
        next: DeploymentStatus,
    ) -> StoreResult<Deployment> {
        let mut state = self.state.lock().await;
        let d = deployment_mut(&mut state, id)?;
        if d.status == next {
            return Ok(d.clone());
        }
        if !d.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id,
                from: d.status,
                to: next,
            });
        }
        let now = Utc::now();
        if d.started_at.is_none() {
            d.started_at = Some(now);
        }
        if next.is_terminal() {
            d.finished_at = Some(now);
        }
        d.status = next;
        Ok(d.clone())
    }

    async fn record_build(
        &self,
        id: Uuid,
        image_tag: &str,
        build_duration_ms: i64,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let d = deployment_mut(&mut state, id)?;
        d.image_tag = Some(image_tag.to_string());
        d.build_duration_ms = Some(build_duration_ms);
        Ok(())
    }

    async fn record_build_duration(&self, id: Uuid, build_duration_ms: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        deployment_mut(&mut state, id)?.build_duration_ms = Some(build_duration_ms);
        Ok(())
    }

    async fn record_deploy_duration(&self, id: Uuid, deploy_duration_ms: i64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        deployment_mut(&mut state, id)?.deploy_duration_ms = Some(deploy_duration_ms);
        Ok(())
    }

    async fn record_deployment_error(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        deployment_mut(&mut state, id)?.error_message = Some(message.to_string());
        Ok(())
    }

    async fn fail_deployment(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let d = deployment_mut(&mut state, id)?;
        if d.status.is_terminal() {
            return Ok(());
        }
        let now = Utc::now();
        d.status = DeploymentStatus::Failed;
        d.error_message = Some(message.to_string());
        d.started_at.get_or_insert(now);
        d.finished_at = Some(now);
        Ok(())
    }

    async fn append_log(&self, entry: &DeploymentLogEntry) -> StoreResult<()> {
        self.state.lock().await.logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, deployment_id: Uuid) -> StoreResult<Vec<DeploymentLogEntry>> {
        let state = self.state.lock().await;
        let mut logs: Vec<DeploymentLogEntry> = state
            .logs
            .iter()
            .filter(|e| e.deployment_id == deployment_id)
            .cloned()
            .collect();
        logs.sort_by_key(|e| e.timestamp);
        Ok(logs)
    }

    async fn get_service(&self, id: Uuid) -> StoreResult<Option<Service>> {
        Ok(self.state.lock().await.services.get(&id).cloned())
    }

    async fn list_services(&self, project_id: Uuid) -> StoreResult<Vec<Service>> {
        let state = self.state.lock().await;
        Ok(state
            .services
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_git_source(&self, service_id: Uuid) -> StoreResult<Option<GitSource>> {
        Ok(self.state.lock().await.git_sources.get(&service_id).cloned())
    }

    async fn get_git_connection(&self, id: Uuid) -> StoreResult<Option<GitConnection>> {
        Ok(self.state.lock().await.git_connections.get(&id).cloned())
    }

    async fn list_env_vars(&self, service_id: Uuid) -> StoreResult<BTreeMap<String, String>> {
        Ok(self
            .state
            .lock()
            .await
            .env_vars
            .get(&service_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_active_domains(&self, service_id: Uuid) -> StoreResult<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .domains
            .get(&service_id)
            .map(|ds| {
                ds.iter()
                    .filter(|(_, active)| *active)
                    .map(|(d, _)| d.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_service_image(&self, id: Uuid, image_tag: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        service_mut(&mut state, id)?.current_image_tag = Some(image_tag.to_string());
        Ok(())
    }

    async fn set_service_status(&self, id: Uuid, status: ServiceStatus) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        service_mut(&mut state, id)?.status = status;
        Ok(())
    }

    async fn set_service_url(&self, id: Uuid, url: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        service_mut(&mut state, id)?.generated_url = Some(url.to_string());
        Ok(())
    }

    async fn clear_service_infra(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let svc = service_mut(&mut state, id)?;
        svc.compute_instance_id = None;
        svc.security_policy_id = None;
        svc.dns_record_id = None;
        Ok(())
    }

    async fn get_database(&self, id: Uuid) -> StoreResult<Option<Database>> {
        Ok(self.state.lock().await.databases.get(&id).cloned())
    }

    async fn list_databases(&self, project_id: Uuid) -> StoreResult<Vec<Database>> {
        let state = self.state.lock().await;
        Ok(state
            .databases
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn set_database_status(
        &self,
        id: Uuid,
        status: ResourceStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let db = database_mut(&mut state, id)?;
        db.status = status;
        db.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn add_database_infra(&self, id: Uuid, infra: &DatabaseInfra) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let db = database_mut(&mut state, id)?;
        if let Some(v) = &infra.instance_id {
            db.instance_id = Some(v.clone());
        }
        if let Some(v) = &infra.security_policy_id {
            db.security_policy_id = Some(v.clone());
        }
        if let Some(v) = &infra.storage_volume_id {
            db.storage_volume_id = Some(v.clone());
        }
        if let Some(v) = infra.volume_id {
            db.volume_id = Some(v);
        }
        if let Some(v) = &infra.dns_record_id {
            db.dns_record_id = Some(v.clone());
        }
        Ok(())
    }

    async fn clear_database_infra(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let db = database_mut(&mut state, id)?;
        db.instance_id = None;
        db.security_policy_id = None;
        db.storage_volume_id = None;
        db.volume_id = None;
        db.dns_record_id = None;
        Ok(())
    }

    async fn set_database_credentials(
        &self,
        id: Uuid,
        username: &str,
        password: &str,
        database_name: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let db = database_mut(&mut state, id)?;
        db.username = Some(username.to_string());
        db.password = Some(password.to_string());
        db.database_name = Some(database_name.to_string());
        Ok(())
    }

    async fn activate_database(&self, id: Uuid, conn: &DatabaseConnection) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let db = database_mut(&mut state, id)?;
        db.hostname = Some(conn.hostname.clone());
        if conn.dns_record_id.is_some() {
            db.dns_record_id = conn.dns_record_id.clone();
        }
        db.username = Some(conn.username.clone());
        db.password = Some(conn.password.clone());
        db.database_name = Some(conn.database_name.clone());
        db.connection_string = Some(conn.connection_string.clone());
        db.status = ResourceStatus::Active;
        db.error_message = None;
        Ok(())
    }

    async fn get_volume(&self, id: Uuid) -> StoreResult<Option<Volume>> {
        Ok(self.state.lock().await.volumes.get(&id).cloned())
    }

    async fn list_volumes(&self, project_id: Uuid) -> StoreResult<Vec<Volume>> {
        let state = self.state.lock().await;
        Ok(state
            .volumes
            .values()
            .filter(|v| v.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_attached_volumes(&self, owner: VolumeOwner) -> StoreResult<Vec<Volume>> {
        let state = self.state.lock().await;
        Ok(state
            .volumes
            .values()
            .filter(|v| v.owner() == Some(owner))
            .cloned()
            .collect())
    }

    async fn create_volume(&self, new: NewVolume) -> StoreResult<Volume> {
        let volume = Volume {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            name: new.name,
            size_gb: new.size_gb,
            region: new.region,
            status: new.status,
            provider_volume_id: new.provider_volume_id,
            service_id: None,
            database_id: None,
            mount_path: None,
            error_message: None,
        };
        self.state
            .lock()
            .await
            .volumes
            .insert(volume.id, volume.clone());
        Ok(volume)
    }

    async fn set_volume_status(
        &self,
        id: Uuid,
        status: ResourceStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let v = volume_mut(&mut state, id)?;
        v.status = status;
        v.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn set_volume_provider_id(&self, id: Uuid, provider_volume_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        volume_mut(&mut state, id)?.provider_volume_id = Some(provider_volume_id.to_string());
        Ok(())
    }

    async fn clear_volume_provider_id(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        volume_mut(&mut state, id)?.provider_volume_id = None;
        Ok(())
    }

    async fn attach_volume(
        &self,
        id: Uuid,
        owner: VolumeOwner,
        mount_path: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let v = volume_mut(&mut state, id)?;
        match v.owner() {
            Some(current) if current == owner => return Ok(()),
            Some(_) => return Err(StoreError::AlreadyAttached(id)),
            None => {}
        }
        match owner {
            VolumeOwner::Service(sid) => v.service_id = Some(sid),
            VolumeOwner::Database(did) => v.database_id = Some(did),
        }
        v.mount_path = Some(mount_path.to_string());
        v.status = ResourceStatus::Attached;
        Ok(())
    }

    async fn detach_volume(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let v = volume_mut(&mut state, id)?;
        v.service_id = None;
        v.database_id = None;
        v.mount_path = None;
        if v.status == ResourceStatus::Attached {
            v.status = ResourceStatus::Available;
        }
        Ok(())
    }

    async fn register_telemetry_target(&self, resource_id: Uuid, address: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let exists = state
            .telemetry
            .iter()
            .any(|(id, a)| *id == resource_id && a == address);
        if !exists {
            state.telemetry.push((resource_id, address.to_string()));
        }
        Ok(())
    }

    async fn remove_telemetry_targets(&self, resource_id: Uuid) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.telemetry.len();
        state.telemetry.retain(|(id, _)| *id != resource_id);
        Ok((before - state.telemetry.len()) as u64)
    }
}
