use crate::jobs::model::{Job, JobCounts, JobStatus, NewJob};
use crate::jobs::payload::JobPayload;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Result of recording a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Requeued { attempts: i32, run_at: DateTime<Utc> },
    Failed { attempts: i32 },
}

/// Durable job queue contract.
///
/// Every state change after `claim_next` is guarded by the lease holder's
/// `worker_id`; a worker whose lease was reaped cannot complete or fail a job
/// that somebody else now owns.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Atomically claims one eligible job (`pending`, `run_at <= now`),
    /// oldest `run_at` first, and leases it to `worker_id`.
    async fn claim_next(&self, worker_id: &str, lease: Duration)
        -> Result<Option<Job>, StoreError>;

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Counts one failed run. Requeues at `retry_at` while
    /// `attempts < max_attempts`, otherwise fails the job permanently.
    async fn fail_transient(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError>;

    /// Fails the job without retry (bad payload, validation, unknown type).
    async fn fail_permanent(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Returns jobs whose lease expired to `pending` so another worker can
    /// pick them up.
    async fn reap_expired_leases(&self) -> Result<u64, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError>;

    async fn counts(&self) -> Result<JobCounts, StoreError>;

    async fn enqueue_payload(&self, payload: JobPayload) -> Result<Uuid, StoreError> {
        self.enqueue(payload.into_new_job()).await
    }

    async fn enqueue_in(&self, payload: JobPayload, delay: Duration) -> Result<Uuid, StoreError> {
        let mut job = payload.into_new_job();
        job.run_at = Utc::now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        self.enqueue(job).await
    }
}
