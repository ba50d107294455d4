// crates/deployflow/src/jobs/repo.rs

use crate::jobs::model::{Job, JobCounts, JobStatus, NewJob};
use crate::jobs::queue::{FailOutcome, JobQueue};
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    // ----------------------------
    // Enqueue
    // ----------------------------

    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (job_type, payload_json, run_at, status, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.payload_json)
        .bind(job.run_at)
        .bind(JobStatus::Pending.as_str())
        .bind(job.max_attempts.max(1))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    /// Claim exactly one runnable job for this worker.
    ///
    /// Correctness: SELECT ... FOR UPDATE SKIP LOCKED. Two concurrent callers
    /// never see the same candidate row; the loser skips it and takes the next
    /// one or nothing.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            WITH candidate AS (
              SELECT id
              FROM jobs
              WHERE status = 'pending'
                AND run_at <= now()
              ORDER BY run_at ASC, created_at ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            )
            UPDATE jobs j
            SET status = 'processing',
                locked_by = $1,
                locked_until = now() + ($2::bigint * interval '1 millisecond'),
                updated_at = now()
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING j.*
            "#,
        )
        .bind(worker_id)
        .bind(lease_ms)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn reap_expired_leases(&self) -> Result<u64, StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                locked_by = NULL,
                locked_until = NULL,
                updated_at = now()
            WHERE status = 'processing'
              AND locked_until IS NOT NULL
              AND locked_until < now()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                locked_by = NULL,
                locked_until = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::LeaseLost { job_id });
        }
        Ok(())
    }

    async fn fail_transient(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailOutcome, StoreError> {
        let row = sqlx::query_as::<_, (String, i32, DateTime<Utc>)>(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                status = CASE WHEN attempts + 1 < max_attempts THEN 'pending' ELSE 'failed' END,
                run_at = CASE WHEN attempts + 1 < max_attempts THEN $3 ELSE run_at END,
                last_error = $4,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            RETURNING status, attempts, run_at
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(retry_at)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, attempts, run_at)) = row else {
            return Err(StoreError::LeaseLost { job_id });
        };

        match JobStatus::parse(&status) {
            Some(JobStatus::Pending) => Ok(FailOutcome::Requeued { attempts, run_at }),
            _ => Ok(FailOutcome::Failed { attempts }),
        }
    }

    async fn fail_permanent(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $3,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = now()
            WHERE id = $1
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        // Someone else holds the lease now (reaped and reclaimed).
        if res.rows_affected() == 0 {
            return Err(StoreError::LeaseLost { job_id });
        }
        Ok(())
    }

    // ----------------------------
    // Reads
    // ----------------------------

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        let limit = limit.clamp(1, 500);

        let rows = match status {
            Some(st) => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT *
                    FROM jobs
                    WHERE status = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2
                    "#,
                )
                .bind(st.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT *
                    FROM jobs
                    ORDER BY created_at DESC, id DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    async fn counts(&self) -> Result<JobCounts, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = n,
                Some(JobStatus::Processing) => counts.processing = n,
                Some(JobStatus::Completed) => counts.completed = n,
                Some(JobStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }
}
