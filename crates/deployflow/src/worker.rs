//! Fixed-size pool of workers draining the job queue.
//!
//! Each worker loops: reap expired leases when due, claim one job, decode its
//! payload, run the pipeline, settle the job row. Workers share nothing but
//! the queue, which is the only arbiter of who runs what.

use crate::error::PipelineError;
use crate::jobs::retry::RetryConfig;
use crate::jobs::{DecodeError, Job, JobPayload, JobRunner, Settlement};
use crate::pipelines::{dispatch, Attempt, PipelineContext};
use crate::store::StoreError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix for per-task worker ids (`{worker_id}-{n}`).
    pub worker_id: String,
    pub workers: usize,
    pub poll_interval: Duration,
    /// How long a claim is held before another worker may reap it.
    pub lease: Duration,
    pub reap_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(15 * 60),
            reap_interval: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    ctx: Arc<PipelineContext>,
    runner: JobRunner,
    cfg: WorkerPoolConfig,
    abort: CancellationToken,
}

impl WorkerPool {
    pub fn new(ctx: PipelineContext, cfg: WorkerPoolConfig) -> Self {
        let runner = JobRunner::new(ctx.queue.clone(), cfg.retry.clone());
        Self {
            ctx: Arc::new(ctx),
            runner,
            cfg,
            abort: CancellationToken::new(),
        }
    }

    /// Cancelling this token interrupts in-flight jobs; they are requeued
    /// rather than completed. A plain shutdown lets them finish instead.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Runs `workers` tasks until `shutdown` is cancelled and every in-flight
    /// job has settled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            workers = self.cfg.workers,
            poll_interval_ms = self.cfg.poll_interval.as_millis() as u64,
            lease_secs = self.cfg.lease.as_secs(),
            "worker pool starting"
        );

        let mut set = JoinSet::new();
        for n in 0..self.cfg.workers.max(1) {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("{}-{n}", self.cfg.worker_id);
            set.spawn(async move { pool.worker_loop(worker_id, shutdown).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        let mut last_reap: Option<Instant> = None;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Reclaim jobs from dead workers on a fixed interval, not every poll.
            if last_reap.map_or(true, |t| t.elapsed() >= self.cfg.reap_interval) {
                match self.ctx.queue.reap_expired_leases().await {
                    Ok(0) => {}
                    Ok(n) => info!(%worker_id, reaped = n, "reaped expired leases"),
                    Err(e) => warn!(%worker_id, error = %e, "lease reaping failed"),
                }
                last_reap = Some(Instant::now());
            }

            let idle = match self.work_one(&worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(%worker_id, error = %e, "queue error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                }
            }
        }

        debug!(%worker_id, "worker stopped");
    }

    /// Claims and runs at most one job. `None` when nothing was eligible.
    pub async fn work_one(&self, worker_id: &str) -> Result<Option<Settlement>, StoreError> {
        let Some(job) = self
            .ctx
            .queue
            .claim_next(worker_id, self.cfg.lease)
            .await?
        else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            worker_id = %worker_id
        );
        self.execute(job, worker_id).instrument(span).await.map(Some)
    }

    async fn execute(&self, job: Job, worker_id: &str) -> Result<Settlement, StoreError> {
        let started = Instant::now();
        let result = match JobPayload::decode(&job.job_type, &job.payload_json) {
            Err(DecodeError::UnknownType(job_type)) => Err(PipelineError::UnknownJobType(job_type)),
            Err(e) => Err(PipelineError::BadPayload(e.to_string())),
            Ok(payload) => {
                let cancel = self.abort.child_token();
                dispatch(&self.ctx, payload, Attempt::of(&job), &cancel).await
            }
        };

        let aborted = self.abort.is_cancelled();
        let settled = self.runner.settle(&job, worker_id, result, aborted).await;
        match &settled {
            Ok(outcome) => debug!(
                ?outcome,
                latency_ms = started.elapsed().as_millis() as u64,
                "job settled"
            ),
            Err(StoreError::LeaseLost { .. }) => {
                warn!("lease was reaped while the job ran; result dropped")
            }
            Err(e) => error!(error = %e, "could not settle job"),
        }
        settled
    }
}
