use crate::error::PipelineError;
use crate::jobs::{
    model::Job,
    queue::{FailOutcome, JobQueue},
    retry::{next_delay, ErrorClass, RetryConfig},
};
use crate::store::StoreError;
use chrono::Utc;
use rand::{rngs::StdRng, SeedableRng};
use std::sync::Arc;
use tracing::{info, warn};

/// What the runner did with a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Requeued,
    Failed,
}

/// Turns a pipeline result into the matching queue transition.
#[derive(Clone)]
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    retry_cfg: RetryConfig,
}

impl JobRunner {
    pub fn new(queue: Arc<dyn JobQueue>, retry_cfg: RetryConfig) -> Self {
        Self { queue, retry_cfg }
    }

    pub async fn settle(
        &self,
        job: &Job,
        worker_id: &str,
        result: Result<(), PipelineError>,
        aborted: bool,
    ) -> Result<Settlement, StoreError> {
        match result {
            Ok(()) => {
                self.queue.complete(job.id, worker_id).await?;
                Ok(Settlement::Completed)
            }
            Err(err) => self.on_failure(job, worker_id, &err, aborted).await,
        }
    }

    pub async fn on_failure(
        &self,
        job: &Job,
        worker_id: &str,
        err: &PipelineError,
        aborted: bool,
    ) -> Result<Settlement, StoreError> {
        let message = format!("[{}] {}", err.code(), err);

        match err.class() {
            // Cancelled by the user: the deployment already records it, the
            // job has nothing left to do.
            ErrorClass::Cancelled if !aborted => {
                self.queue.complete(job.id, worker_id).await?;
                info!(job_id = %job.id, "job stopped after cancellation");
                Ok(Settlement::Completed)
            }
            ErrorClass::NonRetryable => {
                self.queue
                    .fail_permanent(job.id, worker_id, &message)
                    .await?;
                warn!(job_id = %job.id, code = err.code(), error = %err, "job failed permanently");
                Ok(Settlement::Failed)
            }
            // Retryable, or cancelled because the worker itself was aborted.
            ErrorClass::Retryable | ErrorClass::Cancelled => {
                let mut rng = StdRng::from_entropy();
                let delay = next_delay(job.attempts + 1, &self.retry_cfg, &mut rng);
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(1));

                match self
                    .queue
                    .fail_transient(job.id, worker_id, &message, retry_at)
                    .await?
                {
                    FailOutcome::Requeued { attempts, run_at } => {
                        warn!(
                            job_id = %job.id,
                            attempts,
                            max_attempts = job.max_attempts,
                            %run_at,
                            error = %err,
                            "job failed, requeued"
                        );
                        Ok(Settlement::Requeued)
                    }
                    FailOutcome::Failed { attempts } => {
                        warn!(
                            job_id = %job.id,
                            attempts,
                            error = %err,
                            "job failed, retries exhausted"
                        );
                        Ok(Settlement::Failed)
                    }
                }
            }
        }
    }
}
