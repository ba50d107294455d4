use crate::clients::ClientError;
use crate::jobs::retry::ErrorClass;
use crate::store::StoreError;
use thiserror::Error;

/// Errors returned by pipelines to the worker pool.
///
/// The worker never inspects messages; it only asks for [`PipelineError::class`]
/// to decide between retry, permanent failure and completion.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing prerequisite data or an invalid request. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The job payload did not decode into its job type.
    #[error("bad payload: {0}")]
    BadPayload(String),

    #[error("no handler for job_type={0}")]
    UnknownJobType(String),

    /// An external system call failed after the client's own retries.
    #[error("{step} failed: {source}")]
    Client {
        step: &'static str,
        #[source]
        source: ClientError,
    },

    /// A pipeline step failed for a reason other than a client error
    /// (readiness timeout, failed build, ...).
    #[error("{0}")]
    Failed(String),

    /// The deployment was cancelled or the worker aborted the job.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn client(step: &'static str, source: ClientError) -> Self {
        Self::Client { step, source }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::BadPayload(_) | Self::UnknownJobType(_) => {
                ErrorClass::NonRetryable
            }
            Self::Store(StoreError::NotFound { .. }) => ErrorClass::NonRetryable,
            Self::Client { source, .. } if source.is_permanent() => ErrorClass::NonRetryable,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Client { .. } | Self::Failed(_) | Self::Store(_) => ErrorClass::Retryable,
        }
    }

    /// Stable code recorded with job failures.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::BadPayload(_) => "BAD_PAYLOAD",
            Self::UnknownJobType(_) => "UNKNOWN_JOB_TYPE",
            Self::Client { source, .. } if source.is_transient() => "DEPENDENCY_DOWN",
            Self::Client { .. } => "CLIENT_ERROR",
            Self::Failed(_) => "PIPELINE_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Store(_) => "STORE",
        }
    }
}
